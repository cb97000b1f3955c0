use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rrule::{RRuleSet, Tz as RRuleTz};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::timezone::parse_timezone;

/// Hard ceiling on occurrences produced by one expansion.
pub const MAX_OCCURRENCES: usize = 1000;

const UNTIL_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Parts that would generate more than one occurrence per day.
const SUB_DAY_PARTS: [&str; 3] = ["BYHOUR", "BYMINUTE", "BYSECOND"];

/// Recurrence frequencies this product schedules. Sub-daily ones are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "DAILY"),
            Frequency::Weekly => write!(f, "WEEKLY"),
            Frequency::Monthly => write!(f, "MONTHLY"),
            Frequency::Yearly => write!(f, "YEARLY"),
        }
    }
}

impl FromStr for Frequency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "YEARLY" => Ok(Frequency::Yearly),
            "HOURLY" | "MINUTELY" | "SECONDLY" => Err(CoreError::InvalidRule(format!(
                "sub-daily frequency {} is not supported",
                s
            ))),
            _ => Err(CoreError::InvalidRule(format!("unknown frequency '{}'", s))),
        }
    }
}

/// Structured form of an RRULE value.
///
/// `FREQ`, `COUNT` and `UNTIL` are typed; every other part is carried through
/// verbatim (upper-cased) in source order. Serializes back with `FREQ` first and
/// the bound last, `UNTIL` always in UTC form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    freq: Frequency,
    count: Option<u32>,
    until: Option<DateTime<Utc>>,
    parts: Vec<(String, String)>,
}

impl RecurrenceRule {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let body = text.trim();
        let body = match body.get(..6) {
            Some(prefix) if prefix.eq_ignore_ascii_case("RRULE:") => &body[6..],
            _ => body,
        };

        if body.is_empty() {
            return Err(CoreError::InvalidRule("empty rule".to_string()));
        }
        if body.contains('\n') || body.contains('\r') {
            return Err(CoreError::InvalidRule(
                "expected a single RRULE value without DTSTART".to_string(),
            ));
        }

        let mut freq = None;
        let mut count = None;
        let mut until = None;
        let mut parts = Vec::new();
        let mut seen = HashSet::new();

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CoreError::InvalidRule(format!("malformed part '{}'", part)))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();

            if value.is_empty() {
                return Err(CoreError::InvalidRule(format!("{} has no value", key)));
            }
            if !seen.insert(key.clone()) {
                return Err(CoreError::InvalidRule(format!("duplicate {} part", key)));
            }

            match key.as_str() {
                "FREQ" => freq = Some(value.parse::<Frequency>()?),
                "COUNT" => {
                    let n = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| CoreError::InvalidRule(format!("invalid COUNT '{}'", value)))?;
                    count = Some(n);
                }
                "UNTIL" => until = Some(parse_until(value)?),
                k if SUB_DAY_PARTS.contains(&k) => {
                    return Err(CoreError::InvalidRule(format!(
                        "{} is not supported; sub-day recurrences are not scheduled",
                        k
                    )));
                }
                _ => parts.push((key, value.to_ascii_uppercase())),
            }
        }

        let freq = freq.ok_or_else(|| CoreError::InvalidRule("missing FREQ".to_string()))?;
        if count.is_some() && until.is_some() {
            return Err(CoreError::InvalidRule(
                "COUNT and UNTIL are mutually exclusive".to_string(),
            ));
        }

        Ok(Self {
            freq,
            count,
            until,
            parts,
        })
    }

    pub fn frequency(&self) -> Frequency {
        self.freq
    }

    pub fn count(&self) -> Option<u32> {
        self.count
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    /// Whether the rule generates a bounded number of occurrences
    pub fn is_bounded(&self) -> bool {
        self.count.is_some() || self.until.is_some()
    }

    /// Removes any `UNTIL`/`COUNT` bound.
    pub fn strip_bounds(mut self) -> Self {
        self.count = None;
        self.until = None;
        self
    }

    /// Replaces any bound with `UNTIL=until` (second precision).
    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.count = None;
        self.until = Some(truncate_to_seconds(until));
        self
    }

    /// Replaces any bound with `COUNT=count`.
    pub fn with_count(mut self, count: u32) -> Self {
        self.until = None;
        self.count = Some(count);
        self
    }

    /// Builds the `rrule` crate's set anchored at `dtstart`.
    ///
    /// With a timezone the rule is evaluated in local wall-clock time, so
    /// occurrences keep their local hour across DST changes.
    pub fn to_rrule_set(
        &self,
        dtstart: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<RRuleSet, CoreError> {
        let header = match timezone {
            Some(name) => {
                let tz = parse_timezone(name)?;
                format!(
                    "DTSTART;TZID={}:{}",
                    name,
                    dtstart.with_timezone(&tz).format("%Y%m%dT%H%M%S")
                )
            }
            None => format!("DTSTART:{}", dtstart.format(UNTIL_FORMAT)),
        };

        format!("{}\nRRULE:{}", header, self)
            .parse::<RRuleSet>()
            .map_err(|e| CoreError::InvalidRule(e.to_string()))
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.freq)?;
        for (key, value) in &self.parts {
            write!(f, ";{}={}", key, value)?;
        }
        if let Some(count) = self.count {
            write!(f, ";COUNT={}", count)?;
        }
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format(UNTIL_FORMAT))?;
        }
        Ok(())
    }
}

impl FromStr for RecurrenceRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validates rule text on its own, without a series to anchor it.
///
/// Returns the parsed rule so callers can store its normalized form.
pub fn validate_rule(text: &str) -> Result<RecurrenceRule, CoreError> {
    let rule = RecurrenceRule::parse(text)?;
    let anchor = Utc
        .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| CoreError::InvalidRule("invalid validation anchor".to_string()))?;
    // UNTIL before DTSTART is rejected by the rule library
    let anchor = rule.until.map_or(anchor, |until| until.min(anchor));
    rule.to_rrule_set(anchor, None)?;
    Ok(rule)
}

/// Validates rule text as it would be evaluated for a concrete series.
pub fn validate_rule_for(
    text: &str,
    dtstart: DateTime<Utc>,
    timezone: Option<&str>,
) -> Result<RecurrenceRule, CoreError> {
    let rule = RecurrenceRule::parse(text)?;
    rule.to_rrule_set(dtstart, timezone)?;
    Ok(rule)
}

/// Bounded slice of a rule's occurrences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceWindow {
    pub dates: Vec<DateTime<Utc>>,
    /// The occurrence limit was hit; later occurrences in range were dropped
    pub truncated: bool,
}

/// Occurrence sequence of one rule anchored at a start instant.
///
/// Holds only the immutable rule set; every query works on its own iterator, so
/// the sequence is restartable and safe to share between threads.
#[derive(Debug, Clone)]
pub struct Occurrences {
    set: RRuleSet,
}

impl Occurrences {
    pub fn new(
        rule: &RecurrenceRule,
        dtstart: DateTime<Utc>,
        timezone: Option<&str>,
        ex_dates: &[DateTime<Utc>],
    ) -> Result<Self, CoreError> {
        let set = ex_dates
            .iter()
            .fold(rule.to_rrule_set(dtstart, timezone)?, |set, exdate| {
                set.exdate(to_rrule_tz(*exdate))
            });
        Ok(Self { set })
    }

    /// Lazily iterates every occurrence from the anchor onwards.
    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (&self.set).into_iter().map(|dt| dt.with_timezone(&Utc))
    }

    /// Occurrences starting in `[start, end)`, at most `limit` of them.
    ///
    /// One occurrence past the limit is looked up so `truncated` is only set
    /// when something in range was actually dropped.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>, limit: usize) -> OccurrenceWindow {
        let limit = limit.min(MAX_OCCURRENCES);
        let mut dates: Vec<DateTime<Utc>> = self
            .iter()
            .skip_while(|dt| *dt < start)
            .take_while(|dt| *dt < end)
            .take(limit + 1)
            .collect();

        let truncated = dates.len() > limit;
        dates.truncate(limit);
        OccurrenceWindow { dates, truncated }
    }

    /// Whether `instant` is one of the (non-excluded) occurrences.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let margin = Duration::seconds(1);
        self.between(instant - margin, instant + margin, 3)
            .dates
            .contains(&instant)
    }

    /// Number of occurrences strictly before `instant`, counting at most `limit`.
    pub fn count_before(&self, instant: DateTime<Utc>, limit: usize) -> usize {
        self.iter().take_while(|dt| *dt < instant).take(limit).count()
    }
}

/// Parses `text` and returns its occurrence sequence anchored at `dtstart`.
pub fn iterate(text: &str, dtstart: DateTime<Utc>) -> Result<Occurrences, CoreError> {
    let rule = RecurrenceRule::parse(text)?;
    Occurrences::new(&rule, dtstart, None, &[])
}

#[inline]
fn to_rrule_tz(dt: DateTime<Utc>) -> DateTime<RRuleTz> {
    dt.with_timezone(&RRuleTz::UTC)
}

pub(crate) fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

/// Accepts `YYYYMMDDTHHMMSSZ`, floating `YYYYMMDDTHHMMSS` (read as UTC) and
/// date-only `YYYYMMDD` (end of that day, UTC).
fn parse_until(value: &str) -> Result<DateTime<Utc>, CoreError> {
    let upper = value.to_ascii_uppercase();
    let invalid = || CoreError::InvalidRule(format!("invalid UNTIL '{}'", value));

    if upper.contains('T') {
        let naive = upper.strip_suffix('Z').unwrap_or(&upper);
        NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
            .map(|dt| dt.and_utc())
            .map_err(|_| invalid())
    } else {
        NaiveDate::parse_from_str(&upper, "%Y%m%d")
            .ok()
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc())
            .ok_or_else(invalid)
    }
}

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::overrides::{apply_override, occurrence_duration};
use super::rule::{Occurrences, RecurrenceRule, MAX_OCCURRENCES};
use super::{overlaps, ExpandedInstance, Recurrable};
use crate::error::CoreError;
use crate::models::SeriesException;

/// Limits applied to every expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionLimits {
    /// Maximum instances returned per series per call; never above [`MAX_OCCURRENCES`]
    pub max_occurrences: usize,
}

impl ExpansionLimits {
    pub fn new(max_occurrences: usize) -> Self {
        Self {
            max_occurrences: max_occurrences.clamp(1, MAX_OCCURRENCES),
        }
    }
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            max_occurrences: MAX_OCCURRENCES,
        }
    }
}

/// Result of an expansion together with whether the occurrence limit cut it short.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion<T> {
    pub instances: Vec<ExpandedInstance<T>>,
    pub truncated: bool,
}

impl<T> Expansion<T> {
    fn complete(instances: Vec<ExpandedInstance<T>>) -> Self {
        Self {
            instances,
            truncated: false,
        }
    }
}

/// Turns a series plus its exceptions into the concrete instances that overlap
/// a time window.
///
/// Expansion is a pure function of its inputs: nothing is cached between calls
/// and the series is never modified.
#[derive(Debug, Clone, Default)]
pub struct RecurrenceExpander {
    limits: ExpansionLimits,
}

impl RecurrenceExpander {
    pub fn new(limits: ExpansionLimits) -> Self {
        Self { limits }
    }

    pub fn with_defaults() -> Self {
        Self::default()
    }

    pub fn limits(&self) -> &ExpansionLimits {
        &self.limits
    }

    /// Instances of `series` overlapping `[window_start, window_end)`, sorted by
    /// start.
    ///
    /// Non-recurring and detached records come back as a single pass-through
    /// instance without a window check.
    pub fn expand<T: Recurrable>(
        &self,
        series: &T,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        exceptions: &[SeriesException<T::Patch>],
    ) -> Result<Vec<ExpandedInstance<T>>, CoreError> {
        self.expand_report(series, window_start, window_end, exceptions)
            .map(|expansion| expansion.instances)
    }

    /// Same as [`expand`](Self::expand) with RFC 3339 window bounds.
    pub fn expand_iso<T: Recurrable>(
        &self,
        series: &T,
        window_start: &str,
        window_end: &str,
        exceptions: &[SeriesException<T::Patch>],
    ) -> Result<Vec<ExpandedInstance<T>>, CoreError> {
        let window_start = parse_instant(window_start)?;
        let window_end = parse_instant(window_end)?;
        self.expand(series, window_start, window_end, exceptions)
    }

    /// Full expansion result, including the truncation flag.
    pub fn expand_report<T: Recurrable>(
        &self,
        series: &T,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        exceptions: &[SeriesException<T::Patch>],
    ) -> Result<Expansion<T>, CoreError> {
        if window_end < window_start {
            return Err(CoreError::InvalidInput(format!(
                "window end {} is before window start {}",
                window_end, window_start
            )));
        }

        let rrule = match series.rrule() {
            Some(rrule) if series.recurring_parent_id().is_none() => rrule,
            _ => {
                return Ok(Expansion::complete(vec![ExpandedInstance::passthrough(
                    series.clone(),
                )]))
            }
        };

        let rule = RecurrenceRule::parse(rrule)?;
        let occurrences = Occurrences::new(&rule, series.start_at(), series.timezone(), series.ex_dates())?;
        let duration = occurrence_duration(series);
        let limit = self.limits.max_occurrences;

        // Occurrences starting up to one duration before the window still overlap it
        let window = occurrences.between(window_start - duration, window_end, limit);

        let mut pending = live_exceptions(series, exceptions);
        let mut instances = Vec::with_capacity(window.dates.len());

        for occurrence in &window.dates {
            let exception = pending.remove(occurrence);
            if let Some(instance) =
                materialize(series, *occurrence, duration, exception, window_start, window_end)
            {
                instances.push(instance);
            }
        }

        // An override may move an occurrence generated outside the window into it
        for (occurrence, exception) in pending {
            let Some(instance) = materialize(
                series,
                occurrence,
                duration,
                Some(exception),
                window_start,
                window_end,
            ) else {
                continue;
            };

            if occurrences.contains(occurrence) {
                instances.push(instance);
            } else {
                debug!(
                    series_id = %series.id(),
                    exception_id = %exception.id,
                    occurrence = %occurrence,
                    "Ignoring exception that matches no occurrence"
                );
            }
        }

        instances.sort_by(|a, b| {
            a.start_at()
                .cmp(&b.start_at())
                .then(a.occurrence_instant.cmp(&b.occurrence_instant))
        });

        let truncated = window.truncated || instances.len() > limit;
        if truncated {
            warn!(
                series_id = %series.id(),
                limit,
                window_start = %window_start,
                window_end = %window_end,
                "Occurrence limit reached; expansion truncated"
            );
            instances.truncate(limit);
        }

        Ok(Expansion {
            instances,
            truncated,
        })
    }
}

/// Live exceptions of this series keyed by occurrence instant. When several
/// live exceptions share an instant the most recently created one wins.
fn live_exceptions<'a, T: Recurrable>(
    series: &T,
    exceptions: &'a [SeriesException<T::Patch>],
) -> HashMap<DateTime<Utc>, &'a SeriesException<T::Patch>> {
    let mut by_instant: HashMap<DateTime<Utc>, &SeriesException<T::Patch>> = HashMap::new();
    for exception in exceptions
        .iter()
        .filter(|e| e.is_live() && e.series_id == series.id())
    {
        by_instant
            .entry(exception.occurrence_instant)
            .and_modify(|current| {
                if exception.created_at > current.created_at {
                    *current = exception;
                }
            })
            .or_insert(exception);
    }
    by_instant
}

fn materialize<T: Recurrable>(
    series: &T,
    occurrence: DateTime<Utc>,
    duration: chrono::Duration,
    exception: Option<&SeriesException<T::Patch>>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<ExpandedInstance<T>> {
    let mut item = series.clone();
    item.set_span(occurrence, occurrence + duration);

    let item = match exception {
        Some(exception) => apply_override(&item, exception),
        None => item,
    };

    overlaps(item.start_at(), item.end_at(), window_start, window_end).then(|| ExpandedInstance {
        series_id: series.id(),
        occurrence_instant: occurrence,
        exception_id: exception.map(|e| e.id),
        item,
    })
}

pub(crate) fn parse_instant(value: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidInput(format!("invalid timestamp '{}': {}", value, e)))
}

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::recurrence::{overlaps, ExpandedInstance, Expansion, Recurrable, RecurrenceExpander};
use crate::repository::{ExceptionQuery, SeriesStore};
use crate::timezone::{local_date, validate_timezone};

/// Read side of the engine: loads records and exceptions from a store and
/// expands them for a time window.
#[derive(Debug, Clone)]
pub struct AgendaService<S> {
    store: S,
    expander: RecurrenceExpander,
    default_timezone: String,
}

impl<S> AgendaService<S> {
    pub fn new(store: S, expander: RecurrenceExpander) -> Self {
        Self {
            store,
            expander,
            default_timezone: "UTC".to_string(),
        }
    }

    pub fn from_config(store: S, config: &EngineConfig) -> Self {
        Self {
            store,
            expander: RecurrenceExpander::new(config.expansion_limits()),
            default_timezone: config.default_timezone.clone(),
        }
    }

    pub fn expander(&self) -> &RecurrenceExpander {
        &self.expander
    }

    /// Instances of one series owned by `user_id` in `[start, end)`.
    pub async fn occurrences<T>(
        &self,
        user_id: Uuid,
        series_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Expansion<T>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        let series = self
            .store
            .get_series(series_id)
            .await?
            .filter(|s| s.user_id() == user_id)
            .ok_or(CoreError::SeriesNotFound(series_id))?;

        let exceptions = self.store.get_exceptions(series_id, ExceptionQuery::All).await?;
        self.expander.expand_report(&series, start, end, &exceptions)
    }

    /// Every live record of a user that overlaps `[start, end)`, recurring ones
    /// expanded, sorted by start.
    ///
    /// A series whose stored rule or timezone no longer parses is logged and
    /// shown as its single stored record rather than failing the whole agenda.
    pub async fn agenda<T>(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ExpandedInstance<T>>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        if end < start {
            return Err(CoreError::InvalidInput(format!(
                "window end {} is before window start {}",
                end, start
            )));
        }

        let records = self.store.find_series_for_user(user_id).await?;
        let mut agenda = Vec::new();

        for record in records {
            let exceptions = if record.is_series() {
                self.store.get_exceptions(record.id(), ExceptionQuery::All).await?
            } else {
                Vec::new()
            };

            match self.expander.expand(&record, start, end, &exceptions) {
                Ok(instances) => agenda.extend(
                    instances
                        .into_iter()
                        .filter(|i| overlaps(i.start_at(), i.end_at(), start, end)),
                ),
                Err(err @ (CoreError::InvalidRule(_) | CoreError::InvalidTimezone(_))) => {
                    error!(series_id = %record.id(), error = %err, "Stored series cannot be expanded; showing it as a single record");
                    if overlaps(record.start_at(), record.end_at(), start, end) {
                        agenda.push(ExpandedInstance::passthrough(record));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        agenda.sort_by_key(|i| (i.start_at(), i.end_at()));
        debug!(user_id = %user_id, instances = agenda.len(), "Built agenda");
        Ok(agenda)
    }

    /// [`agenda`](Self::agenda) grouped by local calendar day in `timezone`,
    /// or the configured default timezone.
    pub async fn agenda_by_day<T>(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<BTreeMap<NaiveDate, Vec<ExpandedInstance<T>>>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        let timezone = timezone.unwrap_or(&self.default_timezone);
        validate_timezone(timezone)?;

        let mut days: BTreeMap<NaiveDate, Vec<ExpandedInstance<T>>> = BTreeMap::new();
        for instance in self.agenda(user_id, start, end).await? {
            let day = local_date(instance.start_at(), timezone)?;
            days.entry(day).or_default().push(instance);
        }
        Ok(days)
    }
}

//! Recurrence engine shared by events and tasks.
//!
//! - [`rule`]: RRULE parsing, validation and occurrence iteration
//! - [`expander`]: window expansion of a series into concrete instances
//! - [`overrides`]: application of per-occurrence exception overrides

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod expander;
pub mod overrides;
pub mod rule;

pub use expander::{Expansion, ExpansionLimits, RecurrenceExpander};
pub use overrides::{apply_override, apply_patch};
pub use rule::{validate_rule, Frequency, Occurrences, RecurrenceRule, MAX_OCCURRENCES};

/// Capability set the engine needs from a recurring record.
///
/// Events and tasks implement this; the expander and the mutation coordinator
/// are written against it only.
pub trait Recurrable: Clone + fmt::Debug + Send + Sync {
    /// Sparse field override record used for exceptions and edits
    type Patch: Clone
        + Default
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    fn id(&self) -> Uuid;
    fn set_id(&mut self, id: Uuid);
    fn user_id(&self) -> Uuid;

    fn start_at(&self) -> DateTime<Utc>;
    fn end_at(&self) -> DateTime<Utc>;
    fn set_span(&mut self, start_at: DateTime<Utc>, end_at: DateTime<Utc>);

    fn rrule(&self) -> Option<&str>;
    fn set_rrule(&mut self, rrule: Option<String>);
    fn timezone(&self) -> Option<&str>;

    fn ex_dates(&self) -> &[DateTime<Utc>];
    fn set_ex_dates(&mut self, ex_dates: Vec<DateTime<Utc>>);

    fn recurring_parent_id(&self) -> Option<Uuid>;
    fn is_deleted(&self) -> bool;

    /// Prepares a cloned record to be stored as a brand-new row
    fn reset_timestamps(&mut self, now: DateTime<Utc>);
    fn touch(&mut self, now: DateTime<Utc>);

    /// Time fields carried by a patch, as `(start, end)`
    fn patch_span(patch: &Self::Patch) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

    /// Applies every non-time field present in the patch
    fn apply_fields(&mut self, patch: &Self::Patch);

    fn is_series(&self) -> bool {
        self.rrule().is_some()
    }

    /// Nominal duration of one occurrence; may be negative for malformed records
    fn duration(&self) -> Duration {
        self.end_at() - self.start_at()
    }
}

/// One materialized occurrence of a series. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedInstance<T> {
    pub series_id: Uuid,
    /// Start of the occurrence as generated by the rule, before overrides
    pub occurrence_instant: DateTime<Utc>,
    /// Exception applied to this occurrence, if any
    pub exception_id: Option<Uuid>,
    /// Series fields with the occurrence's (possibly overridden) values
    pub item: T,
}

impl<T: Recurrable> ExpandedInstance<T> {
    /// Wraps a record that does not expand (non-recurring or detached).
    pub fn passthrough(item: T) -> Self {
        Self {
            series_id: item.id(),
            occurrence_instant: item.start_at(),
            exception_id: None,
            item,
        }
    }

    #[inline]
    pub fn start_at(&self) -> DateTime<Utc> {
        self.item.start_at()
    }

    #[inline]
    pub fn end_at(&self) -> DateTime<Utc> {
        self.item.end_at()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.exception_id.is_some()
    }
}

/// Half-open overlap test used for window membership.
#[inline]
pub(crate) fn overlaps(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> bool {
    start < window_end && end > window_start
}

//! Scoped edits and deletes of recurring records.
//!
//! A mutation on a recurring series touches one occurrence (`instance`), the
//! occurrence and everything after it (`following`), or the whole series
//! (`all`). The coordinator works out which transition applies, plans it as a
//! list of [`StoreOp`]s and hands the batch to the store in one atomic apply.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Mutation, Scope, SeriesEdit, SeriesException};
use crate::recurrence::rule::{truncate_to_seconds, validate_rule_for};
use crate::recurrence::{apply_patch, Occurrences, Recurrable, RecurrenceRule};
use crate::repository::{ExceptionQuery, SeriesStore, StoreOp};
use crate::timezone::validate_optional_timezone;

/// What a mutation did.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedResult<T: Recurrable> {
    /// A non-recurring record or a whole series was updated in place
    Updated(T),
    /// A non-recurring record or a whole series was soft-deleted
    Deleted { id: Uuid },
    /// One occurrence now carries this override
    ExceptionWritten(SeriesException<T::Patch>),
    /// One occurrence was added to the series' exclusions
    InstanceExcluded {
        series: T,
        instance_date: DateTime<Utc>,
    },
    /// The series was ended before the occurrence and continued by `tail`
    SeriesSplit { parent: T, tail: T },
    /// The series was ended before the occurrence
    SeriesTruncated(T),
}

/// Transition picked for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Direct,
    All,
    Instance(DateTime<Utc>),
    Following(DateTime<Utc>),
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Direct => write!(f, "direct"),
            Transition::All => write!(f, "all"),
            Transition::Instance(at) => write!(f, "instance@{}", at),
            Transition::Following(at) => write!(f, "following@{}", at),
        }
    }
}

struct Plan<T: Recurrable> {
    ops: Vec<StoreOp<T>>,
    result: AppliedResult<T>,
}

/// Coordinates scoped mutations against a [`SeriesStore`].
///
/// Mutations on the same target id are serialized in-process; the store's
/// atomic `apply` covers everything else.
pub struct ScopedMutationCoordinator<S> {
    store: S,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S> ScopedMutationCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lease(&self, id: Uuid) -> LockLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(id).or_default().clone();
        LockLease {
            locks: &self.locks,
            id,
            lock,
        }
    }

    /// Validates and stores a new record. A rule is stored in normalized form.
    pub async fn create<T>(&self, mut item: T) -> Result<T, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        validate_optional_timezone(item.timezone())?;
        if let Some(text) = item.rrule().map(str::to_owned) {
            align_to_seconds(&mut item);
            let rule = validate_rule_for(&text, item.start_at(), item.timezone())?;
            item.set_rrule(Some(rule.to_string()));
        }

        self.store.insert_series(&item).await?;
        debug!(series_id = %item.id(), recurring = item.is_series(), "Created record");
        Ok(item)
    }

    pub async fn update<T>(
        &self,
        user_id: Uuid,
        target_id: Uuid,
        edit: SeriesEdit<T::Patch>,
        scope: Option<Scope>,
        instance_date: Option<DateTime<Utc>>,
    ) -> Result<AppliedResult<T>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        self.mutate(user_id, target_id, Mutation::Update(edit), scope, instance_date)
            .await
    }

    pub async fn delete<T>(
        &self,
        user_id: Uuid,
        target_id: Uuid,
        scope: Option<Scope>,
        instance_date: Option<DateTime<Utc>>,
    ) -> Result<AppliedResult<T>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        self.mutate(user_id, target_id, Mutation::Delete, scope, instance_date)
            .await
    }

    /// Applies an update or delete with the given scope.
    ///
    /// Records that do not recur are changed directly whatever the scope. On a
    /// series, no scope means `all`; `instance` and `following` need
    /// `instance_date`, which must be an occurrence of the series.
    pub async fn mutate<T>(
        &self,
        user_id: Uuid,
        target_id: Uuid,
        mutation: Mutation<T::Patch>,
        scope: Option<Scope>,
        instance_date: Option<DateTime<Utc>>,
    ) -> Result<AppliedResult<T>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        let lease = self.lease(target_id);
        let _guard = lease.lock.lock().await;
        self.mutate_locked(user_id, target_id, mutation, scope, instance_date)
            .await
    }

    async fn mutate_locked<T>(
        &self,
        user_id: Uuid,
        target_id: Uuid,
        mutation: Mutation<T::Patch>,
        scope: Option<Scope>,
        instance_date: Option<DateTime<Utc>>,
    ) -> Result<AppliedResult<T>, CoreError>
    where
        T: Recurrable,
        S: SeriesStore<T>,
    {
        let series = self
            .store
            .get_series(target_id)
            .await?
            .filter(|s| s.user_id() == user_id && !s.is_deleted())
            .ok_or(CoreError::SeriesNotFound(target_id))?;

        let transition = resolve_transition(&series, scope, instance_date)?;
        debug!(
            series_id = %target_id,
            transition = %transition,
            delete = matches!(mutation, Mutation::Delete),
            "Applying scoped mutation"
        );

        let query = match (transition, &mutation) {
            (Transition::Instance(at), _) => Some(ExceptionQuery::At(vec![at])),
            (Transition::Following(at), _) => Some(ExceptionQuery::OnOrAfter(at)),
            (Transition::All, Mutation::Delete) => Some(ExceptionQuery::All),
            _ => None,
        };
        let exceptions = match query {
            Some(query) => self.store.get_exceptions(target_id, query).await?,
            None => Vec::new(),
        };

        let plan = plan(series, &exceptions, mutation, transition, Utc::now())?;
        debug!(series_id = %target_id, ops = plan.ops.len(), "Committing mutation");
        self.store.apply(plan.ops).await?;
        Ok(plan.result)
    }
}

/// Per-target entry of the coordinator's lock map. Dropping the lease prunes the
/// entry once no other call holds it, including when the call is cancelled
/// while still waiting for the lock.
struct LockLease<'a> {
    locks: &'a StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    id: Uuid,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this lease are the last holders
        let unused = locks
            .get(&self.id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if unused {
            locks.remove(&self.id);
        }
    }
}

/// Rules generate whole-second instants, so a series is anchored on one.
fn align_to_seconds<T: Recurrable>(item: &mut T) {
    let start = truncate_to_seconds(item.start_at());
    let end = truncate_to_seconds(item.end_at());
    item.set_span(start, end);
}

/// Whether the record behaves as an expanding series.
fn expands<T: Recurrable>(item: &T) -> bool {
    item.is_series() && item.recurring_parent_id().is_none()
}

fn resolve_transition<T: Recurrable>(
    series: &T,
    scope: Option<Scope>,
    instance_date: Option<DateTime<Utc>>,
) -> Result<Transition, CoreError> {
    let Some(rrule) = series.rrule().filter(|_| expands(series)) else {
        return Ok(Transition::Direct);
    };

    let scope = scope.unwrap_or(Scope::All);
    if scope == Scope::All {
        return Ok(Transition::All);
    }

    let at = instance_date.ok_or(CoreError::MissingInstanceDate(scope))?;
    let rule = RecurrenceRule::parse(rrule)?;
    let occurrences = Occurrences::new(&rule, series.start_at(), series.timezone(), &[])?;
    if !occurrences.contains(at) {
        return Err(CoreError::InvalidInput(format!(
            "{} is not an occurrence of series {}",
            at,
            series.id()
        )));
    }

    // Following from the first generated occurrence leaves the parent nothing
    let first = occurrences.iter().next();
    Ok(match scope {
        Scope::Following if first == Some(at) => Transition::All,
        Scope::Following => Transition::Following(at),
        _ => Transition::Instance(at),
    })
}

fn plan<T: Recurrable>(
    series: T,
    exceptions: &[SeriesException<T::Patch>],
    mutation: Mutation<T::Patch>,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Plan<T>, CoreError> {
    match (transition, mutation) {
        (Transition::Direct | Transition::All, Mutation::Update(edit)) => {
            update_in_place(series, edit, now)
        }
        (Transition::Direct | Transition::All, Mutation::Delete) => {
            Ok(delete_series(series, exceptions))
        }
        (Transition::Instance(at), Mutation::Update(edit)) => {
            write_exception(series, exceptions, edit, at)
        }
        (Transition::Instance(at), Mutation::Delete) => {
            Ok(exclude_instance(series, exceptions, at, now))
        }
        (Transition::Following(at), Mutation::Update(edit)) => {
            split_following(series, exceptions, edit, at, now)
        }
        (Transition::Following(at), Mutation::Delete) => {
            let rule = series_rule(&series)?;
            let (parent, ops) = truncate_before(series, &rule, exceptions, at, now);
            Ok(Plan {
                ops,
                result: AppliedResult::SeriesTruncated(parent),
            })
        }
    }
}

fn series_rule<T: Recurrable>(series: &T) -> Result<RecurrenceRule, CoreError> {
    series
        .rrule()
        .ok_or_else(|| CoreError::InvalidInput(format!("{} is not a recurring series", series.id())))
        .and_then(RecurrenceRule::parse)
}

fn tombstones<T: Recurrable>(
    exceptions: &[SeriesException<T::Patch>],
    keep: impl Fn(&SeriesException<T::Patch>) -> bool,
) -> Vec<StoreOp<T>> {
    exceptions
        .iter()
        .filter(|e| e.is_live() && keep(e))
        .map(|e| StoreOp::TombstoneException { id: e.id })
        .collect()
}

fn update_in_place<T: Recurrable>(
    series: T,
    edit: SeriesEdit<T::Patch>,
    now: DateTime<Utc>,
) -> Result<Plan<T>, CoreError> {
    let mut updated = apply_patch(&series, &edit.fields);

    match edit.rrule {
        Some(Some(text)) => {
            let rule = validate_rule_for(&text, updated.start_at(), updated.timezone())?;
            updated.set_rrule(Some(rule.to_string()));
        }
        Some(None) => {
            updated.set_rrule(None);
            updated.set_ex_dates(Vec::new());
        }
        None => {
            // A moved start must still satisfy the stored rule's bound
            if let Some(text) = updated.rrule().filter(|_| updated.start_at() != series.start_at()) {
                validate_rule_for(text, updated.start_at(), updated.timezone())?;
            }
        }
    }
    if updated.is_series() {
        align_to_seconds(&mut updated);
    }

    updated.touch(now);
    Ok(Plan {
        ops: vec![StoreOp::UpdateSeries(updated.clone())],
        result: AppliedResult::Updated(updated),
    })
}

fn delete_series<T: Recurrable>(series: T, exceptions: &[SeriesException<T::Patch>]) -> Plan<T> {
    let id = series.id();
    let mut ops = vec![StoreOp::TombstoneSeries { id }];
    ops.extend(tombstones(exceptions, |_| true));
    Plan {
        ops,
        result: AppliedResult::Deleted { id },
    }
}

fn write_exception<T: Recurrable>(
    series: T,
    exceptions: &[SeriesException<T::Patch>],
    edit: SeriesEdit<T::Patch>,
    at: DateTime<Utc>,
) -> Result<Plan<T>, CoreError> {
    if edit.rrule.is_some() {
        return Err(CoreError::InvalidInput(
            "a recurrence rule can only change with scope 'following' or 'all'".to_string(),
        ));
    }
    if series.ex_dates().contains(&at) {
        return Err(CoreError::InvalidInput(format!(
            "occurrence {} of series {} was deleted",
            at,
            series.id()
        )));
    }

    let mut ops = tombstones(exceptions, |e| e.occurrence_instant == at);
    let exception = SeriesException::new(series.id(), at, edit.fields);
    ops.push(StoreOp::InsertException(exception.clone()));

    Ok(Plan {
        ops,
        result: AppliedResult::ExceptionWritten(exception),
    })
}

fn exclude_instance<T: Recurrable>(
    mut series: T,
    exceptions: &[SeriesException<T::Patch>],
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Plan<T> {
    let mut ops = tombstones(exceptions, |e| e.occurrence_instant == at);

    if !series.ex_dates().contains(&at) {
        let mut ex_dates = series.ex_dates().to_vec();
        ex_dates.push(at);
        series.set_ex_dates(ex_dates);
    }
    series.touch(now);
    ops.push(StoreOp::UpdateSeries(series.clone()));

    Plan {
        ops,
        result: AppliedResult::InstanceExcluded {
            series,
            instance_date: at,
        },
    }
}

/// Ends the series just before `at` and drops state that belonged to the cut part.
fn truncate_before<T: Recurrable>(
    mut series: T,
    rule: &RecurrenceRule,
    exceptions: &[SeriesException<T::Patch>],
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (T, Vec<StoreOp<T>>) {
    let until = at - Duration::milliseconds(1);
    series.set_rrule(Some(rule.clone().strip_bounds().with_until(until).to_string()));

    let kept: Vec<DateTime<Utc>> = series.ex_dates().iter().copied().filter(|d| *d < at).collect();
    series.set_ex_dates(kept);
    series.touch(now);

    let mut ops = vec![StoreOp::UpdateSeries(series.clone())];
    ops.extend(tombstones(exceptions, |e| e.occurrence_instant >= at));
    (series, ops)
}

fn split_following<T: Recurrable>(
    series: T,
    exceptions: &[SeriesException<T::Patch>],
    edit: SeriesEdit<T::Patch>,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Plan<T>, CoreError> {
    let rule = series_rule(&series)?;

    let tail_rule = match &edit.rrule {
        Some(Some(text)) => Some(RecurrenceRule::parse(text)?),
        Some(None) => None,
        None => Some(remaining_rule(&series, &rule, at)?),
    };

    let mut tail = series.clone();
    tail.set_id(Uuid::now_v7());
    tail.reset_timestamps(now);
    tail.set_span(at, at + series.duration());
    let mut tail = apply_patch(&tail, &edit.fields);

    match tail_rule {
        Some(tail_rule) => {
            align_to_seconds(&mut tail);
            tail_rule.to_rrule_set(tail.start_at(), tail.timezone())?;
            tail.set_rrule(Some(tail_rule.to_string()));
            let moved: Vec<DateTime<Utc>> =
                series.ex_dates().iter().copied().filter(|d| *d >= at).collect();
            tail.set_ex_dates(moved);
        }
        None => {
            tail.set_rrule(None);
            tail.set_ex_dates(Vec::new());
        }
    }

    let (parent, mut ops) = truncate_before(series, &rule, exceptions, at, now);
    ops.push(StoreOp::InsertSeries(tail.clone()));

    Ok(Plan {
        ops,
        result: AppliedResult::SeriesSplit { parent, tail },
    })
}

/// The parent's rule as it applies from `at` onwards; a `COUNT` shrinks by the
/// occurrences the parent keeps.
fn remaining_rule<T: Recurrable>(
    series: &T,
    rule: &RecurrenceRule,
    at: DateTime<Utc>,
) -> Result<RecurrenceRule, CoreError> {
    let Some(count) = rule.count() else {
        return Ok(rule.clone());
    };

    let occurrences = Occurrences::new(rule, series.start_at(), series.timezone(), &[])?;
    let kept = occurrences.count_before(at, count as usize);
    let remaining = count.saturating_sub(u32::try_from(kept).unwrap_or(u32::MAX));
    if remaining == 0 {
        return Err(CoreError::InvalidInput(format!(
            "series {} has no occurrences left at {}",
            series.id(),
            at
        )));
    }
    Ok(rule.clone().with_count(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventPatch};
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// In-memory store applying batches all-or-nothing.
    #[derive(Default)]
    struct MemoryStore {
        state: Mutex<(HashMap<Uuid, Event>, Vec<SeriesException<EventPatch>>)>,
    }

    #[async_trait]
    impl SeriesStore<Event> for MemoryStore {
        async fn get_series(&self, id: Uuid) -> Result<Option<Event>, CoreError> {
            let state = self.state.lock().await;
            Ok(state.0.get(&id).filter(|e| e.deleted_at.is_none()).cloned())
        }

        async fn get_exceptions(
            &self,
            series_id: Uuid,
            query: ExceptionQuery,
        ) -> Result<Vec<SeriesException<EventPatch>>, CoreError> {
            let state = self.state.lock().await;
            Ok(state
                .1
                .iter()
                .filter(|e| e.series_id == series_id && e.is_live())
                .filter(|e| query.matches(e.occurrence_instant))
                .cloned()
                .collect())
        }

        async fn find_series_for_user(&self, user_id: Uuid) -> Result<Vec<Event>, CoreError> {
            let state = self.state.lock().await;
            Ok(state
                .0
                .values()
                .filter(|e| e.user_id == user_id && e.deleted_at.is_none())
                .cloned()
                .collect())
        }

        async fn insert_series(&self, item: &Event) -> Result<(), CoreError> {
            self.state.lock().await.0.insert(item.id, item.clone());
            Ok(())
        }

        async fn apply(&self, ops: Vec<StoreOp<Event>>) -> Result<(), CoreError> {
            let mut state = self.state.lock().await;
            let (mut series, mut exceptions) = state.clone();
            for op in ops {
                match op {
                    StoreOp::UpdateSeries(item) | StoreOp::InsertSeries(item) => {
                        series.insert(item.id, item);
                    }
                    StoreOp::TombstoneSeries { id } => {
                        let item = series.get_mut(&id).ok_or(CoreError::SeriesNotFound(id))?;
                        item.deleted_at = Some(Utc::now());
                    }
                    StoreOp::InsertException(exception) => {
                        let clash = exceptions.iter().any(|e| {
                            e.is_live()
                                && e.series_id == exception.series_id
                                && e.occurrence_instant == exception.occurrence_instant
                        });
                        if clash {
                            return Err(CoreError::ExceptionConflict {
                                series_id: exception.series_id,
                                occurrence_instant: exception.occurrence_instant,
                            });
                        }
                        exceptions.push(exception);
                    }
                    StoreOp::TombstoneException { id } => {
                        if let Some(e) = exceptions.iter_mut().find(|e| e.id == id) {
                            e.deleted_at.get_or_insert_with(Utc::now);
                        }
                    }
                }
            }
            *state = (series, exceptions);
            Ok(())
        }
    }

    fn utc(m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, m, d, h, 0, 0).unwrap()
    }

    fn title(text: &str) -> SeriesEdit<EventPatch> {
        SeriesEdit::fields(EventPatch {
            title: Some(text.to_string()),
            ..Default::default()
        })
    }

    async fn setup(rrule: &str) -> (ScopedMutationCoordinator<MemoryStore>, Event) {
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let event = Event::new(Uuid::now_v7(), "Standup", utc(3, 2, 10), utc(3, 2, 11)).with_rrule(rrule);
        let event = coordinator.create(event).await.unwrap();
        (coordinator, event)
    }

    async fn live_exceptions(
        coordinator: &ScopedMutationCoordinator<MemoryStore>,
        series_id: Uuid,
    ) -> Vec<SeriesException<EventPatch>> {
        SeriesStore::<Event>::get_exceptions(coordinator.store(), series_id, ExceptionQuery::All)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_normalizes_rule() {
        let (_, event) = setup("byday=mo;freq=weekly").await;
        assert_eq!(event.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_rule_and_timezone() {
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let event = Event::new(Uuid::now_v7(), "Bad", utc(3, 2, 10), utc(3, 2, 11));

        let err = coordinator
            .create(event.clone().with_rrule("FREQ=HOURLY"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RRULE");

        let mut zoned = event;
        zoned.timezone = Some("Nowhere/Special".to_string());
        let err = coordinator.create(zoned).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTimezone(_)));
    }

    #[tokio::test]
    async fn test_instance_update_replaces_previous_exception() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let at = utc(3, 9, 10);

        let first = coordinator
            .update::<Event>(event.user_id, event.id, title("Special"), Some(Scope::Instance), Some(at))
            .await
            .unwrap();
        let second = coordinator
            .update::<Event>(event.user_id, event.id, title("Moved"), Some(Scope::Instance), Some(at))
            .await
            .unwrap();

        let (AppliedResult::ExceptionWritten(first), AppliedResult::ExceptionWritten(second)) =
            (first, second)
        else {
            panic!("expected exceptions to be written");
        };

        let live = live_exceptions(&coordinator, event.id).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
        assert_ne!(live[0].id, first.id);
        assert_eq!(live[0].overrides.title.as_deref(), Some("Moved"));
    }

    #[tokio::test]
    async fn test_scopes_needing_instance_date() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;

        for scope in [Scope::Instance, Scope::Following] {
            let err = coordinator
                .delete::<Event>(event.user_id, event.id, Some(scope), None)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::MissingInstanceDate(s) if s == scope));
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
    }

    #[tokio::test]
    async fn test_instance_date_must_be_an_occurrence() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let err = coordinator
            .delete::<Event>(event.user_id, event.id, Some(Scope::Instance), Some(utc(3, 10, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_rule_change_rejected_for_instance_scope() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let edit = title("x").with_rrule(Some("FREQ=DAILY".to_string()));
        let err = coordinator
            .update::<Event>(event.user_id, event.id, edit, Some(Scope::Instance), Some(utc(3, 9, 10)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_other_users_series_is_not_found() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let err = coordinator
            .delete::<Event>(Uuid::now_v7(), event.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SeriesNotFound(id) if id == event.id));
    }

    #[tokio::test]
    async fn test_instance_delete_is_idempotent() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let at = utc(3, 9, 10);
        coordinator
            .update::<Event>(event.user_id, event.id, title("Special"), Some(Scope::Instance), Some(at))
            .await
            .unwrap();

        for _ in 0..2 {
            coordinator
                .delete::<Event>(event.user_id, event.id, Some(Scope::Instance), Some(at))
                .await
                .unwrap();
        }

        let stored: Event = coordinator.store().get_series(event.id).await.unwrap().unwrap();
        assert_eq!(stored.ex_dates, vec![at]);
        assert!(live_exceptions(&coordinator, event.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_following_update_splits_series() {
        let (coordinator, mut event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        event.ex_dates = vec![utc(3, 2, 10), utc(3, 23, 10)];
        coordinator.store().insert_series(&event).await.unwrap();
        let at = utc(3, 16, 10);
        coordinator
            .update::<Event>(event.user_id, event.id, title("Late"), Some(Scope::Instance), Some(utc(3, 30, 10)))
            .await
            .unwrap();

        let applied = coordinator
            .update::<Event>(event.user_id, event.id, title("New Name"), Some(Scope::Following), Some(at))
            .await
            .unwrap();
        let AppliedResult::SeriesSplit { parent, tail } = applied else {
            panic!("expected a split");
        };

        assert_eq!(parent.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO;UNTIL=20260316T095959Z"));
        assert_eq!(parent.title, "Standup");
        assert_eq!(parent.ex_dates, vec![utc(3, 2, 10)]);

        assert_ne!(tail.id, parent.id);
        assert_eq!(tail.title, "New Name");
        assert_eq!((tail.start_at, tail.end_at), (at, utc(3, 16, 11)));
        assert_eq!(tail.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
        assert_eq!(tail.ex_dates, vec![utc(3, 23, 10)]);
        assert_eq!(tail.recurring_parent_id, None);

        assert!(live_exceptions(&coordinator, event.id).await.is_empty());
        let stored_tail: Option<Event> = coordinator.store().get_series(tail.id).await.unwrap();
        assert_eq!(stored_tail, Some(tail));
    }

    #[tokio::test]
    async fn test_following_split_reduces_count() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO;COUNT=5").await;
        let applied = coordinator
            .update::<Event>(event.user_id, event.id, title("Tail"), Some(Scope::Following), Some(utc(3, 16, 10)))
            .await
            .unwrap();
        let AppliedResult::SeriesSplit { parent, tail } = applied else {
            panic!("expected a split");
        };
        assert_eq!(parent.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO;UNTIL=20260316T095959Z"));
        assert_eq!(tail.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO;COUNT=3"));
    }

    #[tokio::test]
    async fn test_following_at_first_occurrence_is_all() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let applied = coordinator
            .update::<Event>(event.user_id, event.id, title("Renamed"), Some(Scope::Following), Some(event.start_at))
            .await
            .unwrap();
        match applied {
            AppliedResult::Updated(updated) => {
                assert_eq!(updated.id, event.id);
                assert_eq!(updated.title, "Renamed");
                assert_eq!(updated.rrule, event.rrule);
            }
            other => panic!("expected in-place update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_following_from_first_generated_occurrence_is_all() {
        // 2026-03-01 is a Sunday, so a Monday rule first fires on 03-02
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let sunday = Event::new(Uuid::now_v7(), "Standup", utc(3, 1, 10), utc(3, 1, 11))
            .with_rrule("FREQ=WEEKLY;BYDAY=MO");
        let event = coordinator.create(sunday).await.unwrap();

        let applied = coordinator
            .update::<Event>(event.user_id, event.id, title("Renamed"), Some(Scope::Following), Some(utc(3, 2, 10)))
            .await
            .unwrap();
        let AppliedResult::Updated(updated) = applied else {
            panic!("expected in-place update");
        };
        assert_eq!(updated.id, event.id);
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.rrule, event.rrule);

        let applied = coordinator
            .delete::<Event>(event.user_id, event.id, Some(Scope::Following), Some(utc(3, 2, 10)))
            .await
            .unwrap();
        assert_eq!(applied, AppliedResult::Deleted { id: event.id });
        let gone: Option<Event> = coordinator.store().get_series(event.id).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_create_anchors_series_on_whole_seconds() {
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let half = Duration::milliseconds(500);
        let event = Event::new(Uuid::now_v7(), "Standup", utc(3, 2, 10) + half, utc(3, 2, 11) + half)
            .with_rrule("FREQ=WEEKLY;BYDAY=MO");
        let event = coordinator.create(event).await.unwrap();
        assert_eq!((event.start_at, event.end_at), (utc(3, 2, 10), utc(3, 2, 11)));

        let applied = coordinator
            .delete::<Event>(event.user_id, event.id, Some(Scope::Instance), Some(event.start_at))
            .await
            .unwrap();
        assert!(matches!(applied, AppliedResult::InstanceExcluded { instance_date, .. } if instance_date == utc(3, 2, 10)));
    }

    #[tokio::test]
    async fn test_series_update_anchors_moved_start_on_whole_seconds() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let edit = SeriesEdit::fields(EventPatch {
            start_at: Some(utc(3, 2, 12) + Duration::milliseconds(250)),
            ..Default::default()
        });
        let applied = coordinator
            .update::<Event>(event.user_id, event.id, edit, Some(Scope::All), None)
            .await
            .unwrap();
        let AppliedResult::Updated(updated) = applied else {
            panic!("expected update");
        };
        assert_eq!((updated.start_at, updated.end_at), (utc(3, 2, 12), utc(3, 2, 13)));

        coordinator
            .update::<Event>(event.user_id, event.id, title("Late"), Some(Scope::Instance), Some(updated.start_at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_mutation_releases_lock_entry() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let lease = coordinator.lease(event.id);
        let held = lease.lock.lock().await;

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            coordinator.delete::<Event>(event.user_id, event.id, None, None),
        )
        .await;
        assert!(waiting.is_err());

        drop(held);
        drop(lease);
        assert!(coordinator.locks.lock().unwrap().is_empty());
        let stored: Option<Event> = coordinator.store().get_series(event.id).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_following_delete_truncates() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        coordinator
            .update::<Event>(event.user_id, event.id, title("Before"), Some(Scope::Instance), Some(utc(3, 2, 10)))
            .await
            .unwrap();
        coordinator
            .update::<Event>(event.user_id, event.id, title("After"), Some(Scope::Instance), Some(utc(3, 16, 10)))
            .await
            .unwrap();

        let applied = coordinator
            .delete::<Event>(event.user_id, event.id, Some(Scope::Following), Some(utc(3, 9, 10)))
            .await
            .unwrap();
        let AppliedResult::SeriesTruncated(parent) = applied else {
            panic!("expected truncation");
        };
        assert_eq!(parent.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO;UNTIL=20260309T095959Z"));

        let live = live_exceptions(&coordinator, event.id).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].occurrence_instant, utc(3, 2, 10));
    }

    #[tokio::test]
    async fn test_delete_all_tombstones_exceptions() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        coordinator
            .update::<Event>(event.user_id, event.id, title("Special"), Some(Scope::Instance), Some(utc(3, 9, 10)))
            .await
            .unwrap();

        let applied = coordinator
            .delete::<Event>(event.user_id, event.id, None, None)
            .await
            .unwrap();
        assert_eq!(applied, AppliedResult::Deleted { id: event.id });

        let gone: Option<Event> = coordinator.store().get_series(event.id).await.unwrap();
        assert!(gone.is_none());
        assert!(live_exceptions(&coordinator, event.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_recurring_update_ignores_scope() {
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let event = coordinator
            .create(Event::new(Uuid::now_v7(), "Dentist", utc(5, 1, 9), utc(5, 1, 10)))
            .await
            .unwrap();

        let applied = coordinator
            .update::<Event>(event.user_id, event.id, title("Dentist (moved)"), Some(Scope::Instance), None)
            .await
            .unwrap();
        assert!(matches!(applied, AppliedResult::Updated(ref e) if e.title == "Dentist (moved)"));
    }

    #[tokio::test]
    async fn test_setting_rule_makes_record_recurring() {
        let coordinator = ScopedMutationCoordinator::new(MemoryStore::default());
        let event = coordinator
            .create(Event::new(Uuid::now_v7(), "Gym", utc(3, 2, 18), utc(3, 2, 19)))
            .await
            .unwrap();

        let bad = SeriesEdit::default().with_rrule(Some("FREQ=NEVER".to_string()));
        let err = coordinator
            .update::<Event>(event.user_id, event.id, bad, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_RRULE");

        let edit = SeriesEdit::default().with_rrule(Some("freq=weekly;byday=mo,th".to_string()));
        let applied = coordinator
            .update::<Event>(event.user_id, event.id, edit, None, None)
            .await
            .unwrap();
        let AppliedResult::Updated(updated) = applied else {
            panic!("expected update");
        };
        assert_eq!(updated.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO,TH"));
    }

    #[tokio::test]
    async fn test_concurrent_instance_deletes_are_serialized() {
        let (coordinator, event) = setup("FREQ=WEEKLY;BYDAY=MO").await;
        let (a, b) = tokio::join!(
            coordinator.delete::<Event>(event.user_id, event.id, Some(Scope::Instance), Some(utc(3, 9, 10))),
            coordinator.delete::<Event>(event.user_id, event.id, Some(Scope::Instance), Some(utc(3, 16, 10))),
        );
        a.unwrap();
        b.unwrap();

        let stored: Event = coordinator.store().get_series(event.id).await.unwrap().unwrap();
        let mut ex_dates = stored.ex_dates.clone();
        ex_dates.sort();
        assert_eq!(ex_dates, vec![utc(3, 9, 10), utc(3, 16, 10)]);
        assert!(coordinator.locks.lock().unwrap().is_empty());
    }
}

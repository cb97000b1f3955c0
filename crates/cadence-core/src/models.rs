use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::recurrence::Recurrable;

// ============================================================================
// Task enums
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid task status: {0}")]
pub struct ParseTaskStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    None,
    Low,
    Medium,
    High,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid task priority: {0}")]
pub struct ParseTaskPriorityError(String);

impl FromStr for TaskPriority {
    type Err = ParseTaskPriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(TaskPriority::None),
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            _ => Err(ParseTaskPriorityError(s.to_string())),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// A calendar event. When `rrule` is set the event is a recurring series and
/// `start_at`/`end_at` describe its first occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
    /// IANA timezone the recurrence rule is evaluated in (UTC when absent)
    pub timezone: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub rrule: Option<String>,
    /// Excluded occurrence instants, kept in insertion order without duplicates
    pub ex_dates: Vec<DateTime<Utc>>,
    /// Set on standalone records detached from a series; such records never expand
    pub recurring_parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(
        user_id: Uuid,
        title: impl Into<String>,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id,
            title: title.into(),
            description: None,
            location: None,
            category: None,
            timezone: None,
            start_at,
            end_at,
            rrule: None,
            ex_dates: Vec::new(),
            recurring_parent_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_rrule(mut self, rrule: impl Into<String>) -> Self {
        self.rrule = Some(rrule.into());
        self
    }
}

/// Sparse set of event field overrides. Absent fields are inherited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub location: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub category: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

impl Recurrable for Event {
    type Patch = EventPatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }

    fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn end_at(&self) -> DateTime<Utc> {
        self.end_at
    }

    fn set_span(&mut self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) {
        self.start_at = start_at;
        self.end_at = end_at;
    }

    fn rrule(&self) -> Option<&str> {
        self.rrule.as_deref()
    }

    fn set_rrule(&mut self, rrule: Option<String>) {
        self.rrule = rrule;
    }

    fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    fn ex_dates(&self) -> &[DateTime<Utc>] {
        &self.ex_dates
    }

    fn set_ex_dates(&mut self, ex_dates: Vec<DateTime<Utc>>) {
        self.ex_dates = ex_dates;
    }

    fn recurring_parent_id(&self) -> Option<Uuid> {
        self.recurring_parent_id
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn reset_timestamps(&mut self, now: DateTime<Utc>) {
        self.created_at = now;
        self.updated_at = now;
        self.deleted_at = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn patch_span(patch: &EventPatch) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (patch.start_at, patch.end_at)
    }

    fn apply_fields(&mut self, patch: &EventPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(category) = &patch.category {
            self.category = category.clone();
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// A task. Tasks occupy a single instant (`due_at`), so their occurrences have
/// zero duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub timezone: Option<String>,
    pub due_at: DateTime<Utc>,
    pub rrule: Option<String>,
    pub ex_dates: Vec<DateTime<Utc>>,
    pub recurring_parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(user_id: Uuid, title: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id,
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            priority: TaskPriority::None,
            timezone: None,
            due_at,
            rrule: None,
            ex_dates: Vec::new(),
            recurring_parent_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_rrule(mut self, rrule: impl Into<String>) -> Self {
        self.rrule = Some(rrule.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

impl Recurrable for Task {
    type Patch = TaskPatch;

    fn id(&self) -> Uuid {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }

    fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    fn end_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    fn set_span(&mut self, start_at: DateTime<Utc>, _end_at: DateTime<Utc>) {
        self.due_at = start_at;
    }

    fn rrule(&self) -> Option<&str> {
        self.rrule.as_deref()
    }

    fn set_rrule(&mut self, rrule: Option<String>) {
        self.rrule = rrule;
    }

    fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    fn ex_dates(&self) -> &[DateTime<Utc>] {
        &self.ex_dates
    }

    fn set_ex_dates(&mut self, ex_dates: Vec<DateTime<Utc>>) {
        self.ex_dates = ex_dates;
    }

    fn recurring_parent_id(&self) -> Option<Uuid> {
        self.recurring_parent_id
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn reset_timestamps(&mut self, now: DateTime<Utc>) {
        self.created_at = now;
        self.updated_at = now;
        self.deleted_at = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn patch_span(patch: &TaskPatch) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (patch.due_at, None)
    }

    fn apply_fields(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(status) = &patch.status {
            self.status = status.clone();
        }
        if let Some(priority) = &patch.priority {
            self.priority = priority.clone();
        }
    }
}

// ============================================================================
// Series exceptions
// ============================================================================

/// Per-occurrence override of a recurring series.
///
/// `occurrence_instant` is the originally generated start of the occurrence,
/// before any override is applied; it is the key future edits and deletes of the
/// same occurrence join on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesException<P> {
    pub id: Uuid,
    pub series_id: Uuid,
    pub occurrence_instant: DateTime<Utc>,
    pub overrides: P,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl<P> SeriesException<P> {
    pub fn new(series_id: Uuid, occurrence_instant: DateTime<Utc>, overrides: P) -> Self {
        Self {
            id: Uuid::now_v7(),
            series_id,
            occurrence_instant,
            overrides,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

pub type EventException = SeriesException<EventPatch>;
pub type TaskException = SeriesException<TaskPatch>;

// ============================================================================
// Mutation inputs
// ============================================================================

/// Blast radius of an edit or delete on a recurring item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only the selected occurrence
    Instance,
    /// The selected occurrence and every later one
    Following,
    /// The whole series
    All,
}

impl Scope {
    /// Whether this scope addresses a specific occurrence
    pub fn requires_instance_date(self) -> bool {
        matches!(self, Scope::Instance | Scope::Following)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Instance => write!(f, "instance"),
            Scope::Following => write!(f, "following"),
            Scope::All => write!(f, "all"),
        }
    }
}

impl FromStr for Scope {
    type Err = ParseScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instance" | "this" | "occurrence" => Ok(Scope::Instance),
            "following" | "future" | "this_and_following" => Ok(Scope::Following),
            "all" | "series" | "entire" => Ok(Scope::All),
            _ => Err(ParseScopeError(s.to_string())),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid scope: {0}")]
pub struct ParseScopeError(String);

/// Edit payload: field changes plus an optional recurrence rule change.
///
/// `rrule: Some(None)` clears the rule, `Some(Some(_))` replaces it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesEdit<P> {
    pub fields: P,
    pub rrule: Option<Option<String>>,
}

impl<P> SeriesEdit<P> {
    pub fn fields(fields: P) -> Self {
        Self { fields, rrule: None }
    }

    pub fn with_rrule(mut self, rrule: Option<String>) -> Self {
        self.rrule = Some(rrule);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<P> {
    Update(SeriesEdit<P>),
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scope_parsing() {
        assert_eq!("instance".parse::<Scope>(), Ok(Scope::Instance));
        assert_eq!("FOLLOWING".parse::<Scope>(), Ok(Scope::Following));
        assert_eq!("series".parse::<Scope>(), Ok(Scope::All));
        assert!("everything".parse::<Scope>().is_err());
        assert_eq!(Scope::Following.to_string(), "following");
    }

    #[test]
    fn test_scope_instance_date_requirement() {
        assert!(Scope::Instance.requires_instance_date());
        assert!(Scope::Following.requires_instance_date());
        assert!(!Scope::All.requires_instance_date());
    }

    #[test]
    fn test_event_patch_serializes_sparsely() {
        let patch = EventPatch {
            title: Some("Special".to_string()),
            location: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "title": "Special", "location": null }));

        let back: EventPatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn test_event_patch_rejects_unknown_keys() {
        let result = serde_json::from_str::<EventPatch>(r#"{"titel": "typo"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_task_is_zero_duration() {
        let due = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut task = Task::new(Uuid::now_v7(), "Water plants", due);
        assert_eq!(task.start_at(), task.end_at());

        let later = due + chrono::Duration::hours(2);
        task.set_span(later, later + chrono::Duration::hours(1));
        assert_eq!(task.due_at, later);
    }

    #[test]
    fn test_task_status_from_str() {
        assert_eq!("Completed".parse::<TaskStatus>(), Ok(TaskStatus::Completed));
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!("high".parse::<TaskPriority>(), Ok(TaskPriority::High));
    }
}

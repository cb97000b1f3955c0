use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Scope;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error")]
    Config(#[from] Box<figment::Error>),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Scope '{0}' requires an instance date")]
    MissingInstanceDate(Scope),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Series not found: {0}")]
    SeriesNotFound(Uuid),

    #[error("An exception already exists for series {series_id} at {occurrence_instant}")]
    ExceptionConflict {
        series_id: Uuid,
        occurrence_instant: DateTime<Utc>,
    },
}

impl From<figment::Error> for CoreError {
    fn from(err: figment::Error) -> Self {
        CoreError::Config(Box::new(err))
    }
}

impl CoreError {
    /// Stable error code surfaced to callers of the engine.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidRule(_) => "INVALID_RRULE",
            CoreError::InvalidTimezone(_)
            | CoreError::MissingInstanceDate(_)
            | CoreError::InvalidInput(_) => "VALIDATION_ERROR",
            CoreError::SeriesNotFound(_) => "NOT_FOUND",
            CoreError::ExceptionConflict { .. } => "CONFLICT",
            CoreError::Database(_)
            | CoreError::Migration(_)
            | CoreError::Io(_)
            | CoreError::Serialization(_)
            | CoreError::Config(_) => "INTERNAL_ERROR",
        }
    }

    /// True for errors caused by the caller's input (HTTP 4xx equivalents).
    pub fn is_client_error(&self) -> bool {
        self.code() != "INTERNAL_ERROR"
    }
}

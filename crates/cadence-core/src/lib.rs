//! # Cadence Core Library
//!
//! Recurring-item engine for calendar events and tasks: RRULE-based series,
//! per-occurrence overrides and scoped edits that split a series in two.
//!
//! ## Features
//!
//! - **Rule Handling**: RRULE parsing, validation and normalization on top of
//!   the `rrule` crate, restricted to daily and coarser frequencies
//! - **Window Expansion**: a series plus its exceptions becomes the concrete
//!   instances overlapping a time window, capped at 1000 per series
//! - **Overrides**: sparse, typed patches for single occurrences
//! - **Scoped Mutation**: `instance`, `following` and `all` edits and deletes,
//!   applied atomically
//! - **Timezone Awareness**: series evaluated in their IANA zone across DST
//!
//! ## Core Modules
//!
//! - [`db`]: Database connection and migration management
//! - [`models`]: Events, tasks, exceptions and mutation inputs
//! - [`recurrence`]: Rule parsing, expansion and override application
//! - [`mutation`]: Scoped update/delete coordination
//! - [`repository`]: Data access layer with Repository pattern
//! - [`service`]: Agenda reads combining storage and expansion
//! - [`config`]: Engine configuration
//! - [`timezone`]: Timezone utilities and validation
//! - [`error`]: Error types and stable error codes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence_core::{
//!     db, models::{Event, EventPatch, Scope, SeriesEdit},
//!     mutation::ScopedMutationCoordinator, repository::SqliteRepository,
//!     service::AgendaService, recurrence::RecurrenceExpander,
//! };
//! use chrono::{TimeZone, Utc};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = db::establish_connection("cadence.db").await?;
//!     let repo = SqliteRepository::new(pool);
//!     let coordinator = ScopedMutationCoordinator::new(repo.clone());
//!     let agenda = AgendaService::new(repo, RecurrenceExpander::with_defaults());
//!
//!     let user = Uuid::now_v7();
//!     let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
//!     let standup = coordinator
//!         .create(Event::new(user, "Standup", start, start + chrono::Duration::hours(1))
//!             .with_rrule("FREQ=WEEKLY;BYDAY=MO"))
//!         .await?;
//!
//!     // Rename only the second Monday
//!     let edit = SeriesEdit::fields(EventPatch { title: Some("Special".into()), ..Default::default() });
//!     coordinator
//!         .update::<Event>(user, standup.id, edit, Some(Scope::Instance), Some(start + chrono::Duration::weeks(1)))
//!         .await?;
//!
//!     for instance in agenda.agenda::<Event>(user, start, start + chrono::Duration::weeks(3)).await? {
//!         println!("{} {}", instance.start_at(), instance.item.title);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod mutation;
pub mod recurrence;
pub mod repository;
pub mod service;
pub mod timezone;

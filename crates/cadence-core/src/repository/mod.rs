use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::SeriesException;
use crate::recurrence::Recurrable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

pub mod exceptions;
pub mod series;

pub use series::SqlRecord;

/// Which live exceptions of a series to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionQuery {
    All,
    /// Exceptions keyed on exactly these occurrence instants
    At(Vec<DateTime<Utc>>),
    /// Exceptions keyed on this instant or later
    OnOrAfter(DateTime<Utc>),
}

impl ExceptionQuery {
    pub fn matches(&self, occurrence_instant: DateTime<Utc>) -> bool {
        match self {
            ExceptionQuery::All => true,
            ExceptionQuery::At(instants) => instants.contains(&occurrence_instant),
            ExceptionQuery::OnOrAfter(from) => occurrence_instant >= *from,
        }
    }
}

/// One write in an atomic batch. Ops run in order inside a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp<T: Recurrable> {
    /// Overwrite a live record; fails with `SeriesNotFound` if there is none
    UpdateSeries(T),
    InsertSeries(T),
    TombstoneSeries { id: Uuid },
    InsertException(SeriesException<T::Patch>),
    /// Tombstoning an already tombstoned exception is a no-op
    TombstoneException { id: Uuid },
}

impl<T: Recurrable> StoreOp<T> {
    fn label(&self) -> &'static str {
        match self {
            StoreOp::UpdateSeries(_) => "update_series",
            StoreOp::InsertSeries(_) => "insert_series",
            StoreOp::TombstoneSeries { .. } => "tombstone_series",
            StoreOp::InsertException(_) => "insert_exception",
            StoreOp::TombstoneException { .. } => "tombstone_exception",
        }
    }
}

/// Persistence boundary for one kind of recurring record and its exceptions.
///
/// Reads only ever return live (non-tombstoned) rows.
#[async_trait]
pub trait SeriesStore<T: Recurrable>: Send + Sync {
    async fn get_series(&self, id: Uuid) -> Result<Option<T>, CoreError>;
    async fn get_exceptions(
        &self,
        series_id: Uuid,
        query: ExceptionQuery,
    ) -> Result<Vec<SeriesException<T::Patch>>, CoreError>;
    /// Every live record of a user, recurring or not, ordered by start
    async fn find_series_for_user(&self, user_id: Uuid) -> Result<Vec<T>, CoreError>;
    async fn insert_series(&self, item: &T) -> Result<(), CoreError>;
    /// Applies every op or none of them
    async fn apply(&self, ops: Vec<StoreOp<T>>) -> Result<(), CoreError>;
}

/// SQLite implementation of [`SeriesStore`] for events and tasks
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool for internal use across modules
    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl<T: SqlRecord> SeriesStore<T> for SqliteRepository {
    async fn get_series(&self, id: Uuid) -> Result<Option<T>, CoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = $1 AND deleted_at IS NULL", T::TABLE);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await?;
        row.as_ref().map(T::from_row).transpose()
    }

    async fn get_exceptions(
        &self,
        series_id: Uuid,
        query: ExceptionQuery,
    ) -> Result<Vec<SeriesException<T::Patch>>, CoreError> {
        let live = exceptions::fetch_live(self.pool(), T::EXCEPTION_TABLE, series_id).await?;
        Ok(live
            .into_iter()
            .filter(|e| query.matches(e.occurrence_instant))
            .collect())
    }

    async fn find_series_for_user(&self, user_id: Uuid) -> Result<Vec<T>, CoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE user_id = $1 AND deleted_at IS NULL ORDER BY {}",
            T::TABLE,
            T::ORDER_COLUMN
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(self.pool()).await?;
        rows.iter().map(T::from_row).collect()
    }

    async fn insert_series(&self, item: &T) -> Result<(), CoreError> {
        let mut conn = self.pool().acquire().await?;
        item.insert_into(&mut *conn).await
    }

    async fn apply(&self, ops: Vec<StoreOp<T>>) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        for op in &ops {
            debug!(table = T::TABLE, op = op.label(), "Applying store op");
            match op {
                StoreOp::UpdateSeries(item) => {
                    if item.update_in(&mut *tx).await? == 0 {
                        return Err(CoreError::SeriesNotFound(item.id()));
                    }
                }
                StoreOp::InsertSeries(item) => item.insert_into(&mut *tx).await?,
                StoreOp::TombstoneSeries { id } => {
                    let sql = format!(
                        "UPDATE {} SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
                        T::TABLE
                    );
                    let result = sqlx::query(&sql).bind(now).bind(*id).execute(&mut *tx).await?;
                    if result.rows_affected() == 0 {
                        return Err(CoreError::SeriesNotFound(*id));
                    }
                }
                StoreOp::InsertException(exception) => {
                    exceptions::insert(&mut *tx, T::EXCEPTION_TABLE, exception).await?
                }
                StoreOp::TombstoneException { id } => {
                    exceptions::tombstone(&mut *tx, T::EXCEPTION_TABLE, *id, now).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_exception_query_matching() {
        let at = |d| Utc.with_ymd_and_hms(2026, 3, d, 10, 0, 0).unwrap();

        assert!(ExceptionQuery::All.matches(at(1)));
        assert!(ExceptionQuery::At(vec![at(9)]).matches(at(9)));
        assert!(!ExceptionQuery::At(vec![at(9)]).matches(at(16)));
        assert!(ExceptionQuery::OnOrAfter(at(9)).matches(at(9)));
        assert!(ExceptionQuery::OnOrAfter(at(9)).matches(at(16)));
        assert!(!ExceptionQuery::OnOrAfter(at(9)).matches(at(2)));
    }
}

use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::SeriesException;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

/// Live exceptions of a series, ordered by occurrence instant.
pub(crate) async fn fetch_live<P: DeserializeOwned>(
    pool: &DbPool,
    table: &str,
    series_id: Uuid,
) -> Result<Vec<SeriesException<P>>, CoreError> {
    let sql = format!(
        "SELECT * FROM {} WHERE series_id = $1 AND deleted_at IS NULL",
        table
    );
    let rows = sqlx::query(&sql).bind(series_id).fetch_all(pool).await?;

    let mut exceptions = rows
        .iter()
        .map(from_row)
        .collect::<Result<Vec<SeriesException<P>>, CoreError>>()?;
    exceptions.sort_by_key(|e| e.occurrence_instant);
    Ok(exceptions)
}

/// Inserts an exception. A second live exception for the same occurrence is a
/// [`CoreError::ExceptionConflict`].
pub(crate) async fn insert<P: Serialize + Sync>(
    conn: &mut SqliteConnection,
    table: &str,
    exception: &SeriesException<P>,
) -> Result<(), CoreError> {
    let overrides = serde_json::to_string(&exception.overrides)?;
    let sql = format!(
        "INSERT INTO {} (id, series_id, occurrence_instant, overrides, created_at, deleted_at) VALUES ($1, $2, $3, $4, $5, $6)",
        table
    );

    sqlx::query(&sql)
        .bind(exception.id)
        .bind(exception.series_id)
        .bind(exception.occurrence_instant)
        .bind(overrides)
        .bind(exception.created_at)
        .bind(exception.deleted_at)
        .execute(&mut *conn)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                CoreError::ExceptionConflict {
                    series_id: exception.series_id,
                    occurrence_instant: exception.occurrence_instant,
                }
            }
            other => CoreError::Database(other),
        })?;
    Ok(())
}

/// Soft-deletes an exception; returns whether a live row was changed.
pub(crate) async fn tombstone(
    conn: &mut SqliteConnection,
    table: &str,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let sql = format!(
        "UPDATE {} SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        table
    );
    let result = sqlx::query(&sql).bind(now).bind(id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

fn from_row<P: DeserializeOwned>(row: &SqliteRow) -> Result<SeriesException<P>, CoreError> {
    let overrides: String = row.try_get("overrides")?;
    Ok(SeriesException {
        id: row.try_get("id")?,
        series_id: row.try_get("series_id")?,
        occurrence_instant: row.try_get("occurrence_instant")?,
        overrides: serde_json::from_str(&overrides)?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

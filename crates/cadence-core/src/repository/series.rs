use crate::error::CoreError;
use crate::models::{Event, Task};
use crate::recurrence::Recurrable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

/// Row mapping for a recurring record table.
///
/// `insert_into` and `update_in` take a bare connection so they can run on the
/// pool or inside a transaction.
#[async_trait]
pub trait SqlRecord: Recurrable + Unpin + 'static {
    const TABLE: &'static str;
    const EXCEPTION_TABLE: &'static str;
    const ORDER_COLUMN: &'static str;

    fn from_row(row: &SqliteRow) -> Result<Self, CoreError>;

    async fn insert_into(&self, conn: &mut SqliteConnection) -> Result<(), CoreError>;

    /// Overwrites the live row with this id; returns the number of rows changed
    async fn update_in(&self, conn: &mut SqliteConnection) -> Result<u64, CoreError>;
}

pub(crate) fn encode_instants(instants: &[DateTime<Utc>]) -> Result<String, CoreError> {
    Ok(serde_json::to_string(instants)?)
}

pub(crate) fn decode_instants(row: &SqliteRow, column: &str) -> Result<Vec<DateTime<Utc>>, CoreError> {
    let raw: String = row.try_get(column)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl SqlRecord for Event {
    const TABLE: &'static str = "events";
    const EXCEPTION_TABLE: &'static str = "event_exceptions";
    const ORDER_COLUMN: &'static str = "start_at";

    fn from_row(row: &SqliteRow) -> Result<Self, CoreError> {
        Ok(Event {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            location: row.try_get("location")?,
            category: row.try_get("category")?,
            timezone: row.try_get("timezone")?,
            start_at: row.try_get("start_at")?,
            end_at: row.try_get("end_at")?,
            rrule: row.try_get("rrule")?,
            ex_dates: decode_instants(row, "ex_dates")?,
            recurring_parent_id: row.try_get("recurring_parent_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    async fn insert_into(&self, conn: &mut SqliteConnection) -> Result<(), CoreError> {
        let ex_dates = encode_instants(&self.ex_dates)?;
        sqlx::query(
            r#"INSERT INTO events (id, user_id, title, description, location, category, timezone, start_at, end_at, rrule, ex_dates, recurring_parent_id, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.location)
        .bind(&self.category)
        .bind(&self.timezone)
        .bind(self.start_at)
        .bind(self.end_at)
        .bind(&self.rrule)
        .bind(ex_dates)
        .bind(self.recurring_parent_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.deleted_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn update_in(&self, conn: &mut SqliteConnection) -> Result<u64, CoreError> {
        let ex_dates = encode_instants(&self.ex_dates)?;
        let result = sqlx::query(
            r#"UPDATE events SET title = $1, description = $2, location = $3, category = $4, timezone = $5,
                start_at = $6, end_at = $7, rrule = $8, ex_dates = $9, recurring_parent_id = $10, updated_at = $11
            WHERE id = $12 AND deleted_at IS NULL"#,
        )
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.location)
        .bind(&self.category)
        .bind(&self.timezone)
        .bind(self.start_at)
        .bind(self.end_at)
        .bind(&self.rrule)
        .bind(ex_dates)
        .bind(self.recurring_parent_id)
        .bind(self.updated_at)
        .bind(self.id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SqlRecord for Task {
    const TABLE: &'static str = "tasks";
    const EXCEPTION_TABLE: &'static str = "task_exceptions";
    const ORDER_COLUMN: &'static str = "due_at";

    fn from_row(row: &SqliteRow) -> Result<Self, CoreError> {
        Ok(Task {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            timezone: row.try_get("timezone")?,
            due_at: row.try_get("due_at")?,
            rrule: row.try_get("rrule")?,
            ex_dates: decode_instants(row, "ex_dates")?,
            recurring_parent_id: row.try_get("recurring_parent_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    async fn insert_into(&self, conn: &mut SqliteConnection) -> Result<(), CoreError> {
        let ex_dates = encode_instants(&self.ex_dates)?;
        sqlx::query(
            r#"INSERT INTO tasks (id, user_id, title, description, status, priority, timezone, due_at, rrule, ex_dates, recurring_parent_id, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.status)
        .bind(&self.priority)
        .bind(&self.timezone)
        .bind(self.due_at)
        .bind(&self.rrule)
        .bind(ex_dates)
        .bind(self.recurring_parent_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.deleted_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn update_in(&self, conn: &mut SqliteConnection) -> Result<u64, CoreError> {
        let ex_dates = encode_instants(&self.ex_dates)?;
        let result = sqlx::query(
            r#"UPDATE tasks SET title = $1, description = $2, status = $3, priority = $4, timezone = $5,
                due_at = $6, rrule = $7, ex_dates = $8, recurring_parent_id = $9, updated_at = $10
            WHERE id = $11 AND deleted_at IS NULL"#,
        )
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.status)
        .bind(&self.priority)
        .bind(&self.timezone)
        .bind(self.due_at)
        .bind(&self.rrule)
        .bind(ex_dates)
        .bind(self.recurring_parent_id)
        .bind(self.updated_at)
        .bind(self.id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

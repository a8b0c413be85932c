//! PgRecordStore - PostgreSQL record store (sqlx).
//!
//! One `tasks` table; ids come from `BIGSERIAL`, timestamps from `NOW()`.
//! The guarded writes (`claim`, `update_if_status`) are single `UPDATE ...
//! WHERE` statements, so the database decides races and the row count says
//! who won.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::domain::{
    NewTask, Payload, RecordUpdate, StoreError, TaskId, TaskRecord, TaskStatus, TaskType,
};
use crate::ports::RecordStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          BIGSERIAL PRIMARY KEY,
    type        TEXT        NOT NULL,
    payload     BYTEA       NOT NULL,
    status      TEXT        NOT NULL DEFAULT 'queued',
    retries     INTEGER     NOT NULL DEFAULT 0,
    result      BYTEA,
    last_error  TEXT,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const STATUS_INDEX: &str = "CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status)";

const COLUMNS: &str =
    "id, type, payload, status, retries, result, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error(e, "connect"))?;
        Ok(Self::new(pool))
    }

    /// Create the `tasks` table and its status index if missing.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "create table"))?;
        sqlx::query(STATUS_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "create index"))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "select task"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[tracing::instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (type, payload, status, retries) \
             VALUES ($1, $2, $3, 0) RETURNING {COLUMNS}"
        ))
        .bind(task.task_type.as_str())
        .bind(task.payload.as_bytes())
        .bind(TaskStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "insert task"))?;
        record_from_row(&row)
    }

    #[tracing::instrument(skip(self, update), fields(task_id = %update.id, status = %update.status))]
    async fn update(&self, update: RecordUpdate) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $2, \
                 retries = COALESCE($3, retries), \
                 result = COALESCE($4, result), \
                 last_error = COALESCE($5, last_error), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(update.id.get())
        .bind(update.status.as_str())
        .bind(update.retries.map(retries_to_sql))
        .bind(update.result.as_ref().map(Payload::as_bytes))
        .bind(update.last_error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "update task"))?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, update), fields(task_id = %update.id, status = %update.status))]
    async fn update_if_status(
        &self,
        expected: TaskStatus,
        update: RecordUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $2, \
                 retries = COALESCE($3, retries), \
                 result = COALESCE($4, result), \
                 last_error = COALESCE($5, last_error), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = $6",
        )
        .bind(update.id.get())
        .bind(update.status.as_str())
        .bind(update.retries.map(retries_to_sql))
        .bind(update.result.as_ref().map(Payload::as_bytes))
        .bind(update.last_error.as_deref())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "conditional update"))?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn claim(&self, id: TaskId, retries: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'processing', retries = $2, updated_at = NOW() \
             WHERE id = $1 \
               AND ((status = 'queued' AND retries = $2) \
                 OR (status = 'processing' AND retries < $2))",
        )
        .bind(id.get())
        .bind(retries_to_sql(retries))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "claim task"))?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "list tasks"))?;
        rows.iter().map(record_from_row).collect()
    }
}

fn retries_to_sql(retries: u32) -> i32 {
    i32::try_from(retries).unwrap_or(i32::MAX)
}

fn record_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let id = TaskId::new(row.try_get("id").map_err(|e| map_sqlx_error(e, "decode id"))?);
    let decode = |reason: String| StoreError::Decode { id, reason };

    let task_type: String = row.try_get("type").map_err(|e| decode(e.to_string()))?;
    let payload: Vec<u8> = row.try_get("payload").map_err(|e| decode(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| decode(e.to_string()))?;
    let retries: i32 = row.try_get("retries").map_err(|e| decode(e.to_string()))?;
    let result: Option<Vec<u8>> = row.try_get("result").map_err(|e| decode(e.to_string()))?;
    let last_error: Option<String> =
        row.try_get("last_error").map_err(|e| decode(e.to_string()))?;

    Ok(TaskRecord {
        id,
        task_type: TaskType::new(task_type),
        payload: Payload::new(payload),
        status: status.parse::<TaskStatus>().map_err(|e| decode(e.to_string()))?,
        retries: u32::try_from(retries).map_err(|e| decode(format!("retries={retries}: {e}")))?,
        result: result.map(Payload::new),
        last_error,
        created_at: row.try_get("created_at").map_err(|e| decode(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| decode(e.to_string()))?,
    })
}

fn map_sqlx_error(err: sqlx::Error, operation: &str) -> StoreError {
    StoreError::Transport(format!("postgres {operation} failed: {err}"))
}

//! RecordStore port - the source of truth for task records.
//!
//! The broker only carries hints; whatever the store says wins. Every write
//! a worker makes while holding an entry goes through here, and the two
//! guarded writes (`claim`, `update_if_status`) are what keep a worker and a
//! concurrent cancellation from overwriting each other.

use async_trait::async_trait;

use crate::domain::{NewTask, RecordUpdate, StoreError, TaskId, TaskRecord, TaskStatus};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Insert at `queued` with `retries = 0`; the store assigns the id.
    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError>;

    /// Unconditional write. Returns `false` if no such record exists.
    async fn update(&self, update: RecordUpdate) -> Result<bool, StoreError>;

    /// Write only if the record is still in `expected` status.
    /// Returns `false` when zero rows matched.
    async fn update_if_status(
        &self,
        expected: TaskStatus,
        update: RecordUpdate,
    ) -> Result<bool, StoreError>;

    /// Move a record to `processing` for an entry carrying `retries`.
    ///
    /// Matches when the record is `queued` with exactly `retries`, or is
    /// `processing` with fewer retries (the previous attempt's re-queue write
    /// never landed). Anything else means the entry is stale or the record
    /// was cancelled, and the claim returns `false`.
    async fn claim(&self, id: TaskId, retries: u32) -> Result<bool, StoreError>;

    /// All records, optionally filtered by status, ordered by id.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError>;
}

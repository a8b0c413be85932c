//! TaskService - submission, lookup and cancellation.
//!
//! The only creator of records. Shares the broker and store with the pool;
//! the two never talk to each other except through those.

use std::sync::Arc;

use crate::domain::{
    BrokerError, CancelError, LookupError, NewTask, RecordUpdate, StoreError, SubmitError,
    TaskEnvelope, TaskId, TaskRecord, TaskStatus,
};
use crate::ports::{Broker, RecordStore};

use super::status::TaskCounts;

#[derive(Clone)]
pub struct TaskService {
    broker: Arc<dyn Broker>,
    store: Arc<dyn RecordStore>,
}

impl TaskService {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>) -> Self {
        Self { broker, store }
    }

    /// Validate, insert at `queued`, then push the entry.
    ///
    /// If the push fails the record is left `queued` with no broker entry and
    /// the error carries its id.
    #[tracing::instrument(skip(self, task), fields(task_type = %task.task_type))]
    pub async fn submit(&self, task: NewTask) -> Result<TaskRecord, SubmitError> {
        task.validate()?;
        let record = self.store.insert(task).await?;

        if let Err(source) = self.broker.push(&TaskEnvelope::from_record(&record)).await {
            tracing::error!(task_id = %record.id, error = %source, "task stored but not enqueued");
            return Err(SubmitError::Broker {
                id: record.id,
                source,
            });
        }

        tracing::info!(task_id = %record.id, "task submitted");
        Ok(record)
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, LookupError> {
        self.store
            .get(id)
            .await?
            .ok_or(LookupError::NotFound(id))
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.list(status).await
    }

    /// Cancel a task that no worker has claimed yet.
    ///
    /// Only a `queued` record can be cancelled. The broker entry is removed
    /// first, then the record is flipped to `cancelled` on the condition
    /// that it is still `queued`; a worker whose claim landed in between
    /// wins and the caller gets [`CancelError::LostRace`].
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: TaskId) -> Result<(), CancelError> {
        let record = self.store.get(id).await?.ok_or(CancelError::NotFound(id))?;
        if record.status != TaskStatus::Queued {
            return Err(CancelError::Conflict {
                id,
                status: record.status,
            });
        }

        self.broker.remove(id).await?;

        let cancelled = self
            .store
            .update_if_status(
                TaskStatus::Queued,
                RecordUpdate::status(id, TaskStatus::Cancelled),
            )
            .await?;
        if !cancelled {
            tracing::warn!(task_id = %id, "cancel lost the race to a worker claim");
            return Err(CancelError::LostRace(id));
        }

        tracing::info!(task_id = %id, "task cancelled");
        Ok(())
    }

    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        let records = self.store.list(None).await?;
        Ok(TaskCounts::from_records(&records))
    }

    /// Entries currently waiting in the broker.
    pub async fn broker_depth(&self) -> Result<usize, BrokerError> {
        self.broker.len().await
    }
}

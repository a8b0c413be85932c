//! AttemptRunner - one pass of the task state machine for a popped entry.
//!
//! # Flow
//! 1. `RecordStore::claim()`: queued -> processing (guarded on status and retries)
//! 2. `ExecutorRegistry::execute()` with the entry's type and payload
//! 3. Success: result + completed
//! 4. Failure: `RetryPolicy::decide()` -> queued with retries + 1 (re-push is
//!    the caller's job), or failed
//!
//! Store writes after the claim are guarded on the record still being
//! `processing` (or `queued`, when the claim write itself failed), so a
//! cancellation that slipped in is never overwritten. They are also
//! best-effort: a transport error is logged and the outcome still stands,
//! because the broker has already handed the entry to this worker.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    Decision, ExecutionError, RecordUpdate, RetryPolicy, StoreError, TaskEnvelope, TaskStatus,
};
use crate::ports::RecordStore;

use super::registry::ExecutorRegistry;

/// What happened to one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed,

    /// The entry to re-push once `delay` has elapsed.
    RetryScheduled { entry: TaskEnvelope, delay: Duration },

    /// Retries exhausted; the record is terminal.
    Failed { retries: u32 },

    /// The claim matched no row: the record was cancelled, already finished,
    /// or this entry is a stale duplicate. Nothing was executed.
    Skipped,

    /// The executor ran but the record left our hands before the result was
    /// written (cancelled while the claim write was failing). Nothing was
    /// persisted and no retry is scheduled.
    Superseded,
}

pub struct AttemptRunner {
    store: Arc<dyn RecordStore>,
    registry: Arc<ExecutorRegistry>,
    policy: RetryPolicy,
}

impl AttemptRunner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<ExecutorRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    pub async fn run(&self, worker: usize, entry: TaskEnvelope) -> AttemptOutcome {
        let claimed = match self.store.claim(entry.id, entry.retries).await {
            Ok(true) => {
                tracing::info!(
                    worker,
                    task_id = %entry.id,
                    task_type = %entry.task_type,
                    retries = entry.retries,
                    "task claimed"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    worker,
                    task_id = %entry.id,
                    task_type = %entry.task_type,
                    retries = entry.retries,
                    "claim conflict, dropping entry"
                );
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                // 配送は確定済みなので続行する
                tracing::error!(
                    worker,
                    task_id = %entry.id,
                    error = %e,
                    "failed to mark task processing, running anyway"
                );
                false
            }
        };

        let outcome = match self.registry.execute(&entry.task_type, &entry.payload).await {
            Ok(result) => {
                let update =
                    RecordUpdate::status(entry.id, TaskStatus::Completed).with_result(result);
                self.settle(worker, &entry, claimed, update, AttemptOutcome::Completed)
                    .await
            }
            Err(err) => self.fail(worker, entry.clone(), claimed, err).await,
        };

        match &outcome {
            AttemptOutcome::Completed => tracing::info!(
                worker,
                task_id = %entry.id,
                task_type = %entry.task_type,
                retries = entry.retries,
                "task completed"
            ),
            AttemptOutcome::Superseded => tracing::warn!(
                worker,
                task_id = %entry.id,
                task_type = %entry.task_type,
                retries = entry.retries,
                "record changed during the attempt, outcome discarded"
            ),
            _ => {}
        }
        outcome
    }

    async fn fail(
        &self,
        worker: usize,
        entry: TaskEnvelope,
        claimed: bool,
        err: ExecutionError,
    ) -> AttemptOutcome {
        let error = err.to_string();
        match self.policy.decide(entry.retries) {
            Decision::Retry { retries, delay } => {
                let update = RecordUpdate::status(entry.id, TaskStatus::Queued)
                    .with_retries(retries)
                    .with_error(error.as_str());
                let retry = AttemptOutcome::RetryScheduled {
                    entry: entry.requeued(retries),
                    delay,
                };
                let outcome = self.settle(worker, &entry, claimed, update, retry).await;
                if matches!(outcome, AttemptOutcome::RetryScheduled { .. }) {
                    tracing::warn!(
                        worker,
                        task_id = %entry.id,
                        task_type = %entry.task_type,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "task failed, retry scheduled"
                    );
                }
                outcome
            }
            Decision::MarkFailed { retries } => {
                let update = RecordUpdate::status(entry.id, TaskStatus::Failed)
                    .with_retries(retries)
                    .with_error(error.as_str());
                let outcome = self
                    .settle(worker, &entry, claimed, update, AttemptOutcome::Failed { retries })
                    .await;
                if matches!(outcome, AttemptOutcome::Failed { .. }) {
                    tracing::error!(
                        worker,
                        task_id = %entry.id,
                        task_type = %entry.task_type,
                        retries,
                        error = %error,
                        "task failed permanently"
                    );
                }
                outcome
            }
        }
    }

    /// Persist the attempt's result and return `outcome`, or
    /// [`AttemptOutcome::Superseded`] if the record is no longer ours.
    ///
    /// A transport error keeps `outcome`: the write is best-effort once the
    /// broker has handed the entry over.
    async fn settle(
        &self,
        worker: usize,
        entry: &TaskEnvelope,
        claimed: bool,
        update: RecordUpdate,
        outcome: AttemptOutcome,
    ) -> AttemptOutcome {
        match self.write_guarded(claimed, update).await {
            Ok(true) => outcome,
            Ok(false) => AttemptOutcome::Superseded,
            Err(e) => {
                tracing::error!(
                    worker,
                    task_id = %entry.id,
                    error = %e,
                    "failed to persist attempt outcome"
                );
                outcome
            }
        }
    }

    /// The record is ours while it is `processing`. If the claim write was
    /// lost it may still be `queued`; any other status means a cancellation
    /// (or another worker) got there first.
    async fn write_guarded(&self, claimed: bool, update: RecordUpdate) -> Result<bool, StoreError> {
        if self
            .store
            .update_if_status(TaskStatus::Processing, update.clone())
            .await?
        {
            return Ok(true);
        }
        if claimed {
            return Ok(false);
        }
        self.store.update_if_status(TaskStatus::Queued, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Payload, TaskId, TaskRecord, TaskType};
    use crate::impls::{DoubleExecutor, InMemoryRecordStore};
    use crate::ports::Executor;
    use async_trait::async_trait;

    struct AlwaysFails;

    #[async_trait]
    impl Executor for AlwaysFails {
        async fn execute(&self, _: &TaskType, _: &Payload) -> Result<Payload, ExecutionError> {
            Err(ExecutionError::failed("boom"))
        }
    }

    /// Delegates to the in-memory store, except that every claim write is lost.
    struct ClaimUnreachable(Arc<InMemoryRecordStore>);

    #[async_trait]
    impl RecordStore for ClaimUnreachable {
        async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
            self.0.get(id).await
        }

        async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
            self.0.insert(task).await
        }

        async fn update(&self, update: RecordUpdate) -> Result<bool, StoreError> {
            self.0.update(update).await
        }

        async fn update_if_status(
            &self,
            expected: TaskStatus,
            update: RecordUpdate,
        ) -> Result<bool, StoreError> {
            self.0.update_if_status(expected, update).await
        }

        async fn claim(&self, _: TaskId, _: u32) -> Result<bool, StoreError> {
            Err(StoreError::Transport("connection reset".into()))
        }

        async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
            self.0.list(status).await
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(TaskType::new("double"), DoubleExecutor)
            .unwrap();
        registry.register(TaskType::new("flaky"), AlwaysFails).unwrap();
        Arc::new(registry)
    }

    fn lossy_claim_runner() -> (Arc<InMemoryRecordStore>, AttemptRunner) {
        let store = Arc::new(InMemoryRecordStore::new());
        let wrapped = Arc::new(ClaimUnreachable(store.clone()));
        let runner = AttemptRunner::new(wrapped, registry(), RetryPolicy::default());
        (store, runner)
    }

    async fn setup() -> (Arc<InMemoryRecordStore>, AttemptRunner) {
        let store = Arc::new(InMemoryRecordStore::new());
        let runner = AttemptRunner::new(store.clone(), registry(), RetryPolicy::default());
        (store, runner)
    }

    async fn submit(store: &InMemoryRecordStore, task_type: &str, payload: &str) -> TaskRecord {
        store.insert(NewTask::new(task_type, payload)).await.unwrap()
    }

    #[tokio::test]
    async fn success_stores_result_and_completes() {
        let (store, runner) = setup().await;
        let record = submit(&store, "double", "5").await;

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        assert_eq!(outcome, AttemptOutcome::Completed);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(Payload::from("10")));
        assert_eq!(stored.retries, 0);
    }

    #[tokio::test]
    async fn failure_requeues_with_incremented_retries() {
        let (store, runner) = setup().await;
        let record = submit(&store, "flaky", "x").await;

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        let AttemptOutcome::RetryScheduled { entry, delay } = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.status, TaskStatus::Queued);
        assert_eq!(delay, Duration::from_secs(2));

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.retries, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(stored.result, None);
    }

    #[tokio::test]
    async fn fourth_failure_is_terminal() {
        let (store, runner) = setup().await;
        let record = submit(&store, "flaky", "x").await;

        let mut entry = TaskEnvelope::from_record(&record);
        let mut attempts = 0;
        let final_retries = loop {
            attempts += 1;
            match runner.run(0, entry.clone()).await {
                AttemptOutcome::RetryScheduled { entry: next, .. } => entry = next,
                AttemptOutcome::Failed { retries } => break retries,
                other => panic!("unexpected outcome {other:?}"),
            }
        };

        assert_eq!(attempts, 4);
        assert_eq!(final_retries, 3);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retries, 3);
    }

    #[tokio::test]
    async fn unknown_type_goes_through_retry_policy() {
        let (store, runner) = setup().await;
        let record = submit(&store, "resize", "x").await;

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        assert!(matches!(outcome, AttemptOutcome::RetryScheduled { .. }));
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("resize"));
    }

    #[tokio::test]
    async fn cancelled_record_is_skipped_without_executing() {
        let (store, runner) = setup().await;
        let record = submit(&store, "double", "5").await;
        store
            .update(RecordUpdate::status(record.id, TaskStatus::Cancelled))
            .await
            .unwrap();

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        assert_eq!(outcome, AttemptOutcome::Skipped);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.result, None);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_double_count() {
        let (store, runner) = setup().await;
        let record = submit(&store, "flaky", "x").await;
        let entry = TaskEnvelope::from_record(&record);

        runner.run(0, entry.clone()).await;
        let second = runner.run(1, entry).await;

        assert_eq!(second, AttemptOutcome::Skipped);
        assert_eq!(store.get(record.id).await.unwrap().unwrap().retries, 1);
    }

    #[tokio::test]
    async fn store_outage_does_not_stop_the_attempt() {
        let (store, runner) = setup().await;
        let record = submit(&store, "double", "5").await;
        store.set_unreachable(true);

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        assert_eq!(outcome, AttemptOutcome::Completed);
    }

    #[tokio::test]
    async fn lost_claim_still_records_the_outcome() {
        let (store, runner) = lossy_claim_runner();
        let record = submit(&store, "double", "5").await;

        let outcome = runner.run(0, TaskEnvelope::from_record(&record)).await;
        assert_eq!(outcome, AttemptOutcome::Completed);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(Payload::from("10")));
    }

    #[tokio::test]
    async fn cancellation_during_lost_claim_is_not_overwritten() {
        let (store, runner) = lossy_claim_runner();
        let record = submit(&store, "double", "5").await;
        let entry = TaskEnvelope::from_record(&record);
        store
            .update_if_status(
                TaskStatus::Queued,
                RecordUpdate::status(record.id, TaskStatus::Cancelled),
            )
            .await
            .unwrap();

        let outcome = runner.run(0, entry).await;
        assert_eq!(outcome, AttemptOutcome::Superseded);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.result, None);
    }

    #[tokio::test]
    async fn cancellation_during_lost_claim_drops_the_retry() {
        let (store, runner) = lossy_claim_runner();
        let record = submit(&store, "flaky", "x").await;
        let entry = TaskEnvelope::from_record(&record);
        store
            .update(RecordUpdate::status(record.id, TaskStatus::Cancelled))
            .await
            .unwrap();

        let outcome = runner.run(0, entry).await;
        assert_eq!(outcome, AttemptOutcome::Superseded);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.retries, 0);
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn terminal_write_carries_final_retries() {
        let (store, runner) = lossy_claim_runner();
        let record = submit(&store, "flaky", "x").await;
        // 直前の再キュー書き込みが失われた状態: retries は 1 のまま
        store
            .update(RecordUpdate::status(record.id, TaskStatus::Queued).with_retries(1))
            .await
            .unwrap();

        let outcome = runner.run(0, TaskEnvelope::from_record(&record).requeued(3)).await;
        assert_eq!(outcome, AttemptOutcome::Failed { retries: 3 });
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retries, 3);
    }
}

//! WorkerPool - fixed-size set of workers draining the broker.
//!
//! Each worker loops pop -> [`AttemptRunner::run`] -> (maybe) hand the retry
//! to the [`RetryScheduler`]. One `watch` channel carries the shutdown
//! signal to every worker and to the scheduler.
//!
//! Shutdown is cooperative:
//! - the signal is checked before each pop
//! - a pop already in flight ends by its own timeout
//! - an attempt already running finishes, persist step included
//!
//! so a worker stops within one poll timeout plus one task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::BrokerError;
use crate::ports::Broker;

use super::attempt::{AttemptOutcome, AttemptRunner};
use super::retry_scheduler::{RetryScheduler, RetrySender, ShutdownRetryMode};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,

    /// How long one pop blocks; also the worst-case wait for shutdown.
    pub poll_timeout: Duration,

    /// Pause after a broker transport error before polling again.
    pub error_backoff: Duration,

    pub retry_on_shutdown: ShutdownRetryMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            poll_timeout: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
            retry_on_shutdown: ShutdownRetryMode::Flush,
        }
    }
}

impl WorkerConfig {
    /// Zero is bumped to one.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_retry_on_shutdown(mut self, mode: ShutdownRetryMode) -> Self {
        self.retry_on_shutdown = mode;
        self
    }
}

/// A configured pool, ready to start. Built by
/// [`WorkerPoolBuilder`](super::WorkerPoolBuilder).
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    runner: Arc<AttemptRunner>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub(crate) fn new(broker: Arc<dyn Broker>, runner: AttemptRunner, config: WorkerConfig) -> Self {
        Self {
            broker,
            runner: Arc::new(runner),
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the workers and the retry scheduler on a caller-owned signal.
    ///
    /// Sending `true` (or dropping the sender) stops the pool; the returned
    /// handle's [`join`](WorkerPoolHandle::join) waits for all of it.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> WorkerPoolHandle {
        let (retries, scheduler) = RetryScheduler::spawn(
            Arc::clone(&self.broker),
            self.config.retry_on_shutdown,
            shutdown.clone(),
        );

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker in 0..self.config.worker_count {
            let ctx = WorkerContext {
                worker,
                broker: Arc::clone(&self.broker),
                runner: Arc::clone(&self.runner),
                retries: retries.clone(),
                poll_timeout: self.config.poll_timeout,
                error_backoff: self.config.error_backoff,
            };
            workers.push(tokio::spawn(worker_loop(ctx, shutdown.clone())));
        }
        // ワーカーだけが sender を持つ。全員抜けたら scheduler も止まれる
        drop(retries);

        tracing::info!(workers = self.config.worker_count, "worker pool started");
        WorkerPoolHandle {
            shutdown_tx: None,
            workers,
            scheduler,
        }
    }

    /// Like [`start`](Self::start), but the handle owns the signal.
    pub fn spawn(&self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handle = self.start(shutdown_rx);
        handle.shutdown_tx = Some(shutdown_tx);
        handle
    }
}

/// Running pool.
/// - `request_shutdown()` で全ワーカーに停止を伝える
/// - `join()` で全ワーカーと retry scheduler の終了を待てる
pub struct WorkerPoolHandle {
    shutdown_tx: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
    scheduler: JoinHandle<()>,
}

impl WorkerPoolHandle {
    /// Ask every worker to stop after its current pop or attempt. No-op for
    /// pools started on a caller-owned signal.
    pub fn request_shutdown(&self) {
        if let Some(tx) = &self.shutdown_tx {
            // ignore send error: receivers may already be dropped
            let _ = tx.send(true);
        }
    }

    /// Wait until every worker and the retry scheduler have stopped.
    pub async fn join(self) {
        // Keep the sender alive until the end; dropping it early would read
        // as a shutdown signal.
        let _shutdown_tx = self.shutdown_tx;
        for (worker, join) in self.workers.into_iter().enumerate() {
            if let Err(e) = join.await {
                tracing::error!(worker, error = %e, "worker task panicked");
            }
        }
        if let Err(e) = self.scheduler.await {
            tracing::error!(error = %e, "retry scheduler task panicked");
        }
        tracing::info!("all workers stopped");
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.join().await;
    }
}

struct WorkerContext {
    worker: usize,
    broker: Arc<dyn Broker>,
    runner: Arc<AttemptRunner>,
    retries: RetrySender,
    poll_timeout: Duration,
    error_backoff: Duration,
}

fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) -> bool {
    // A dropped sender counts as a shutdown.
    *shutdown.borrow_and_update() || shutdown.has_changed().is_err()
}

async fn worker_loop(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let worker = ctx.worker;
    tracing::debug!(worker, "worker started");

    loop {
        // shutdown が来ていたら抜ける
        if shutdown_requested(&mut shutdown) {
            break;
        }

        // pop は自前のタイムアウトで終わるので shutdown とは競合させない
        let entry = match ctx.broker.pop(ctx.poll_timeout).await {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(BrokerError::Decode(reason)) => {
                tracing::error!(worker, error = %reason, "dropping undecodable broker entry");
                continue;
            }
            Err(e) => {
                tracing::warn!(
                    worker,
                    error = %e,
                    backoff_ms = ctx.error_backoff.as_millis() as u64,
                    "broker pop failed"
                );
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(ctx.error_backoff) => {}
                }
                continue;
            }
        };

        if let AttemptOutcome::RetryScheduled { entry, delay } = ctx.runner.run(worker, entry).await
        {
            ctx.retries.schedule(entry, delay);
        }
    }

    tracing::debug!(worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ExecutorRegistry;
    use crate::domain::{NewTask, RetryPolicy, TaskEnvelope, TaskStatus, TaskType};
    use crate::impls::{DoubleExecutor, InMemoryBroker, InMemoryRecordStore};
    use crate::domain::TaskId;
    use crate::ports::RecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Counts pop calls on the way through.
    struct CountingBroker {
        inner: Arc<InMemoryBroker>,
        pops: AtomicUsize,
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn push(&self, entry: &TaskEnvelope) -> Result<(), BrokerError> {
            self.inner.push(entry).await
        }

        async fn pop(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, BrokerError> {
            self.pops.fetch_add(1, Ordering::SeqCst);
            self.inner.pop(timeout).await
        }

        async fn remove(&self, id: TaskId) -> Result<(), BrokerError> {
            self.inner.remove(id).await
        }

        async fn len(&self) -> Result<usize, BrokerError> {
            self.inner.len().await
        }
    }

    fn pool(
        broker: Arc<dyn Broker>,
        store: Arc<InMemoryRecordStore>,
        config: WorkerConfig,
    ) -> WorkerPool {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(TaskType::new("double"), DoubleExecutor)
            .unwrap();
        let runner = AttemptRunner::new(store, Arc::new(registry), RetryPolicy::default());
        WorkerPool::new(broker, runner, config)
    }

    #[test]
    fn default_config_matches_fixed_policy() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.error_backoff, Duration::from_secs(1));
        assert_eq!(config.retry_on_shutdown, ShutdownRetryMode::Flush);
        assert_eq!(WorkerConfig::default().with_worker_count(0).worker_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pool_stops_within_one_poll_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryRecordStore::new());
        let handle = pool(broker, store, WorkerConfig::default().with_worker_count(3)).spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let start = Instant::now();
        handle.shutdown_and_join().await;
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_external_sender_stops_the_pool() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryRecordStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = pool(broker, store, WorkerConfig::default()).start(rx);

        drop(tx);
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_the_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryRecordStore::new());
        let mut ids = Vec::new();
        for n in 1..=10 {
            let record = store
                .insert(NewTask::new("double", n.to_string().as_str()))
                .await
                .unwrap();
            broker.push(&TaskEnvelope::from_record(&record)).await.unwrap();
            ids.push(record.id);
        }

        let handle = pool(broker.clone(), store.clone(), WorkerConfig::default()).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown_and_join().await;

        for id in ids {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, TaskStatus::Completed);
        }
        assert_eq!(broker.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_outage_backs_off_instead_of_spinning() {
        let inner = Arc::new(InMemoryBroker::new());
        let broker = Arc::new(CountingBroker {
            inner: inner.clone(),
            pops: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryRecordStore::new());
        inner.set_unreachable(true);

        let handle = pool(
            broker.clone(),
            store.clone(),
            WorkerConfig::default().with_worker_count(1),
        )
        .spawn();

        // 1 秒おきに再試行するので 2.5 秒で pop は t=0, 1, 2 の 3 回まで
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let pops_during_outage = broker.pops.load(Ordering::SeqCst);
        assert!(
            (2..=3).contains(&pops_during_outage),
            "pops during outage: {pops_during_outage}"
        );

        inner.set_unreachable(false);
        let record = store.insert(NewTask::new("double", "4")).await.unwrap();
        inner.push(&TaskEnvelope::from_record(&record)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.shutdown_and_join().await;

        let record = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_error_backoff() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryRecordStore::new());
        broker.set_unreachable(true);

        let config = WorkerConfig::default()
            .with_worker_count(1)
            .with_error_backoff(Duration::from_secs(60));
        let handle = pool(broker, store, config).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let start = Instant::now();
        handle.shutdown_and_join().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

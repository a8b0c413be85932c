//! RetryScheduler - delay queue for retry re-pushes.
//!
//! Workers hand failed entries to a [`RetrySender`] and go straight back to
//! polling. One scheduler task owns a min-heap of due times and pushes each
//! entry to the broker when its delay elapses.
//!
//! On shutdown the pending entries are either pushed immediately
//! ([`ShutdownRetryMode::Flush`]) or dropped with their ids logged
//! ([`ShutdownRetryMode::Abandon`]). Either happens only once every sender
//! is gone: a worker finishing its last attempt after the signal still gets
//! its retry handled, and no flushed entry lands in front of a worker that
//! is still polling.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::domain::{TaskEnvelope, TaskId};
use crate::ports::Broker;

/// What to do with retries still waiting when the pool shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownRetryMode {
    /// Push them to the broker right away.
    #[default]
    Flush,

    /// Drop them. Their records stay `queued` with no broker entry.
    Abandon,
}

/// Entry waiting for its delay.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap (earliest first);
/// `seq` keeps equal due times in submission order.
#[derive(Debug)]
struct ScheduledRetry {
    due: Instant,
    seq: u64,
    entry: TaskEnvelope,
}

impl PartialEq for ScheduledRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledRetry {}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Worker-side handle. Cloned once per worker.
#[derive(Clone)]
pub struct RetrySender {
    tx: mpsc::UnboundedSender<(TaskEnvelope, Instant)>,
}

impl RetrySender {
    /// Queue `entry` for a re-push after `delay`. Returns `false` if the
    /// scheduler is already gone.
    pub fn schedule(&self, entry: TaskEnvelope, delay: Duration) -> bool {
        let id = entry.id;
        if self.tx.send((entry, Instant::now() + delay)).is_err() {
            tracing::error!(task_id = %id, "retry scheduler stopped, retry dropped");
            return false;
        }
        true
    }
}

pub struct RetryScheduler {
    broker: Arc<dyn Broker>,
    mode: ShutdownRetryMode,
    pending: BinaryHeap<ScheduledRetry>,
    next_seq: u64,
}

impl RetryScheduler {
    /// Start the scheduler task.
    ///
    /// The task runs until `shutdown` fires (or its sender is dropped) *and*
    /// every [`RetrySender`] clone has been dropped.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        mode: ShutdownRetryMode,
        shutdown: watch::Receiver<bool>,
    ) -> (RetrySender, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            broker,
            mode,
            pending: BinaryHeap::new(),
            next_seq: 0,
        };
        let join = tokio::spawn(scheduler.run(rx, shutdown));
        (RetrySender { tx }, join)
    }

    fn enqueue(&mut self, entry: TaskEnvelope, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(ScheduledRetry { due, seq, entry });
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<(TaskEnvelope, Instant)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut senders_open = true;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let next_due = self.pending.peek().map(|s| s.due);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                msg = rx.recv(), if senders_open => match msg {
                    Some((entry, due)) => self.enqueue(entry, due),
                    None => senders_open = false,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.push_due().await;
                }
            }

            if !senders_open && self.pending.is_empty() {
                tracing::debug!("retry scheduler idle with no senders left, stopping");
                return;
            }
        }

        self.drain_on_shutdown(rx).await;
    }

    async fn push_due(&mut self) {
        let now = Instant::now();
        while self.pending.peek().is_some_and(|s| s.due <= now) {
            if let Some(scheduled) = self.pending.pop() {
                self.push(scheduled.entry).await;
            }
        }
    }

    async fn push(&self, entry: TaskEnvelope) {
        match self.broker.push(&entry).await {
            Ok(()) => {
                tracing::debug!(task_id = %entry.id, retries = entry.retries, "retry re-pushed");
            }
            Err(e) => {
                tracing::error!(
                    task_id = %entry.id,
                    retries = entry.retries,
                    error = %e,
                    "retry re-push failed, task left queued without a broker entry"
                );
            }
        }
    }

    async fn drain_on_shutdown(
        mut self,
        mut rx: mpsc::UnboundedReceiver<(TaskEnvelope, Instant)>,
    ) {
        // Hold everything until the workers are gone, so nothing flushed
        // here is picked up by a pop that was still in flight.
        while let Some((entry, due)) = rx.recv().await {
            self.enqueue(entry, due);
        }

        tracing::info!(
            pending = self.pending.len(),
            mode = ?self.mode,
            "retry scheduler shutting down"
        );

        let mut abandoned: Vec<TaskId> = Vec::new();
        while let Some(scheduled) = self.pending.pop() {
            match self.mode {
                ShutdownRetryMode::Flush => self.push(scheduled.entry).await,
                ShutdownRetryMode::Abandon => abandoned.push(scheduled.entry.id),
            }
        }

        if !abandoned.is_empty() {
            tracing::warn!(
                count = abandoned.len(),
                task_ids = ?abandoned,
                "pending retries abandoned on shutdown"
            );
        }
        tracing::info!("retry scheduler stopped");
    }
}

//! Broker port - shared hand-off of runnable task entries.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, TaskEnvelope, TaskId};

/// A durable, shared, ordered collection of [`TaskEnvelope`]s.
///
/// Contract:
/// - `push` inserts at the head.
/// - `pop` takes from the tail, so consumers see oldest-pushed-first. Retry
///   re-pushes go to the head like any new entry, so there is no FIFO
///   guarantee across tasks.
/// - Each entry is delivered to at most one `pop` caller.
/// - `remove` is a linear scan over the queued entries; missing entries are
///   not an error because removal races with delivery.
///
/// Delivery is at-least-once from the caller's point of view: an entry that
/// was popped and never finished is gone from the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, entry: &TaskEnvelope) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for an entry. `Ok(None)` means the wait expired.
    async fn pop(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, BrokerError>;

    /// Delete the first queued entry for `id`, if any.
    async fn remove(&self, id: TaskId) -> Result<(), BrokerError>;

    /// Number of entries currently queued.
    async fn len(&self) -> Result<usize, BrokerError>;
}

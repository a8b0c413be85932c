//! InMemoryBroker - process-local broker for tests and development.
//!
//! Same shape as the Redis list: `push` goes to the front, `pop` takes from
//! the back, `remove` scans from the front. One tokio `Mutex` guards the
//! deque, so delivery is mutually exclusive; `Notify` wakes blocked pops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{BrokerError, TaskEnvelope, TaskId};
use crate::ports::Broker;

#[derive(Default)]
pub struct InMemoryBroker {
    entries: Mutex<VecDeque<TaskEnvelope>>,
    notify: Notify,
    /// Fault injection: every call fails with a transport error while set.
    unreachable: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the transport going away (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Queued entries, head first.
    pub async fn snapshot(&self) -> Vec<TaskEnvelope> {
        self.entries.lock().await.iter().cloned().collect()
    }

    fn check_transport(&self) -> Result<(), BrokerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("in-memory broker marked unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push(&self, entry: &TaskEnvelope) -> Result<(), BrokerError> {
        self.check_transport()?;
        self.entries.lock().await.push_front(entry.clone());
        // 待機中の pop を一つだけ起こす
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, BrokerError> {
        self.check_transport()?;
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking, so a push between the check
            // and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.entries.lock().await.pop_back() {
                return Ok(Some(entry));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.entries.lock().await.pop_back());
            }
            self.check_transport()?;
        }
    }

    async fn remove(&self, id: TaskId) -> Result<(), BrokerError> {
        self.check_transport()?;
        let mut entries = self.entries.lock().await;
        if let Some(pos) = entries.iter().position(|entry| entry.id == id) {
            entries.remove(pos);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, BrokerError> {
        self.check_transport()?;
        Ok(self.entries.lock().await.len())
    }
}

//! RedisBroker - the production broker, one Redis list per queue.
//!
//! | Operation | Redis |
//! |-----------|-------|
//! | `push`    | `LPUSH key <json>` |
//! | `pop`     | `RPOP key`, polled until the timeout elapses |
//! | `remove`  | `LRANGE key 0 -1`, then `LREM key 1 <raw>` for the first match |
//! | `len`     | `LLEN key` |
//!
//! Entries are [`TaskEnvelope`] JSON. `RPOP` is atomic on the server, so each
//! entry reaches at most one consumer.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;

use crate::domain::{BrokerError, TaskEnvelope, TaskId};
use crate::ports::Broker;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    key: String,
    poll_interval: Duration,
}

impl RedisBroker {
    /// Connect and `PING`; fails fast if the server is not reachable.
    ///
    /// `url` is `redis://[:<password>@]<host>:<port>[/<db>]`.
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Transport(format!("invalid redis url {url}: {e}")))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Transport(format!("failed to connect to {url}: {e}")))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "PING"))?;
        tracing::debug!(%pong, url, "redis broker connected");

        Ok(Self {
            conn,
            key: key.into(),
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_pop(&self) -> Result<Option<TaskEnvelope>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "RPOP"))?;

        match raw {
            None => Ok(None),
            Some(raw) => TaskEnvelope::decode(&raw)
                .map(Some)
                .map_err(|e| BrokerError::Decode(format!("{e}: {raw}"))),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, entry: &TaskEnvelope) -> Result<(), BrokerError> {
        let raw = entry
            .encode()
            .map_err(|e| BrokerError::Decode(format!("encode task {}: {e}", entry.id)))?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "LPUSH"))?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.try_pop().await? {
                return Ok(Some(entry));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn remove(&self, id: TaskId) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "LRANGE"))?;

        // 解読できないエントリは飛ばす
        let Some(raw) = entries
            .into_iter()
            .find(|raw| TaskEnvelope::decode(raw).is_ok_and(|entry| entry.id == id))
        else {
            return Ok(());
        };

        let removed: i64 = redis::cmd("LREM")
            .arg(&self.key)
            .arg(1)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "LREM"))?;
        tracing::debug!(task_id = %id, removed, "broker entry removed");
        Ok(())
    }

    async fn len(&self) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "LLEN"))?;
        Ok(len)
    }
}

fn map_redis_error(err: redis::RedisError, command: &str) -> BrokerError {
    BrokerError::Transport(format!("redis {command} failed: {err}"))
}

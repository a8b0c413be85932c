//! TaskEnvelope: the broker entry.
//!
//! A snapshot of the routing-relevant fields of a [`TaskRecord`], enough for
//! a worker to run an attempt without reading the record store first.

use serde::{Deserialize, Serialize};

use super::{Payload, TaskId, TaskRecord, TaskStatus, TaskType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Payload,
    pub status: TaskStatus,
    pub retries: u32,
}

impl TaskEnvelope {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            task_type: record.task_type.clone(),
            payload: record.payload.clone(),
            status: record.status,
            retries: record.retries,
        }
    }

    /// The entry to re-push after a failed attempt.
    pub fn requeued(&self, retries: u32) -> Self {
        Self {
            status: TaskStatus::Queued,
            retries,
            ..self.clone()
        }
    }

    /// Wire form used by brokers that store bytes.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

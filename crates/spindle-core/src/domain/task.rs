//! Task record: the durable, authoritative description of one unit of work.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::TaskId;
use super::errors::ValidationError;

/// Opaque tag selecting an executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque byte blob. The encoding belongs to the executor.
///
/// JSON snapshots carry it as a base64 string so arbitrary bytes survive the
/// broker round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode any serializable value as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Human-readable rendering for logs and the CLI.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// Task status.
///
/// State transitions:
/// - Queued -> Processing -> Completed
/// - Queued -> Processing -> Queued (retry, `retries` incremented)
/// - Queued -> Processing -> Failed (retries exhausted)
/// - Queued -> Cancelled (only before a worker claims it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct ParseStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lowered)
            .ok_or(ParseStatusError(s.to_string()))
    }
}

/// A persisted task.
///
/// Mutated only by the worker holding its broker entry, or by cancellation
/// while it is still `Queued`. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Payload,
    pub status: TaskStatus,

    /// Failed execution attempts so far. Never reset.
    pub retries: u32,

    /// Present only once `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,

    /// Message of the most recent execution failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Submission input: everything the store does not assign itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Payload,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            task_type: TaskType::new(task_type),
            payload: payload.into(),
        }
    }

    /// Reject malformed submissions before they reach the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_type.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }
        if self.payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        Ok(())
    }
}

/// A write against one record.
///
/// `status` is always written and bumps `updated_at`; the optional fields are
/// left untouched when `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub id: TaskId,
    pub status: TaskStatus,
    pub retries: Option<u32>,
    pub result: Option<Payload>,
    pub last_error: Option<String>,
}

impl RecordUpdate {
    pub fn status(id: TaskId, status: TaskStatus) -> Self {
        Self {
            id,
            status,
            retries: None,
            result: None,
            last_error: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Apply this update to an in-memory copy of the record.
    pub fn apply_to(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        record.status = self.status;
        if let Some(retries) = self.retries {
            record.retries = retries;
        }
        if let Some(result) = &self.result {
            record.result = Some(result.clone());
        }
        if let Some(error) = &self.last_error {
            record.last_error = Some(error.clone());
        }
        record.updated_at = now;
    }
}

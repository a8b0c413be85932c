//! Error taxonomy.
//!
//! - Transport: broker or record store unreachable. Logged by the worker loop,
//!   never fatal to a worker.
//! - Execution: executor failure. Drives the retry policy.
//! - Conflict: cancellation of a record that is no longer queued.
//! - Validation: malformed submission, rejected before anything is stored.

use thiserror::Error;

use super::{TaskId, TaskStatus, TaskType};

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Transport(String),

    #[error("undecodable broker entry: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record store unreachable: {0}")]
    Transport(String),

    #[error("corrupt record {id}: {reason}")]
    Decode { id: TaskId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("no executor registered for task_type={0}")]
    UnknownType(TaskType),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task type must not be empty")]
    EmptyType,

    #[error("payload must not be empty")]
    EmptyPayload,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to insert task: {0}")]
    Store(#[from] StoreError),

    /// The record exists (queued) but never reached the broker.
    #[error("task {id} stored but not enqueued: {source}")]
    Broker {
        id: TaskId,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} cannot be cancelled from status: {status}")]
    Conflict { id: TaskId, status: TaskStatus },

    /// The record was queued when checked but a worker claimed it before
    /// the guarded update landed.
    #[error("task {0} was claimed before it could be cancelled")]
    LostRace(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to remove task from broker: {0}")]
    Broker(#[from] BrokerError),
}

impl CancelError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CancelError::Conflict { .. } | CancelError::LostRace(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate executor for task_type={0}")]
    Duplicate(TaskType),

    #[error("missing executors for task types: {0:?}")]
    Missing(Vec<String>),
}

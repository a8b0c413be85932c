//! Executor port - the work function for one task type.

use async_trait::async_trait;

use crate::domain::{ExecutionError, Payload, TaskType};

/// Runs the work for a task type.
///
/// Executors see each payload at least once; making repeated runs harmless
/// is up to them. A run is expected to be bounded: the pool does not time
/// executors out, so a hung executor holds its worker slot.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task_type: &TaskType, payload: &Payload)
    -> Result<Payload, ExecutionError>;
}

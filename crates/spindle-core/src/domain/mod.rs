//! Domain model (ids, task records, broker entries, retry policy, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod task;

pub use envelope::TaskEnvelope;
pub use errors::{
    BrokerError, CancelError, ExecutionError, LookupError, RegistryError, StoreError,
    SubmitError, ValidationError,
};
pub use ids::TaskId;
pub use retry::{Decision, RetryPolicy};
pub use task::{NewTask, ParseStatusError, Payload, RecordUpdate, TaskRecord, TaskStatus, TaskType};

//! Executors shipped with the core.
//!
//! - [`JsonExecutor`]: adapter from a typed closure to the byte-level
//!   [`Executor`] port (decode JSON in, encode JSON out)
//! - [`DoubleExecutor`]: the reference `double` task (number in, 2x out)
//! - [`FaultInjector`]: wraps any executor and fails a fraction of calls, for
//!   chaos runs only

use std::marker::PhantomData;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{ExecutionError, Payload, TaskType};
use crate::ports::Executor;

/// Typed executor over JSON payloads.
///
/// ```ignore
/// let exec = JsonExecutor::new(|name: String| Ok(format!("hello, {name}")));
/// registry.register(TaskType::new("greet"), exec)?;
/// ```
pub struct JsonExecutor<I, O, F> {
    run: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> JsonExecutor<I, O, F>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> Result<O, ExecutionError> + Send + Sync,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> Executor for JsonExecutor<I, O, F>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> Result<O, ExecutionError> + Send + Sync,
{
    async fn execute(
        &self,
        _task_type: &TaskType,
        payload: &Payload,
    ) -> Result<Payload, ExecutionError> {
        let input: I = serde_json::from_slice(payload.as_bytes())
            .map_err(|e| ExecutionError::InvalidPayload(format!("json decode: {e}")))?;
        let output = (self.run)(input)?;
        Payload::json(&output).map_err(|e| ExecutionError::failed(format!("json encode: {e}")))
    }
}

/// Doubles a JSON integer payload: `5` becomes `10`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleExecutor;

impl DoubleExecutor {
    pub const TYPE: &'static str = "double";
}

#[async_trait]
impl Executor for DoubleExecutor {
    async fn execute(
        &self,
        _task_type: &TaskType,
        payload: &Payload,
    ) -> Result<Payload, ExecutionError> {
        let n: i64 = serde_json::from_slice(payload.as_bytes())
            .map_err(|e| ExecutionError::InvalidPayload(format!("expected an integer: {e}")))?;
        let doubled = n
            .checked_mul(2)
            .ok_or_else(|| ExecutionError::failed(format!("{n} * 2 overflows")))?;
        Payload::json(&doubled).map_err(|e| ExecutionError::failed(format!("json encode: {e}")))
    }
}

/// Fails a fraction of calls before they reach the wrapped executor.
pub struct FaultInjector<E> {
    inner: E,
    failure_rate: f64,
}

impl<E: Executor> FaultInjector<E> {
    /// `failure_rate` is clamped to `0.0..=1.0`.
    pub fn new(inner: E, failure_rate: f64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl<E: Executor> Executor for FaultInjector<E> {
    async fn execute(
        &self,
        task_type: &TaskType,
        payload: &Payload,
    ) -> Result<Payload, ExecutionError> {
        // ThreadRng is !Send, so it must not live across the await below.
        let inject = rand::thread_rng().gen_bool(self.failure_rate);
        if inject {
            return Err(ExecutionError::failed("injected failure"));
        }
        self.inner.execute(task_type, payload).await
    }
}

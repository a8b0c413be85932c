//! WorkerPoolBuilder - wires broker, store and executors into a pool.
//!
//! Fail-fast: `expect_types()` lists the task types the deployment must be
//! able to run, and `build()` refuses to produce a pool if any of them has no
//! executor, instead of letting those tasks burn through their retries at
//! runtime.

use std::sync::Arc;

use crate::domain::{RegistryError, RetryPolicy, TaskType};
use crate::ports::{Broker, Executor, RecordStore};

use super::attempt::AttemptRunner;
use super::registry::ExecutorRegistry;
use super::worker_pool::{WorkerConfig, WorkerPool};

/// # 使用例
/// ```ignore
/// let pool = WorkerPoolBuilder::new(broker, store)
///     .register("double", DoubleExecutor)?
///     .expect_types(&["double"])
///     .config(WorkerConfig::default().with_worker_count(8))
///     .build()?;
/// let handle = pool.spawn();
/// ```
pub struct WorkerPoolBuilder {
    broker: Arc<dyn Broker>,
    store: Arc<dyn RecordStore>,
    registry: ExecutorRegistry,
    expected_types: Option<Vec<String>>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl WorkerPoolBuilder {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            broker,
            store,
            registry: ExecutorRegistry::new(),
            expected_types: None,
            policy: RetryPolicy::default(),
            config: WorkerConfig::default(),
        }
    }

    /// Register an executor for `task_type`.
    pub fn register<E: Executor + 'static>(
        mut self,
        task_type: impl Into<String>,
        executor: E,
    ) -> Result<Self, RegistryError> {
        self.registry.register(TaskType::new(task_type), executor)?;
        Ok(self)
    }

    /// Replace the registry wholesale (executors registered so far are lost).
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Task types that must have an executor by `build()`.
    pub fn expect_types(mut self, task_types: &[&str]) -> Self {
        self.expected_types = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Freeze the registry and produce the pool.
    ///
    /// Fails with [`RegistryError::Missing`] if `expect_types()` named a type
    /// with no executor.
    pub fn build(self) -> Result<WorkerPool, RegistryError> {
        if let Some(expected) = &self.expected_types {
            self.registry.ensure_registered(expected)?;
        }
        tracing::debug!(
            task_types = ?self.registry.registered_types(),
            max_retries = self.policy.max_retries,
            "worker pool built"
        );
        let runner = AttemptRunner::new(self.store, Arc::new(self.registry), self.policy);
        Ok(WorkerPool::new(self.broker, runner, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{DoubleExecutor, InMemoryBroker, InMemoryRecordStore};

    fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryRecordStore::new()),
        )
    }

    #[test]
    fn build_success() {
        let pool = builder()
            .register("double", DoubleExecutor)
            .unwrap()
            .expect_types(&["double"])
            .build();
        assert!(pool.is_ok());
    }

    #[test]
    fn build_missing_task_types() {
        let pool = builder()
            .register("double", DoubleExecutor)
            .unwrap()
            .expect_types(&["double", "resize"])
            .build();
        assert!(matches!(
            pool,
            Err(RegistryError::Missing(missing)) if missing == vec!["resize".to_string()]
        ));
    }

    #[test]
    fn build_no_expect_types() {
        assert!(builder().build().is_ok());
    }

    #[test]
    fn duplicate_register_fails() {
        let result = builder()
            .register("double", DoubleExecutor)
            .unwrap()
            .register("double", DoubleExecutor);
        assert!(matches!(result, Err(RegistryError::Duplicate(_))));
    }

    #[test]
    fn config_reaches_the_pool() {
        let pool = builder()
            .config(WorkerConfig::default().with_worker_count(8))
            .build()
            .unwrap();
        assert_eq!(pool.config().worker_count, 8);
    }
}

//! ExecutorRegistry - task_type -> executor.
//!
//! Built during initialization (mutable), used during runtime (immutable):
//! the pool takes it behind an `Arc` and never touches it again, so no locks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{ExecutionError, Payload, RegistryError, TaskType};
use crate::ports::Executor;

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. A second executor for the same type is an error.
    pub fn register<E: Executor + 'static>(
        &mut self,
        task_type: TaskType,
        executor: E,
    ) -> Result<(), RegistryError> {
        self.register_arc(task_type, Arc::new(executor))
    }

    pub fn register_arc(
        &mut self,
        task_type: TaskType,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        if self.executors.contains_key(&task_type) {
            return Err(RegistryError::Duplicate(task_type));
        }
        self.executors.insert(task_type, executor);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn Executor>> {
        self.executors.get(task_type)
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .executors
            .keys()
            .map(|t| t.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    /// Fails with the expected types that have no executor.
    pub fn ensure_registered(&self, expected: &[String]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|t| !self.executors.contains_key(&TaskType::new(t.as_str())))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Missing(missing))
        }
    }

    /// Run the executor for `task_type`; unknown types fail fast.
    pub async fn execute(
        &self,
        task_type: &TaskType,
        payload: &Payload,
    ) -> Result<Payload, ExecutionError> {
        let executor = self
            .get(task_type)
            .ok_or_else(|| ExecutionError::UnknownType(task_type.clone()))?;
        executor.execute(task_type, payload).await
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::DoubleExecutor;

    fn registry() -> ExecutorRegistry {
        let mut reg = ExecutorRegistry::new();
        reg.register(TaskType::new(DoubleExecutor::TYPE), DoubleExecutor)
            .unwrap();
        reg
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = registry();
        let err = reg
            .register(TaskType::new(DoubleExecutor::TYPE), DoubleExecutor)
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(TaskType::new("double")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ensure_registered_lists_missing_types() {
        let reg = registry();
        assert!(reg.ensure_registered(&["double".to_string()]).is_ok());

        let err = reg
            .ensure_registered(&["double".to_string(), "resize".to_string()])
            .unwrap_err();
        assert_eq!(err, RegistryError::Missing(vec!["resize".to_string()]));
    }

    #[tokio::test]
    async fn execute_dispatches_by_type() {
        let out = registry()
            .execute(&TaskType::new("double"), &Payload::from("21"))
            .await
            .unwrap();
        assert_eq!(out, Payload::from("42"));
    }

    #[tokio::test]
    async fn unknown_type_fails_fast() {
        let err = registry()
            .execute(&TaskType::new("resize"), &Payload::from("1"))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::UnknownType(TaskType::new("resize")));
    }
}

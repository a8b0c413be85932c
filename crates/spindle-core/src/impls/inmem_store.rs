//! InMemoryRecordStore - record store for tests and development.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{NewTask, RecordUpdate, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::{Clock, RecordStore, SystemClock};

struct StoreState {
    records: BTreeMap<TaskId, TaskRecord>,

    /// Next id to assign.
    next_id: i64,
}

impl StoreState {
    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        id
    }
}

pub struct InMemoryRecordStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    unreachable: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                records: BTreeMap::new(),
                next_id: 1,
            }),
            clock,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Simulate the database going away (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_transport(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("in-memory store marked unreachable".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.check_transport()?;
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn insert(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        self.check_transport()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        let record = TaskRecord {
            id,
            task_type: task.task_type,
            payload: task.payload,
            status: TaskStatus::Queued,
            retries: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        state.records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, update: RecordUpdate) -> Result<bool, StoreError> {
        self.check_transport()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&update.id) else {
            return Ok(false);
        };
        update.apply_to(record, now);
        Ok(true)
    }

    async fn update_if_status(
        &self,
        expected: TaskStatus,
        update: RecordUpdate,
    ) -> Result<bool, StoreError> {
        self.check_transport()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.records.get_mut(&update.id) {
            Some(record) if record.status == expected => {
                update.apply_to(record, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim(&self, id: TaskId, retries: u32) -> Result<bool, StoreError> {
        self.check_transport()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        let claimable = match record.status {
            TaskStatus::Queued => record.retries == retries,
            TaskStatus::Processing => record.retries < retries,
            _ => false,
        };
        if claimable {
            RecordUpdate::status(id, TaskStatus::Processing)
                .with_retries(retries)
                .apply_to(record, now);
        }
        Ok(claimable)
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
        self.check_transport()?;
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|record| status.is_none_or(|s| record.status == s))
            .cloned()
            .collect())
    }
}

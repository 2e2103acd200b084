use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::codec::TASKS_TABLE;
use crate::error::{StoreError, TaskError};
use crate::monitor::MonitorInfo;
use crate::sequence::Sequence;
use crate::store::{Expr, Key, KeyValueStore, Update};

/// Lifecycle state of a task.
///
/// `Failed`, `Success` and `Canceled` are terminal and sticky: no
/// transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    WaitingForInterval,
    WaitingForPrerequisite,
    WaitingForLock,
    Failed,
    Success,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Success | Self::Canceled)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Running => write!(f, "Running"),
            Self::WaitingForInterval => write!(f, "WaitingForInterval"),
            Self::WaitingForPrerequisite => write!(f, "WaitingForPrerequisite"),
            Self::WaitingForLock => write!(f, "WaitingForLock"),
            Self::Failed => write!(f, "Failed"),
            Self::Success => write!(f, "Success"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// A durable job.
///
/// The store owns every task; in-memory copies are disposable snapshots.
///
/// # Fields
///
/// - `task_id`: Monotonic 64-bit identifier assigned by the sequence.
/// - `entity_type`: Selects the registered handler.
/// - `entity_id`: Opaque caller identifier, queryable by prefix.
/// - `task_state`: See [`TaskState`].
/// - `lock_ids`: Named mutual-exclusion locks the task runs under.
/// - `prerequisite_task_ids`: Tasks that must reach a terminal state first.
/// - `any_prerequisite`: Wait for ANY prerequisite instead of ALL.
/// - `monitor_id`: A live monitor id, the queued sentinel `#`, the waiting sentinel `$`, or absent when terminal.
/// - `update_data`: Caller-to-handler bytes injected by `update_task`.
/// - `checkpoint_data`: Handler-to-store bytes committed for resume.
/// - `run_count`: Incremented on every claim.
/// - `requeues`: Wakeup fence; bumped whenever a release races this task's own finalizer.
/// - `milliseconds_remaining`: When set, the task is a sleep timer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub task_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub task_state: TaskState,
    pub lock_ids: BTreeSet<String>,
    pub prerequisite_task_ids: BTreeSet<i64>,
    pub any_prerequisite: bool,
    pub monitor_id: Option<String>,
    pub update_data: Option<Vec<u8>>,
    pub checkpoint_data: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    pub error_id: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub run_count: i64,
    pub requeues: Option<i64>,
    pub milliseconds_remaining: Option<i64>,
    pub canceled_by: Option<String>,
}

/// Builds a [`TaskData`] and assigns its id from the sequence.
pub struct TaskBuilder {
    sequence: Sequence,
    task: TaskData,
}

impl TaskBuilder {
    pub(crate) fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            task: TaskData::default(),
        }
    }

    pub fn entity_type(mut self, entity_type: &str) -> Self {
        self.task.entity_type = entity_type.to_string();
        self
    }

    pub fn entity_id(mut self, entity_id: &str) -> Self {
        self.task.entity_id = entity_id.to_string();
        self
    }

    pub fn lock_ids(mut self, lock_ids: BTreeSet<String>) -> Self {
        self.task.lock_ids = lock_ids;
        self
    }

    pub fn prerequisite_task_ids(mut self, prerequisite_task_ids: BTreeSet<i64>) -> Self {
        self.task.prerequisite_task_ids = prerequisite_task_ids;
        self
    }

    pub fn any_prerequisite(mut self, any_prerequisite: bool) -> Self {
        self.task.any_prerequisite = any_prerequisite;
        self
    }

    pub fn milliseconds_remaining(mut self, milliseconds_remaining: i64) -> Self {
        self.task.milliseconds_remaining = Some(milliseconds_remaining);
        self
    }

    pub fn update_data(mut self, update_data: Vec<u8>) -> Self {
        self.task.update_data = Some(update_data);
        self
    }

    pub fn checkpoint_data(mut self, checkpoint_data: Vec<u8>) -> Self {
        self.task.checkpoint_data = Some(checkpoint_data);
        self
    }

    /// Assigns the task id and returns the task, ready for `add_task`.
    pub async fn build(mut self) -> Result<TaskData, TaskError> {
        self.task.task_id = self.sequence.next(TASKS_TABLE).await?;
        Ok(self.task)
    }
}

/// Execution context handed to a task handler.
pub struct TaskContext {
    task: TaskData,
    monitor_info: MonitorInfo,
    store: Arc<dyn KeyValueStore>,
}

impl TaskContext {
    pub(crate) fn new(
        task: TaskData,
        monitor_info: MonitorInfo,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            task,
            monitor_info,
            store,
        }
    }

    pub fn task_info(&self) -> &TaskData {
        &self.task
    }

    pub fn monitor_info(&self) -> &MonitorInfo {
        &self.monitor_info
    }

    pub fn update_data(&self) -> Option<&[u8]> {
        self.task.update_data.as_deref()
    }

    /// Commits checkpoint bytes, guarded by this run still owning the task.
    ///
    /// A failed guard means the task was recovered by a peer: the current
    /// monitor's heartbeat is failed so every lock it holds is released by
    /// the recovery path, and `LostLock` is returned.
    pub async fn commit_checkpoint_data(&self, checkpoint_data: Vec<u8>) -> Result<(), TaskError> {
        let result = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(self.task.task_id),
                Update::new().set("st8", checkpoint_data),
                Some(Expr::eq("mid", self.monitor_info.monitor_id())),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(StoreError::PreconditionFailed(_)) => {
                self.monitor_info.force_heartbeat_failure();
                Err(TaskError::LostLock(format!(
                    "task_id={}",
                    self.task.task_id
                )))
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// A trait for handling tasks.
///
/// Implement this trait for structs that execute one entity type. The
/// handler may return a replacement [`TaskData`] to reconfigure the task
/// (new locks, prerequisites or a sleep interval re-queue it); returning
/// `Ok(None)` finalizes the task as-is. Handlers must be idempotent: a
/// task can run more than once when a worker dies mid-run.
///
/// # Returns
/// Returns `Ok` on success. On failure, returns `Err(String)` with an
/// error message; the task is persisted as FAILED with a fresh error id.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Option<TaskData>, String>;
}

/// A factory function type for creating `TaskHandler` instances.
pub type TaskHandlerFactory = fn() -> Box<dyn TaskHandler>;

/// A registry for managing task handlers, keyed by entity type.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    items: HashMap<String, TaskHandlerFactory>,
}

impl TaskRegistry {
    pub async fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Registers a task handler factory for an entity type.
    ///
    /// # Returns
    /// Returns `true` if the registration was successful.
    pub async fn register(&mut self, key: String, f: TaskHandlerFactory) -> bool {
        self.items.insert(key, f);
        true
    }

    /// Retrieves a task handler factory from the registry.
    pub async fn get(&self, key: &str) -> Result<TaskHandlerFactory, String> {
        match self.items.get(key) {
            Some(item) => Ok(*item),
            None => Err(format!("{} not found in the task registry.", key)),
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }
}

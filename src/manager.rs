use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, Level};

use crate::codec::{
    decode_task, encode_task, state_to_letter, task_table_schema, lock_table_schema,
    sequence_table_schema, MONITOR_ID_QUEUED, MONITOR_ID_WAITING, TASKS_TABLE,
};
use crate::config::TaskQueueConfig;
use crate::error::{StoreError, TaskError};
use crate::lock::Locks;
use crate::monitor::Monitor;
use crate::sequence::Sequence;
use crate::store::{AttrValue, Expr, Key, KeyValueStore, PageIterator, Update};
use crate::task::{TaskBuilder, TaskData, TaskRegistry, TaskState};
use crate::worker::{DelayedTask, Pacing, TaskQueueSet};

/// Subscriber invoked with every task that reaches a terminal state.
pub type TerminalStateHandler = Arc<dyn Fn(&TaskData) + Send + Sync>;

/// Optional filter restricting which queued tasks this node dispatches.
pub type TaskPredicate = Arc<dyn Fn(&TaskData) -> bool + Send + Sync>;

/// The task queue manager: the single entry point callers embed.
///
/// Constructed once with injected collaborators (store façade, monitor
/// capability, handler registry, configuration); everything mutable that
/// the dispatcher, runner and sweepers share lives here. Cross-process
/// coordination goes exclusively through conditional store writes, so any
/// number of peer managers of the same design can run against one store.
pub struct TaskManager {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) monitor: Arc<dyn Monitor>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) sequence: Sequence,
    pub(crate) locks: Locks,
    pub(crate) config: TaskQueueConfig,

    // Dispatcher state (see worker.rs):
    pub(crate) task_queue: StdMutex<TaskQueueSet>,
    pub(crate) capacity: Arc<Semaphore>,
    pub(crate) max_capacity: usize,
    pub(crate) pacing: StdMutex<Pacing>,
    pub(crate) delayed_tasks: Mutex<HashMap<i64, DelayedTask>>,
    pub(crate) spawned: StdMutex<Vec<JoinHandle<()>>>,
    pub(crate) running: AtomicBool,
    pub(crate) disabled: AtomicBool,
    pub(crate) sweeper: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) poll_count: AtomicU32,

    task_matches: StdMutex<TaskPredicate>,
    subscribers: StdMutex<Vec<(u64, TerminalStateHandler)>>,
    next_subscriber_id: AtomicU64,
}

impl TaskManager {
    /// Wires a manager to its collaborators and ensures the store tables
    /// exist. Dispatch does not start until [`TaskManager::monitor_task_queue`].
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        monitor: Arc<dyn Monitor>,
        registry: Arc<TaskRegistry>,
        config: TaskQueueConfig,
    ) -> Result<Arc<Self>, TaskError> {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_line_number(true)
            .try_init();
        store.ensure_table(&task_table_schema()).await?;
        store.ensure_table(&lock_table_schema()).await?;
        store.ensure_table(&sequence_table_schema()).await?;
        let max_capacity = config.max_capacity();
        let cleanup_phase = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..config.cleanup_intervals.max(2) - 1)
        };
        Ok(Arc::new(Self {
            sequence: Sequence::new(store.clone()),
            locks: Locks::new(store.clone(), config.max_backoff_ms),
            task_queue: StdMutex::new(TaskQueueSet::new()),
            capacity: Arc::new(Semaphore::new(max_capacity)),
            max_capacity,
            pacing: StdMutex::new(Pacing::new()),
            delayed_tasks: Mutex::new(HashMap::new()),
            spawned: StdMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            sweeper: StdMutex::new(None),
            poll_count: AtomicU32::new(cleanup_phase),
            task_matches: StdMutex::new(Arc::new(|_| true)),
            subscribers: StdMutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            store,
            monitor,
            registry,
            config,
        }))
    }

    /// Starts a builder; `build()` assigns the task id from the sequence.
    pub fn create_task(&self) -> TaskBuilder {
        TaskBuilder::new(self.sequence.clone())
    }

    /// Validates, persists and dispatches a task built by [`Self::create_task`].
    pub async fn add_task(self: &Arc<Self>, mut task: TaskData) -> Result<TaskData, TaskError> {
        if task.entity_type.is_empty() {
            return Err(TaskError::InvalidArgument(
                "missing task.entity_type".to_string(),
            ));
        }
        if task.entity_id.is_empty() {
            return Err(TaskError::InvalidArgument(
                "missing task.entity_id".to_string(),
            ));
        }
        if task.task_id == 0 {
            return Err(TaskError::InvalidArgument(
                "missing task.task_id; build tasks via create_task()".to_string(),
            ));
        }
        if !self.registry.contains(&task.entity_type).await {
            return Err(TaskError::InvalidArgument(format!(
                "missing task handler for task.entity_type={}",
                task.entity_type
            )));
        }
        task.task_state = if task.milliseconds_remaining.is_none() {
            TaskState::Queued
        } else {
            TaskState::WaitingForInterval
        };
        task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
        // Reset the run-time fields, just in case:
        task.start_time = None;
        task.end_time = None;
        task.error_message = None;
        task.error_id = None;
        task.error_stack_trace = None;
        task.run_count = 0;
        task.requeues = None;
        task.canceled_by = None;
        self.store.put(TASKS_TABLE, encode_task(&task)).await?;
        // Dispatch:
        self.submit_run_task(task.task_id);
        self.submit_run_next();
        Ok(task)
    }

    /// Deletes a task unless a live monitor currently owns it.
    pub async fn delete_task(&self, task_id: i64) -> Result<(), TaskError> {
        let result = self
            .store
            .conditional_delete(
                TASKS_TABLE,
                &Key::hash(task_id),
                Some(Expr::or(
                    Expr::not(Expr::exists("id")),
                    Expr::or(
                        Expr::not(Expr::exists("mid")),
                        Expr::is_in(
                            "mid",
                            vec![
                                AttrValue::from(MONITOR_ID_QUEUED),
                                AttrValue::from(MONITOR_ID_WAITING),
                            ],
                        ),
                    ),
                )),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::PreconditionFailed(_)) => Err(TaskError::TaskLocked(task_id)),
            Err(error) => Err(error.into()),
        }
    }

    /// Marks a task as "to be canceled"; the state machine honors the flag
    /// at its next claim. Canceling a terminal task is silently ignored.
    pub async fn cancel_task(self: &Arc<Self>, canceled_by: &str, task_id: i64) -> Result<(), TaskError> {
        if canceled_by.is_empty() {
            return Err(TaskError::InvalidArgument(
                "canceled_by may not be empty".to_string(),
            ));
        }
        let marked = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(task_id),
                Update::new().set("cancel", canceled_by),
                Some(Expr::exists("mid")),
            )
            .await;
        match marked {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed(_)) => {
                debug!(
                    "attempt to cancel task_id={} that is in a final state, ignoring",
                    task_id
                );
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }
        self.requeue_if_waiting(task_id).await
    }

    /// Injects caller bytes for the handler's next run; a waiting task is
    /// re-queued so the update is processed promptly.
    pub async fn update_task(self: &Arc<Self>, update_data: Vec<u8>, task_id: i64) -> Result<(), TaskError> {
        let updated = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(task_id),
                Update::new().set("upd", update_data),
                Some(Expr::exists("mid")),
            )
            .await;
        match updated {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed(_)) => {
                debug!(
                    "attempt to set update_data on task_id={} that is in a final state, ignoring",
                    task_id
                );
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }
        self.requeue_if_waiting(task_id).await
    }

    /// Flips a waiting task back to the queued sentinel and dispatches it.
    async fn requeue_if_waiting(self: &Arc<Self>, task_id: i64) -> Result<(), TaskError> {
        let flipped = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(task_id),
                Update::new()
                    .set("mid", MONITOR_ID_QUEUED)
                    .set("stat", state_to_letter(TaskState::Queued)),
                Some(Expr::begins_with("mid", MONITOR_ID_WAITING)),
            )
            .await;
        match flipped {
            Ok(_) => {
                // We moved the task out of waiting, so let's execute it:
                self.submit_run_task(task_id);
                self.submit_run_next();
                Ok(())
            }
            Err(StoreError::PreconditionFailed(_)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskData>, TaskError> {
        let row = self.store.get(TASKS_TABLE, &Key::hash(task_id)).await?;
        match row {
            Some(row) => Ok(Some(decode_task(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_tasks_by_entity_type(
        &self,
        entity_type: &str,
        iter: &mut PageIterator,
    ) -> Result<Vec<TaskData>, TaskError> {
        self.query_tasks("ety-eid-index", entity_type, None, iter)
            .await
    }

    pub async fn get_tasks_by_entity_id_begins_with(
        &self,
        entity_type: &str,
        entity_id_begins_with: &str,
        iter: &mut PageIterator,
    ) -> Result<Vec<TaskData>, TaskError> {
        let prefix = if entity_id_begins_with.is_empty() {
            None
        } else {
            Some(entity_id_begins_with)
        };
        self.query_tasks("ety-eid-index", entity_type, prefix, iter)
            .await
    }

    pub async fn get_non_terminal_tasks_by_entity_id_begins_with(
        &self,
        entity_type: &str,
        entity_id_begins_with: &str,
        iter: &mut PageIterator,
    ) -> Result<Vec<TaskData>, TaskError> {
        let prefix = if entity_id_begins_with.is_empty() {
            None
        } else {
            Some(entity_id_begins_with)
        };
        self.query_tasks("ntty-ntid-index", entity_type, prefix, iter)
            .await
    }

    /// Every task currently carrying a monitor id, across all states.
    pub async fn get_non_terminal_tasks(
        &self,
        iter: &mut PageIterator,
    ) -> Result<Vec<TaskData>, TaskError> {
        let rows = self
            .store
            .scan_index(TASKS_TABLE, Some("mid-id-index"), iter)
            .await?;
        rows.iter()
            .map(|row| decode_task(row).map_err(TaskError::from))
            .collect()
    }

    pub async fn get_all_tasks(&self, iter: &mut PageIterator) -> Result<Vec<TaskData>, TaskError> {
        let rows = self.store.scan_index(TASKS_TABLE, None, iter).await?;
        rows.iter()
            .map(|row| decode_task(row).map_err(TaskError::from))
            .collect()
    }

    async fn query_tasks(
        &self,
        index: &str,
        entity_type: &str,
        begins_with: Option<&str>,
        iter: &mut PageIterator,
    ) -> Result<Vec<TaskData>, TaskError> {
        let rows = self
            .store
            .query_index(
                TASKS_TABLE,
                Some(index),
                AttrValue::from(entity_type),
                begins_with,
                iter,
            )
            .await?;
        rows.iter()
            .map(|row| decode_task(row).map_err(TaskError::from))
            .collect()
    }

    /// Registers a terminal-state subscriber; returns a token for
    /// [`Self::remove_on_terminal_state`].
    pub fn add_on_terminal_state(&self, handler: TerminalStateHandler) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push((id, handler));
        id
    }

    pub fn remove_on_terminal_state(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
        subscribers.len() != before
    }

    pub(crate) fn on_terminal_state(&self, task: &TaskData) {
        let subscribers: Vec<TerminalStateHandler> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in subscribers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(task);
            }));
            if result.is_err() {
                error!(
                    "terminal-state subscriber failed for task_id={}",
                    task.task_id
                );
            }
        }
    }

    pub(crate) fn task_matches(&self, task: &TaskData) -> bool {
        let predicate = self.task_matches.lock().unwrap().clone();
        predicate(task)
    }

    /// Starts the dispatcher and background sweepers.
    pub fn monitor_task_queue(self: &Arc<Self>) {
        self.monitor_task_queue_for(None);
    }

    /// Starts the dispatcher and background sweepers, dispatching only
    /// queued tasks matching the predicate.
    pub fn monitor_task_queue_for(self: &Arc<Self>, task_matches: Option<TaskPredicate>) {
        {
            let mut predicate = self.task_matches.lock().unwrap();
            *predicate = task_matches.unwrap_or_else(|| Arc::new(|_| true));
        }
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        *sweeper = Some(self.spawn_sweeper());
    }

    /// Cancels all outstanding work, drains the delayed-task table, and
    /// blocks until the worker capacity is fully released, force-canceling
    /// on successive timeouts of 60, 30, 15, ... seconds.
    pub async fn stop_task_queue_monitor(self: &Arc<Self>, force_interrupt: bool) {
        let Some(sweeper) = self.sweeper.lock().unwrap().take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        sweeper.abort();

        let delayed: Vec<i64> = {
            let map = self.delayed_tasks.lock().await;
            map.keys().copied().collect()
        };
        for task_id in delayed {
            self.update_delayed_task(task_id, None).await;
        }

        if force_interrupt {
            for handle in self.spawned.lock().unwrap().iter() {
                handle.abort();
            }
        }

        // Ensure cancellation eventually occurs:
        let mut seconds: u64 = 60;
        loop {
            let acquired = tokio::time::timeout(
                Duration::from_secs(seconds),
                self.capacity.acquire_many(self.max_capacity as u32),
            )
            .await;
            match acquired {
                Ok(Ok(permits)) => {
                    drop(permits);
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    for handle in self.spawned.lock().unwrap().iter() {
                        // Force!
                        handle.abort();
                    }
                    seconds /= 2;
                    if seconds == 0 {
                        error!("failed to cancel task worker threads");
                        return;
                    }
                }
            }
        }
        self.spawned.lock().unwrap().clear();
    }
}

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, instrument};

use crate::codec::{
    decode_lock, decode_task, letter_to_state, state_to_letter, LOCKS_TABLE, MONITOR_ID_QUEUED,
    MONITOR_ID_WAITING, TASKS_TABLE, TASK_ID_NONE,
};
use crate::error::{StoreError, TaskError};
use crate::manager::TaskManager;
use crate::monitor::MonitorInfo;
use crate::store::{AttrValue, Expr, Key, PageIterator, Update};
use crate::task::TaskState;

impl TaskManager {
    /// Spawns the periodic sweep loop: one queued-task scan per poll
    /// interval, plus the deep-cleanup pass every `cleanup_intervals`
    /// ticks. Starts at a random phase so peer nodes do not stampede.
    pub(crate) fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let initial_delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..manager.config.poll_interval_ms.max(1))
            };
            tokio::time::sleep(Duration::from_millis(initial_delay)).await;
            loop {
                manager.start_runnable_tasks().await;
                tokio::time::sleep(Duration::from_millis(manager.config.poll_interval_ms)).await;
            }
        })
    }

    /// Pages every task carrying the queued sentinel and enqueues the ones
    /// matching this node's predicate. Catches missed wakeups.
    #[instrument(skip_all)]
    pub(crate) async fn start_runnable_tasks(self: &Arc<Self>) {
        let mut task_submitted = false;
        let mut iter = PageIterator::new().page_size(100);
        while iter.has_next() {
            let rows = self
                .store
                .query_index(
                    TASKS_TABLE,
                    Some("mid-id-index"),
                    AttrValue::from(MONITOR_ID_QUEUED),
                    None,
                    &mut iter,
                )
                .await;
            let rows = match rows {
                Ok(rows) => rows,
                Err(error) => {
                    error!("queued-task scan: {}", error);
                    break;
                }
            };
            for row in rows {
                match decode_task(&row) {
                    Ok(task) => {
                        if !self.task_matches(&task) {
                            continue;
                        }
                        self.submit_run_task(task.task_id);
                        task_submitted = true;
                    }
                    Err(error) => error!("queued-task scan: {}", error),
                }
            }
        }
        if task_submitted {
            self.submit_run_next();
        }

        let tick = self.poll_count.fetch_add(1, Ordering::SeqCst) + 1;
        if tick % self.config.cleanup_intervals.max(1) == 1 {
            match self.monitor.begin().await {
                Ok(session) => {
                    if let Err(error) = self.deep_cleanup(session.info()).await {
                        error!("deep cleanup: {}", error);
                    }
                }
                Err(error) => {
                    debug!("skipping deep cleanup: {}", error);
                }
            }
        }
    }

    /// The deep-cleanup pass: break locks abandoned by dead tasks, then
    /// rescue waiters whose wakeup was lost. Idempotent; every conditional
    /// write may harmlessly lose its race.
    pub(crate) async fn deep_cleanup(&self, _monitor_info: &MonitorInfo) -> Result<(), TaskError> {
        let mut locked_ids: HashMap<String, bool> = HashMap::new();
        let mut task_in_terminal_state: HashMap<i64, bool> = HashMap::new();

        // Classify every held lock as still-valid or abandoned; abandoned
        // held locks are deleted, which also breaks any stranded
        // prerequisite barrier so its waiters can be rescued below.
        let mut iter = PageIterator::new().page_size(100);
        while iter.has_next() {
            let rows = self
                .store
                .scan_index(LOCKS_TABLE, Some("mid-index"), &mut iter)
                .await?;
            for row in rows {
                let lock = decode_lock(&row)?;
                let Some(running_task_id) = lock.running_task_id else {
                    continue;
                };
                if lock.task_id != TASK_ID_NONE {
                    continue;
                }
                let Some(owner) = lock.monitor_id.clone() else {
                    continue;
                };
                let is_terminal = match task_in_terminal_state.get(&running_task_id) {
                    Some(is_terminal) => *is_terminal,
                    None => {
                        let is_terminal = self.is_terminal_task_id(running_task_id).await?;
                        task_in_terminal_state.insert(running_task_id, is_terminal);
                        is_terminal
                    }
                };
                if !is_terminal {
                    locked_ids.insert(lock.lock_id.clone(), true);
                    continue;
                }
                let fence = match lock.tasks_queued {
                    Some(tasks_queued) => Expr::eq("agn", tasks_queued),
                    None => Expr::not(Expr::exists("agn")),
                };
                let deleted = self
                    .store
                    .conditional_delete(
                        LOCKS_TABLE,
                        &Key::with_range(lock.lock_id.clone(), TASK_ID_NONE),
                        Some(Expr::and(
                            Expr::eq("mid", owner),
                            Expr::and(Expr::eq("rtid", running_task_id), fence),
                        )),
                    )
                    .await;
                match deleted {
                    Ok(()) => {
                        locked_ids.insert(lock.lock_id.clone(), false);
                        error!(
                            "found lock_id={} was NOT removed, even though task_id={} is in a terminal state",
                            lock.lock_id, running_task_id
                        );
                    }
                    Err(StoreError::PreconditionFailed(_)) => {
                        locked_ids.insert(lock.lock_id.clone(), true);
                        debug!("found lock_id={} was already updated", lock.lock_id);
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }

        // Find waiting tasks whose prerequisite condition is satisfied and
        // whose locks are all free; release should have woken them.
        let mut iter = PageIterator::new().page_size(100);
        while iter.has_next() {
            let rows = self
                .store
                .query_index(
                    TASKS_TABLE,
                    Some("mid-id-index"),
                    AttrValue::from(MONITOR_ID_WAITING),
                    None,
                    &mut iter,
                )
                .await?;
            for row in rows {
                let task = decode_task(&row)?;
                let mut unblock = !task.any_prerequisite;
                for prerequisite_id in &task.prerequisite_task_ids {
                    let is_terminal = match task_in_terminal_state.get(prerequisite_id) {
                        Some(is_terminal) => *is_terminal,
                        None => {
                            let is_terminal = self.is_terminal_task_id(*prerequisite_id).await?;
                            task_in_terminal_state.insert(*prerequisite_id, is_terminal);
                            is_terminal
                        }
                    };
                    if task.any_prerequisite {
                        if is_terminal {
                            unblock = true;
                            break;
                        }
                    } else if !is_terminal {
                        unblock = false;
                        break;
                    }
                }
                // Still waiting for prerequisites:
                if !unblock {
                    continue;
                }
                // Check the locks are free:
                for lock_id in &task.lock_ids {
                    let is_locked = match locked_ids.get(lock_id) {
                        Some(is_locked) => *is_locked,
                        None => {
                            let is_locked = self.is_locked(lock_id).await?;
                            locked_ids.insert(lock_id.clone(), is_locked);
                            is_locked
                        }
                    };
                    if is_locked {
                        unblock = false;
                        break;
                    }
                }
                // Still waiting to obtain a lock:
                if !unblock {
                    continue;
                }
                let flipped = self
                    .store
                    .conditional_update(
                        TASKS_TABLE,
                        &Key::hash(task.task_id),
                        Update::new().set("mid", MONITOR_ID_QUEUED),
                        Some(Expr::eq("mid", MONITOR_ID_WAITING)),
                    )
                    .await;
                match flipped {
                    Ok(_) => {
                        error!(
                            "found task_id={} was NOT enqueued, even though all prerequisite tasks ({:?}) are satisfied and all locks ({:?}) are available",
                            task.task_id, task.prerequisite_task_ids, task.lock_ids
                        );
                    }
                    Err(StoreError::PreconditionFailed(_)) => {
                        debug!("found task_id={} was already enqueued", task.task_id);
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(())
    }

    async fn is_terminal_task_id(&self, task_id: i64) -> Result<bool, TaskError> {
        let row = self.store.get(TASKS_TABLE, &Key::hash(task_id)).await?;
        let Some(row) = row else {
            // A deleted task counts as failed, which is terminal.
            return Ok(true);
        };
        let state = row
            .get("stat")
            .and_then(AttrValue::as_str)
            .and_then(letter_to_state)
            .unwrap_or(TaskState::Failed);
        Ok(state.is_terminal())
    }

    async fn is_locked(&self, lock_id: &str) -> Result<bool, TaskError> {
        let row = self
            .store
            .get(LOCKS_TABLE, &Key::with_range(lock_id, TASK_ID_NONE))
            .await?;
        Ok(row.is_some())
    }

    /// Monitor-death recovery, driven externally: when the heartbeat
    /// registry reports a dead monitor, this releases every lock it held
    /// (waking waiters) and flips every task it owned back to QUEUED.
    #[instrument(skip_all)]
    pub async fn release_locks_for_monitor_id(
        self: &Arc<Self>,
        monitor_id: &str,
    ) -> Result<(), TaskError> {
        debug!("releasing locks for monitor_id={}", monitor_id);
        let mut tasks_to_run: Vec<i64> = Vec::new();
        // Release locks on the locks table. Deleting a held lock removes
        // it from the monitor index we are paging, so drain the first
        // page until nothing unprocessed remains.
        let mut processed: HashSet<String> = HashSet::new();
        loop {
            let mut iter = PageIterator::new().page_size(100);
            let rows = self
                .store
                .query_index(
                    LOCKS_TABLE,
                    Some("mid-index"),
                    AttrValue::from(monitor_id),
                    None,
                    &mut iter,
                )
                .await?;
            let mut progressed = false;
            for row in rows {
                let lock = decode_lock(&row)?;
                if !processed.insert(lock.lock_id.clone()) {
                    continue;
                }
                progressed = true;
                // Mark the next task as runnable:
                if let Err(error) = self
                    .locks
                    .unblock_waiting_tasks(&lock.lock_id, monitor_id, &mut tasks_to_run, false)
                    .await
                {
                    debug!(
                        "lost lock: release_lock={} for monitor_id={}: {}",
                        lock.lock_id, monitor_id, error
                    );
                }
                // Remove the lock:
                let deleted = self
                    .store
                    .conditional_delete(
                        LOCKS_TABLE,
                        &Key::with_range(lock.lock_id.clone(), TASK_ID_NONE),
                        Some(Expr::eq("mid", monitor_id)),
                    )
                    .await;
                match deleted {
                    Ok(()) => {}
                    Err(StoreError::PreconditionFailed(_)) => {
                        debug!(
                            "lost lock: release_lock={} for monitor_id={} task_id={:?}",
                            lock.lock_id, monitor_id, lock.running_task_id
                        );
                    }
                    Err(error) => return Err(error.into()),
                }
                // Do not dispatch the woken waiters yet: the task scan
                // below must resume whatever WAS running first.
                tasks_to_run.clear();
            }
            if !progressed {
                break;
            }
        }

        // Put the dead monitor's tasks back into a runnable state:
        let mut task_submitted = false;
        let mut processed_tasks: HashSet<i64> = HashSet::new();
        loop {
            let mut iter = PageIterator::new().page_size(100);
            let rows = self
                .store
                .query_index(
                    TASKS_TABLE,
                    Some("mid-id-index"),
                    AttrValue::from(monitor_id),
                    None,
                    &mut iter,
                )
                .await?;
            let mut progressed = false;
            for row in rows {
                let task = decode_task(&row)?;
                if !processed_tasks.insert(task.task_id) {
                    continue;
                }
                progressed = true;
                let flipped = self
                    .store
                    .conditional_update(
                        TASKS_TABLE,
                        &Key::hash(task.task_id),
                        Update::new()
                            .set("mid", MONITOR_ID_QUEUED)
                            .set("stat", state_to_letter(TaskState::Queued)),
                        Some(Expr::eq("mid", monitor_id)),
                    )
                    .await;
                match flipped {
                    Ok(_) => {}
                    Err(StoreError::PreconditionFailed(_)) => {
                        debug!(
                            "lost lock: release_locks_for_monitor_id={} task_id={}",
                            monitor_id, task.task_id
                        );
                        continue;
                    }
                    Err(error) => return Err(error.into()),
                }
                self.submit_run_task(task.task_id);
                task_submitted = true;
            }
            if !progressed {
                break;
            }
        }
        if task_submitted {
            self.submit_run_next();
        }
        Ok(())
    }
}

use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error};

use crate::codec::{
    decode_lock, letter_to_state, sort_key, sort_key_to_i64, state_to_letter, LOCKS_TABLE,
    MONITOR_ID_QUEUED, MONITOR_ID_WAITING, TASKS_TABLE, TASK_ID_NONE,
};
use crate::error::{StoreError, TaskError};
use crate::store::{AttrValue, Expr, Key, KeyValueStore, PageIterator, Row, Update};
use crate::task::{TaskData, TaskState};

/// One row of the polymorphic lock table: a held lock when
/// `task_id == TASK_ID_NONE`, otherwise a waiter entry.
#[derive(Debug, Clone)]
pub struct LockData {
    pub lock_id: String,
    pub task_id: String,
    pub running_task_id: Option<i64>,
    pub monitor_id: Option<String>,
    pub tasks_queued: Option<i64>,
}

/// The reserved lock id that doubles as task `task_id`'s prerequisite
/// barrier: held while the task runs, its waiters are the tasks blocked on
/// it reaching a terminal state.
pub fn prereq_barrier(task_id: i64) -> String {
    format!("_TASK:{}", sort_key(task_id))
}

fn held_key(lock_id: &str) -> Key {
    Key::with_range(lock_id, TASK_ID_NONE)
}

fn waiter_key(lock_id: &str, task_id: i64) -> Key {
    Key::with_range(lock_id, sort_key(task_id))
}

fn waiter_row(lock_id: &str, task_id: i64) -> Row {
    let mut row = Row::new();
    row.insert("lid".to_string(), AttrValue::Str(lock_id.to_string()));
    row.insert("tid".to_string(), AttrValue::Str(sort_key(task_id)));
    row
}

/// Distributed lock and prerequisite coordinator.
///
/// All coordination happens through conditional writes on the lock table;
/// the `agn` counter on a held lock is the fence that makes a waiter
/// enqueue and the holder's release observe each other.
#[derive(Clone)]
pub struct Locks {
    store: Arc<dyn KeyValueStore>,
    max_backoff_ms: u64,
}

impl Locks {
    pub fn new(store: Arc<dyn KeyValueStore>, max_backoff_ms: u64) -> Self {
        Self {
            store,
            max_backoff_ms,
        }
    }

    async fn backoff(&self) {
        let millis = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..self.max_backoff_ms.max(1))
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    async fn task_state_of(&self, task_id: i64) -> Result<TaskState, StoreError> {
        let row = self.store.get(TASKS_TABLE, &Key::hash(task_id)).await?;
        let Some(row) = row else {
            // A deleted prerequisite counts as failed, which is terminal.
            return Ok(TaskState::Failed);
        };
        match row.get("stat").and_then(AttrValue::as_str).and_then(letter_to_state) {
            Some(state) => Ok(state),
            None => {
                error!("unexpected missing task state for task_id={}", task_id);
                Ok(TaskState::Failed)
            }
        }
    }

    /// Checks the task's prerequisites, enqueueing waiter entries on the
    /// barriers of unfinished ones.
    ///
    /// Returns `false` (and sets WAITING_FOR_PREREQUISITE) when the task
    /// must wait. With `any_prerequisite` the first terminal prerequisite
    /// unblocks; otherwise the first non-terminal one blocks.
    pub async fn check_prerequisites(&self, task: &mut TaskData) -> Result<bool, TaskError> {
        let mut any_complete = false;
        let mut incomplete: Option<Vec<i64>> = if task.any_prerequisite {
            Some(Vec::new())
        } else {
            None
        };
        for prerequisite_id in task.prerequisite_task_ids.clone() {
            let lock_id = prereq_barrier(prerequisite_id);
            if any_complete {
                // Avoid cruft buildup:
                self.store
                    .conditional_delete(LOCKS_TABLE, &waiter_key(&lock_id, task.task_id), None)
                    .await?;
                continue;
            }
            let state = self.task_state_of(prerequisite_id).await?;
            if state.is_terminal() {
                self.store
                    .conditional_delete(LOCKS_TABLE, &waiter_key(&lock_id, task.task_id), None)
                    .await?;
                if incomplete.is_some() {
                    any_complete = true;
                }
                continue;
            }
            // Enqueue:
            self.store
                .put(LOCKS_TABLE, waiter_row(&lock_id, task.task_id))
                .await?;
            debug!(
                "enqueue prerequisite={} for task_id={}",
                prerequisite_id, task.task_id
            );
            // Force the holder's release to see our entry:
            let published = self
                .store
                .conditional_update(
                    LOCKS_TABLE,
                    &held_key(&lock_id),
                    Update::new().increment("agn", 1),
                    Some(Expr::exists("mid")),
                )
                .await;
            match published {
                Ok(_) => {}
                Err(StoreError::PreconditionFailed(_)) => {
                    debug!(
                        "unable to increment agn field of lock_id={}, checking if task is now terminal",
                        lock_id
                    );
                    let state = self.task_state_of(prerequisite_id).await?;
                    if state.is_terminal() {
                        // The prerequisite completed and removed its barrier:
                        self.store
                            .conditional_delete(
                                LOCKS_TABLE,
                                &waiter_key(&lock_id, task.task_id),
                                None,
                            )
                            .await?;
                        if incomplete.is_some() {
                            any_complete = true;
                        }
                        continue;
                    }
                    // The prerequisite is not running; our waiter entry is
                    // already published, so we are good.
                }
                Err(error) => return Err(error.into()),
            }
            match incomplete.as_mut() {
                Some(list) => list.push(prerequisite_id),
                None => {
                    debug!(
                        "waiting on prerequisite_task_id={} for task_id={}",
                        prerequisite_id, task.task_id
                    );
                    task.task_state = TaskState::WaitingForPrerequisite;
                    return Ok(false);
                }
            }
        }
        if let Some(list) = incomplete {
            if !any_complete {
                debug!(
                    "waiting on one of the prerequisite_task_ids={:?} for task_id={}",
                    list, task.task_id
                );
                task.task_state = TaskState::WaitingForPrerequisite;
                return Ok(false);
            }
            // Avoid cruft buildup:
            for prerequisite_id in list {
                let lock_id = prereq_barrier(prerequisite_id);
                self.store
                    .conditional_delete(LOCKS_TABLE, &waiter_key(&lock_id, task.task_id), None)
                    .await?;
            }
        }
        Ok(true)
    }

    /// Acquires the task's named locks plus its own prerequisite barrier,
    /// in ascending lock-id order to preclude deadlock.
    ///
    /// Returns `false` (and sets WAITING_FOR_LOCK) when some lock is held
    /// elsewhere; locks already acquired stay in `locks_acquired` and must
    /// be released by the caller's unwind.
    pub async fn acquire(
        &self,
        task: &mut TaskData,
        locks_acquired: &mut Vec<String>,
        monitor_id: &str,
    ) -> Result<bool, TaskError> {
        let mut lock_ids: Vec<String> = task.lock_ids.iter().cloned().collect();
        lock_ids.push(prereq_barrier(task.task_id));
        lock_ids.sort();
        'next_lock: for lock_id in lock_ids {
            let mut retry = 0u32;
            loop {
                // If we retry, do a random sleep:
                if retry > 0 {
                    self.backoff().await;
                }
                retry += 1;

                // Try to acquire the lock; `rtid = taskId` allows
                // re-entrant acquisition by the same task on recovery.
                let acquired = self
                    .store
                    .conditional_update(
                        LOCKS_TABLE,
                        &held_key(&lock_id),
                        Update::new()
                            .set("mid", monitor_id)
                            .set("rtid", task.task_id)
                            .increment("agn", 1),
                        Some(Expr::or(
                            Expr::eq("rtid", task.task_id),
                            Expr::not(Expr::exists("mid")),
                        )),
                    )
                    .await;
                match acquired {
                    Ok(_) => {
                        locks_acquired.push(lock_id.clone());
                        continue 'next_lock;
                    }
                    Err(StoreError::PreconditionFailed(_)) => {
                        debug!(
                            "unable to acquire lock_id={} for task_id={}",
                            lock_id, task.task_id
                        );
                        // Enqueue:
                        self.store
                            .put(LOCKS_TABLE, waiter_row(&lock_id, task.task_id))
                            .await?;
                        // Force the holder's release to see our entry:
                        let published = self
                            .store
                            .conditional_update(
                                LOCKS_TABLE,
                                &held_key(&lock_id),
                                Update::new().increment("agn", 1),
                                Some(Expr::exists("mid")),
                            )
                            .await;
                        match published {
                            Ok(_) => {
                                task.task_state = TaskState::WaitingForLock;
                                return Ok(false);
                            }
                            Err(StoreError::PreconditionFailed(_)) => {
                                // The holder just released; try again.
                                debug!(
                                    "unable to increment agn field of lock_id={}, retrying",
                                    lock_id
                                );
                                continue;
                            }
                            Err(error) => return Err(error.into()),
                        }
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(true)
    }

    /// Releases held locks in reverse acquisition order, waking waiters.
    ///
    /// `is_terminal` selects the barrier behavior: a terminal task wakes
    /// every waiter on its own prerequisite barrier, an ordinary lock
    /// wakes at most one.
    pub async fn release(
        &self,
        locks: &mut Vec<String>,
        task_id: i64,
        monitor_id: &str,
        tasks_to_run: &mut Vec<i64>,
        is_terminal: bool,
    ) -> Result<(), TaskError> {
        let barrier = prereq_barrier(task_id);
        while let Some(lock_id) = locks.pop() {
            // Mark the next task as runnable:
            self.unblock_waiting_tasks(
                &lock_id,
                monitor_id,
                tasks_to_run,
                is_terminal && lock_id == barrier,
            )
            .await?;
            // Remove our own queued mark:
            self.store
                .conditional_delete(LOCKS_TABLE, &waiter_key(&lock_id, task_id), None)
                .await?;
        }
        Ok(())
    }

    /// Wakes waiters of a lock and deletes the held row under the `agn`
    /// fence; a fence mismatch means a waiter enqueued concurrently, so
    /// the whole pass retries.
    pub async fn unblock_waiting_tasks(
        &self,
        lock_id: &str,
        monitor_id: &str,
        tasks_to_run: &mut Vec<i64>,
        process_prereqs: bool,
    ) -> Result<(), TaskError> {
        let mut process_prereqs = process_prereqs;
        if lock_id.starts_with("_TASK:") {
            if !process_prereqs {
                // A non-terminal run still needs to release its barrier:
                let released = self
                    .store
                    .conditional_delete(
                        LOCKS_TABLE,
                        &held_key(lock_id),
                        Some(Expr::eq("mid", monitor_id)),
                    )
                    .await;
                return match released {
                    Ok(()) => {
                        debug!("released lock_id={}", lock_id);
                        Ok(())
                    }
                    Err(StoreError::PreconditionFailed(_)) => {
                        Err(TaskError::LostLock(format!("lock_id={}", lock_id)))
                    }
                    Err(error) => Err(error.into()),
                };
            }
            debug!("unblocking all prerequisites lock_id={}", lock_id);
        } else {
            process_prereqs = false;
        }
        let mut retry = 0u32;
        loop {
            // If we retry, do a random sleep:
            if retry > 0 {
                self.backoff().await;
            }
            retry += 1;

            let mut tasks_queued: Option<i64> = None;
            let mut iter = PageIterator::new().page_size(if process_prereqs { 100 } else { 2 });
            'pages: while iter.has_next() {
                let rows = self
                    .store
                    .query_index(
                        LOCKS_TABLE,
                        None,
                        AttrValue::Str(lock_id.to_string()),
                        None,
                        &mut iter,
                    )
                    .await
                    .map_err(TaskError::from)?;
                'next_waiter: for row in rows {
                    let lock = decode_lock(&row)?;
                    if lock.task_id == TASK_ID_NONE {
                        tasks_queued = lock.tasks_queued;
                        continue;
                    }
                    let Some(waiting_task_id) = sort_key_to_i64(&lock.task_id) else {
                        continue;
                    };
                    let mut first = true;
                    loop {
                        let unblocked = self
                            .store
                            .conditional_update(
                                TASKS_TABLE,
                                &Key::hash(waiting_task_id),
                                Update::new()
                                    .set("mid", MONITOR_ID_QUEUED)
                                    .set("stat", state_to_letter(TaskState::Queued)),
                                Some(Expr::eq("mid", MONITOR_ID_WAITING)),
                            )
                            .await;
                        match unblocked {
                            Ok(_) => {
                                debug!(
                                    "unblocked task_id={} that was waiting for {}",
                                    waiting_task_id, lock_id
                                );
                                tasks_to_run.push(waiting_task_id);
                                break;
                            }
                            Err(StoreError::PreconditionFailed(_)) => {
                                if first {
                                    first = false;
                                    // Fence the waiter's own finalizer: if
                                    // it is about to persist a waiting
                                    // state, the bumped counter fails that
                                    // write and the task requeues itself.
                                    debug!(
                                        "task_id={} was not in a waiting state, incrementing 'agn'",
                                        waiting_task_id
                                    );
                                    self.store
                                        .conditional_update(
                                            TASKS_TABLE,
                                            &Key::hash(waiting_task_id),
                                            Update::new().increment("agn", 1),
                                            None,
                                        )
                                        .await
                                        .map_err(TaskError::from)?;
                                } else {
                                    debug!(
                                        "task_id={} was not in a waiting state",
                                        waiting_task_id
                                    );
                                    continue 'next_waiter;
                                }
                            }
                            Err(error) => return Err(error.into()),
                        }
                    }
                    // Just unblocking a single task:
                    if !process_prereqs {
                        break 'pages;
                    }
                }
            }
            let Some(tasks_queued) = tasks_queued else {
                error!("expected lock_id={} to exist", lock_id);
                return Ok(());
            };
            let released = self
                .store
                .conditional_delete(
                    LOCKS_TABLE,
                    &held_key(lock_id),
                    Some(Expr::and(
                        Expr::eq("mid", monitor_id),
                        Expr::eq("agn", tasks_queued),
                    )),
                )
                .await;
            match released {
                Ok(()) => {
                    debug!("released lock_id={}", lock_id);
                    return Ok(());
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    let lock = self.store.get(LOCKS_TABLE, &held_key(lock_id)).await?;
                    let still_mine = lock
                        .as_ref()
                        .and_then(|row| row.get("mid"))
                        .and_then(AttrValue::as_str)
                        == Some(monitor_id);
                    if !still_mine {
                        return Err(TaskError::LostLock(format!("lock_id={}", lock_id)));
                    }
                    debug!("retrying unblock_waiting_tasks({})", lock_id);
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

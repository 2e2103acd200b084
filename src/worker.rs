use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, instrument};

use crate::codec::{state_to_letter, MONITOR_ID_QUEUED, TASKS_TABLE};
use crate::error::StoreError;
use crate::manager::TaskManager;
use crate::monitor::MonitorInfo;
use crate::store::{Expr, Key, Update};
use crate::task::{TaskData, TaskState};

/// In-process set of candidate task ids: deduplicated, insertion-ordered.
#[derive(Debug, Default)]
pub(crate) struct TaskQueueSet {
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl TaskQueueSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task_id: i64) {
        if self.members.insert(task_id) {
            self.order.push_back(task_id);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<i64> {
        let task_id = self.order.pop_front()?;
        self.members.remove(&task_id);
        Some(task_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Claim pacing: spreads claim attempts out so peers do not slam the
/// store with conditional writes.
#[derive(Debug)]
pub(crate) struct Pacing {
    last_run: Instant,
    schedule_pending: bool,
}

impl Pacing {
    pub(crate) fn new() -> Self {
        Self {
            // Far enough in the past that the first claim runs immediately.
            last_run: Instant::now()
                .checked_sub(Duration::from_secs(3600))
                .unwrap_or_else(Instant::now),
            schedule_pending: false,
        }
    }
}

/// A task in WAITING_FOR_INTERVAL tracked by this node's timer wheel.
#[derive(Debug)]
pub(crate) struct DelayedTask {
    begin: Instant,
    remaining_ms: i64,
}

impl TaskManager {
    /// Adds a candidate task id to the in-process queue.
    pub(crate) fn submit_run_task(&self, task_id: i64) {
        self.task_queue.lock().unwrap().push(task_id);
    }

    /// Spawns a runner to drain the queue, if dispatch is active.
    pub(crate) fn submit_run_next(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_next_task().await;
        });
        self.track(handle);
    }

    fn schedule_run_next(self: &Arc<Self>, delay: Duration) {
        if !self.running.load(Ordering::SeqCst) || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pacing = manager.pacing.lock().unwrap();
                pacing.schedule_pending = false;
            }
            manager.run_next_task().await;
        });
        self.track(handle);
    }

    pub(crate) fn track(&self, handle: tokio::task::JoinHandle<()>) {
        let mut spawned = self.spawned.lock().unwrap();
        spawned.retain(|existing| !existing.is_finished());
        spawned.push(handle);
    }

    /// One runner invocation: acquire capacity, respect pacing, then pop
    /// ids until one is actually dispatchable and attempt to claim it.
    pub(crate) async fn run_next_task(self: Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        // We are at capacity, don't actually run a task:
        let Ok(permit) = self.capacity.clone().try_acquire_owned() else {
            return;
        };

        // Spread out task claims to avoid slamming the store with writes:
        {
            let mut pacing = self.pacing.lock().unwrap();
            let now = Instant::now();
            let gap = Duration::from_millis(self.config.dispatch_gap_ms());
            let next_allowed = pacing.last_run + gap;
            if now < next_allowed {
                if !pacing.schedule_pending {
                    pacing.schedule_pending = true;
                    let remaining = next_allowed - now;
                    drop(pacing);
                    self.schedule_run_next(remaining);
                }
                return;
            }
            pacing.last_run = now;
        }

        // Read tasks from the queue until we find one in a queued state
        // and therefore likely to win the claim:
        let task_id = loop {
            let candidate = {
                let mut queue = self.task_queue.lock().unwrap();
                queue.pop()
            };
            let Some(candidate) = candidate else {
                return;
            };
            match self.get_task(candidate).await {
                Ok(Some(task)) if task.monitor_id.as_deref() == Some(MONITOR_ID_QUEUED) => {
                    break candidate;
                }
                Ok(_) => continue,
                Err(error) => {
                    error!("run_next_task({}): {}", candidate, error);
                    continue;
                }
            }
        };
        debug!("run_task({})", task_id);
        self.run_task(task_id).await;

        drop(permit);
        let queue_empty = self.task_queue.lock().unwrap().is_empty();
        if !queue_empty {
            // It doesn't hurt to run this too much, but it does hurt to
            // not run it enough:
            self.submit_run_next();
        }
    }

    /// Registers a WAITING_FOR_INTERVAL task with the in-memory timer.
    /// The monitor id stays locked on the task; monitor death is the
    /// recovery path for sleeping tasks.
    #[instrument(skip_all)]
    pub(crate) async fn monitor_delayed_task(self: &Arc<Self>, task: &TaskData) {
        let Some(remaining_ms) = task.milliseconds_remaining else {
            return;
        };
        let task_id = task.task_id;
        let mut delayed = self.delayed_tasks.lock().await;
        if delayed.contains_key(&task_id) {
            debug!("already monitoring delayed task_id={}", task_id);
            return;
        }
        delayed.insert(
            task_id,
            DelayedTask {
                begin: Instant::now(),
                remaining_ms,
            },
        );
        drop(delayed);
        let interval = self.config.poll_interval_ms.min(remaining_ms.max(0) as u64);
        self.schedule_delayed_tick(task_id, interval);
        debug!("monitoring delayed task_id={}", task_id);
    }

    fn schedule_delayed_tick(self: &Arc<Self>, task_id: i64, delay_ms: u64) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match manager.monitor.begin().await {
                Ok(session) => {
                    manager
                        .update_delayed_task(task_id, Some(session.info().clone()))
                        .await;
                }
                Err(_) => {
                    manager.update_delayed_task(task_id, None).await;
                }
            }
        });
        self.track(handle);
    }

    /// One liveness tick of a delayed task: conditionally decrement
    /// `millisecondsRemaining` (guarded by equality with the previous
    /// value); at zero, or when no live monitor backs the timer, flip the
    /// task to QUEUED and dispatch it.
    pub(crate) async fn update_delayed_task(
        self: &Arc<Self>,
        task_id: i64,
        monitor_info: Option<MonitorInfo>,
    ) {
        let mut delayed = self.delayed_tasks.lock().await;
        let Some(entry) = delayed.get_mut(&task_id) else {
            return;
        };
        let now = Instant::now();
        let elapsed = (now - entry.begin).as_millis() as i64;
        let new_remaining = entry.remaining_ms - elapsed;
        let mut monitor_info = monitor_info;

        let update = if new_remaining <= 0 || monitor_info.is_none() {
            Update::new()
                .remove("tic")
                .set("mid", MONITOR_ID_QUEUED)
                .set("stat", state_to_letter(TaskState::Queued))
        } else {
            Update::new()
                .set("tic", new_remaining)
                .set("mid", monitor_info.as_ref().map(|info| info.monitor_id()).unwrap_or_default())
        };
        let result = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(task_id),
                update,
                Some(Expr::eq("tic", entry.remaining_ms)),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed(_)) => {
                debug!(
                    "failed to update task_id={} due to tic != {}",
                    task_id, entry.remaining_ms
                );
                monitor_info = None;
            }
            Err(error) => {
                error!("delayed tick for task_id={}: {}", task_id, error);
                monitor_info = None;
            }
        }
        if new_remaining <= 0 || monitor_info.is_none() {
            // Stop monitoring:
            delayed.remove(&task_id);
            drop(delayed);
            self.submit_run_task(task_id);
            self.submit_run_next();
            return;
        }
        entry.remaining_ms = new_remaining;
        entry.begin = now;
        let interval = self.config.poll_interval_ms.min(new_remaining as u64);
        drop(delayed);
        self.schedule_delayed_tick(task_id, interval);
    }
}

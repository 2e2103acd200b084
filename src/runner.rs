use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::codec::{
    decode_task, state_to_letter, MONITOR_ID_QUEUED, MONITOR_ID_WAITING, TASKS_TABLE,
};
use crate::error::{StoreError, TaskError};
use crate::manager::TaskManager;
use crate::monitor::MonitorInfo;
use crate::store::{Expr, Key, Update};
use crate::task::{TaskContext, TaskData, TaskState};

/// Retry interval written for a queued task whose entity type has no
/// registered handler.
const UNSUPPORTED_HANDLER_RETRY_MS: i64 = 60_000;

impl TaskManager {
    /// Runs one claim attempt inside a fresh monitor session.
    pub(crate) async fn run_task(self: &Arc<Self>, task_id: i64) {
        match self.monitor.begin().await {
            Ok(session) => {
                self.lock_and_run_task(task_id, session.info()).await;
            }
            Err(TaskError::ShuttingDown) => {
                self.disabled.store(true, Ordering::SeqCst);
                error!("monitor is shutting down, task dispatch disabled");
            }
            Err(error) => {
                error!("run_task({}) FAILED: {}", task_id, error);
            }
        }
    }

    /// The QUEUED -> RUNNING claim and everything that follows it.
    ///
    /// Exactly one peer wins the `mid = QUEUED_SENTINEL` guard; the loser
    /// aborts silently. The post-claim snapshot (including `requeues`) is
    /// the fence baseline for the rest of the run.
    async fn lock_and_run_task(self: &Arc<Self>, task_id: i64, monitor_info: &MonitorInfo) {
        // Lock the task:
        let claimed = self
            .store
            .conditional_update(
                TASKS_TABLE,
                &Key::hash(task_id),
                Update::new()
                    .set("mid", monitor_info.monitor_id())
                    .set("stat", state_to_letter(TaskState::Running))
                    .set("ts", Utc::now().timestamp_millis())
                    .increment("cnt", 1),
                Some(Expr::eq("mid", MONITOR_ID_QUEUED)),
            )
            .await;
        let original = match claimed {
            Ok(row) => match decode_task(&row) {
                Ok(task) => task,
                Err(error) => {
                    error!("claimed undecodable task_id={}: {}", task_id, error);
                    return;
                }
            },
            Err(StoreError::PreconditionFailed(_)) => {
                // Someone else already locked this task:
                debug!("something else is running task_id={}", task_id);
                return;
            }
            Err(error) => {
                error!("unable to claim task_id={}: {}", task_id, error);
                return;
            }
        };

        let mut submit_queued_task = true;
        let mut locks_acquired: Vec<String> = Vec::new();
        let mut final_task = original.clone();
        final_task.task_state = TaskState::Queued;

        let body = self
            .run_task_body(
                &original,
                &mut final_task,
                &mut locks_acquired,
                &mut submit_queued_task,
                monitor_info,
            )
            .await;
        match &body {
            Ok(()) => {}
            Err(TaskError::LostLock(_)) | Err(TaskError::Store(StoreError::Interrupted)) => {
                error!(
                    "failing heartbeat {} due to task_id={}: {:?}",
                    monitor_info.monitor_id(),
                    task_id,
                    body
                );
                monitor_info.force_heartbeat_failure();
            }
            Err(error) => {
                // Transient failure: the state write below re-queues the
                // task so this or a peer node retries it.
                error!("run of task_id={} failed: {}", task_id, error);
            }
        }

        if monitor_info.has_failed_heartbeat() {
            return;
        }
        if let Err(error) = self
            .update_task_state(
                &original,
                &mut final_task,
                &mut locks_acquired,
                monitor_info,
                submit_queued_task,
            )
            .await
        {
            error!(
                "failing heartbeat {} in update_task_state due to task_id={}: {}",
                monitor_info.monitor_id(),
                task_id,
                error
            );
            monitor_info.force_heartbeat_failure();
        }
        if final_task.task_state.is_terminal() {
            self.on_terminal_state(&final_task);
        }
    }

    /// Claim body: cancellation check, sleep timers, prerequisites, lock
    /// acquisition, then the user handler.
    async fn run_task_body(
        self: &Arc<Self>,
        original: &TaskData,
        final_task: &mut TaskData,
        locks_acquired: &mut Vec<String>,
        submit_queued_task: &mut bool,
        monitor_info: &MonitorInfo,
    ) -> Result<(), TaskError> {
        if final_task.canceled_by.is_some() {
            final_task.task_state = TaskState::Canceled;
            return Ok(());
        }
        // An update-data delivery skips coordination: the handler runs
        // immediately with the caller's bytes in-band.
        if original.update_data.is_none() {
            if final_task.milliseconds_remaining.is_some() {
                self.monitor_delayed_task(final_task).await;
                // NOTE: we MUST keep the mid locked in this scenario.
                final_task.task_state = TaskState::WaitingForInterval;
                return Ok(());
            }
            if !self.locks.check_prerequisites(final_task).await? {
                return Ok(());
            }
            if !self
                .locks
                .acquire(final_task, locks_acquired, monitor_info.monitor_id())
                .await?
            {
                return Ok(());
            }
        }
        let factory = match self.registry.get(&final_task.entity_type).await {
            Ok(factory) => factory,
            Err(_) => {
                info!(
                    "unsupported entity_type={} task_id={}",
                    final_task.entity_type, final_task.task_id
                );
                // Park the task as a sleep timer and retry later:
                final_task.milliseconds_remaining = Some(UNSUPPORTED_HANDLER_RETRY_MS);
                final_task.task_state = TaskState::Success;
                *submit_queued_task = false;
                return Ok(());
            }
        };
        debug!(
            "running task_id={} entity_type={} entity_id={}",
            final_task.task_id, final_task.entity_type, final_task.entity_id
        );
        let ctx = TaskContext::new(original.clone(), monitor_info.clone(), self.store.clone());
        let handler = factory();
        match handler.run(ctx).await {
            Ok(Some(replacement)) => {
                *final_task = replacement;
                final_task.task_state = TaskState::Success;
            }
            Ok(None) => {
                final_task.task_state = TaskState::Success;
            }
            Err(message) => {
                if monitor_info.has_failed_heartbeat() {
                    // A lost-lock already unwound through the handler.
                    return Err(TaskError::LostLock(format!("task_id={}", original.task_id)));
                }
                let error_id = Uuid::new_v4().to_string();
                debug!(
                    "failed task_id={} error_id={}: {}",
                    original.task_id, error_id, message
                );
                final_task.error_id = Some(error_id);
                final_task.error_stack_trace = Some(format!(
                    "on node_name={} {}",
                    monitor_info.node_name(),
                    message
                ));
                final_task.error_message = Some(message);
                final_task.task_state = TaskState::Failed;
            }
        }
        Ok(())
    }

    /// Persists the final state, clears consumed update data, releases
    /// locks and dispatches whatever those steps made runnable.
    ///
    /// Writing a WAITING state additionally asserts `requeues` has not
    /// moved since the claim; when it has, this run lost a wakeup race and
    /// the task is rewritten to QUEUED and re-enqueued instead.
    async fn update_task_state(
        self: &Arc<Self>,
        original: &TaskData,
        final_task: &mut TaskData,
        locks_acquired: &mut Vec<String>,
        monitor_info: &MonitorInfo,
        submit_queued_task: bool,
    ) -> Result<(), TaskError> {
        let task_id = original.task_id;
        let mut tasks_to_run: Vec<i64> = Vec::new();
        for _retry in 0..3 {
            let update = build_update_task_state(original, final_task);
            let check_for_requeue = final_task.monitor_id.as_deref() == Some(MONITOR_ID_WAITING);
            let mut condition = Expr::eq("mid", monitor_info.monitor_id());
            if check_for_requeue {
                condition = Expr::and(
                    condition,
                    match original.requeues {
                        None => Expr::not(Expr::exists("agn")),
                        Some(requeues) => Expr::eq("agn", requeues),
                    },
                );
            }
            let written = self
                .store
                .conditional_update(TASKS_TABLE, &Key::hash(task_id), update, Some(condition))
                .await;
            match written {
                Ok(_) => {}
                Err(StoreError::PreconditionFailed(_)) => {
                    if check_for_requeue {
                        if let Some(task) = self.get_task(task_id).await? {
                            if task.monitor_id.as_deref() == Some(monitor_info.monitor_id()) {
                                debug!(
                                    "'agn'={:?} of task_id={} changed to={:?} during run, retrying",
                                    original.requeues, task_id, task.requeues
                                );
                                final_task.task_state = TaskState::Queued;
                                if submit_queued_task {
                                    tasks_to_run.push(task_id);
                                }
                                continue;
                            }
                        }
                    }
                    return Err(TaskError::LostLock(format!("task_id={}", task_id)));
                }
                Err(StoreError::Interrupted) => {
                    debug!("interrupted in attempt to update_task_state({})", task_id);
                    continue;
                }
                Err(error) => return Err(error.into()),
            }

            if let Some(update_data) = &original.update_data {
                // Remove the update data, but only if it has remained
                // unchanged (which is why this is a separate update):
                let condition = if final_task.task_state.is_terminal() {
                    None
                } else {
                    Some(Expr::eq("upd", update_data.clone()))
                };
                let cleared = self
                    .store
                    .conditional_update(
                        TASKS_TABLE,
                        &Key::hash(task_id),
                        Update::new().remove("upd"),
                        condition,
                    )
                    .await;
                match cleared {
                    Ok(_) => {}
                    Err(StoreError::PreconditionFailed(_)) => {
                        debug!("'upd' of task_id={} changed during run, not clearing", task_id);
                    }
                    Err(error) => return Err(error.into()),
                }
            }

            self.locks
                .release(
                    locks_acquired,
                    task_id,
                    monitor_info.monitor_id(),
                    &mut tasks_to_run,
                    final_task.task_state.is_terminal(),
                )
                .await?;

            // Dispatch whatever the release made runnable:
            if self.monitor.is_active_monitor(monitor_info) {
                let mut task_submitted = false;
                for task_to_run in tasks_to_run.drain(..) {
                    self.submit_run_task(task_to_run);
                    task_submitted = true;
                }
                if submit_queued_task && final_task.task_state == TaskState::Queued {
                    self.submit_run_task(task_id);
                    task_submitted = true;
                }
                if task_submitted {
                    self.submit_run_next();
                }
            }
            return Ok(());
        }
        error!(
            "interrupted too many times, giving up on update_task_state({}), failing the monitor",
            task_id
        );
        monitor_info.force_heartbeat_failure();
        Ok(())
    }
}

/// Builds the finalizing update and settles the task's destination
/// monitor id. A SUCCESS whose replacement changed locks, prerequisites,
/// update data, or set a sleep interval is rewritten to QUEUED so the
/// reconfigured task runs again.
fn build_update_task_state(original: &TaskData, final_task: &mut TaskData) -> Update {
    let mut update = Update::new();
    final_task.monitor_id = None;
    match final_task.task_state {
        TaskState::WaitingForInterval => {
            // Special case: the mid stays locked on this monitor.
            return update.set("stat", state_to_letter(TaskState::WaitingForInterval));
        }
        TaskState::Failed => {
            if let Some(error_message) = &final_task.error_message {
                update = update.set("err", error_message.clone());
            }
            if let Some(error_id) = &final_task.error_id {
                update = update.set("errId", error_id.clone());
            }
            if let Some(error_stack_trace) = &final_task.error_stack_trace {
                update = update.set("errT", error_stack_trace.clone());
            }
        }
        TaskState::Success => {
            if original.checkpoint_data != final_task.checkpoint_data {
                update = match &final_task.checkpoint_data {
                    Some(checkpoint_data) => update.set("st8", checkpoint_data.clone()),
                    None => update.remove("st8"),
                };
            }
            if original.lock_ids != final_task.lock_ids {
                final_task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
                final_task.task_state = TaskState::Queued;
                update = if final_task.lock_ids.is_empty() {
                    update.remove("lids")
                } else {
                    update.set(
                        "lids",
                        crate::store::AttrValue::StrSet(final_task.lock_ids.clone()),
                    )
                };
            }
            if original.prerequisite_task_ids != final_task.prerequisite_task_ids {
                final_task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
                final_task.task_state = TaskState::Queued;
                update = if final_task.prerequisite_task_ids.is_empty() {
                    update.remove("preq").remove("any")
                } else {
                    update
                        .set(
                            "preq",
                            crate::store::AttrValue::NumSet(
                                final_task.prerequisite_task_ids.clone(),
                            ),
                        )
                        .set("any", final_task.any_prerequisite)
                };
            }
            if let Some(milliseconds_remaining) = final_task.milliseconds_remaining {
                final_task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
                final_task.task_state = TaskState::Queued;
                update = update.set("tic", milliseconds_remaining);
            }
            if final_task.update_data.is_some() && final_task.update_data != original.update_data {
                final_task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
                final_task.task_state = TaskState::Queued;
                update = update.set(
                    "upd",
                    final_task.update_data.clone().unwrap_or_default(),
                );
            }
        }
        TaskState::WaitingForPrerequisite | TaskState::WaitingForLock => {
            final_task.monitor_id = Some(MONITOR_ID_WAITING.to_string());
        }
        TaskState::Queued => {
            final_task.monitor_id = Some(MONITOR_ID_QUEUED.to_string());
        }
        TaskState::Running => unreachable!("a finalized task is never RUNNING"),
        TaskState::Canceled => {
            // Release the monitor and persist the state as-is.
        }
    }
    update = update
        .set("stat", state_to_letter(final_task.task_state))
        .set("tf", Utc::now().timestamp_millis());
    match &final_task.monitor_id {
        None => {
            update = update.remove("mid").remove("ntty").remove("ntid");
        }
        Some(monitor_id) => {
            update = update.set("mid", monitor_id.clone());
        }
    }
    debug!(
        "task_id={} state={}",
        original.task_id, final_task.task_state
    );
    update
}

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::TaskError;

/// Identity and heartbeat status of one live worker context.
///
/// Cloning shares the failure flag: any `mid = me` guard that fails
/// mid-run calls [`MonitorInfo::force_heartbeat_failure`], and every
/// holder of the clone observes it.
#[derive(Debug, Clone)]
pub struct MonitorInfo {
    monitor_id: String,
    node_name: String,
    failed: Arc<AtomicBool>,
}

impl MonitorInfo {
    pub fn new(monitor_id: String, node_name: String) -> Self {
        Self {
            monitor_id,
            node_name,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn has_failed_heartbeat(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Marks this monitor as dead. The heartbeat layer is expected to stop
    /// renewing it so peers recover every lock and task it holds.
    pub fn force_heartbeat_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

/// A live monitor context obtained from [`Monitor::begin`]; work performed
/// while holding the session is attributed to its monitor id.
#[derive(Debug)]
pub struct MonitorSession {
    info: MonitorInfo,
}

impl MonitorSession {
    pub fn new(info: MonitorInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &MonitorInfo {
        &self.info
    }
}

/// The heartbeat capability the core runs under.
///
/// The heartbeat registry itself is outside this crate; the core only
/// needs to open a session per unit of work and to ask whether a monitor
/// is still allowed to dispatch. Implementations raise
/// [`TaskError::ShuttingDown`] from `begin` when no further work may run.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn begin(&self) -> Result<MonitorSession, TaskError>;

    fn is_active_monitor(&self, info: &MonitorInfo) -> bool;
}

/// In-process monitor for embedding and tests.
///
/// Mints a fresh monitor id per session, so each claim attempt runs under
/// its own identity. Production implementations are expected to tie
/// sessions to a heartbeat registry row instead and keep the id stable for
/// the life of the heartbeat.
#[derive(Debug)]
pub struct LocalMonitor {
    node_name: String,
    shutting_down: AtomicBool,
}

impl LocalMonitor {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Monitor for LocalMonitor {
    async fn begin(&self) -> Result<MonitorSession, TaskError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }
        Ok(MonitorSession::new(MonitorInfo::new(
            format!("mon-{}", Uuid::new_v4()),
            self.node_name.clone(),
        )))
    }

    fn is_active_monitor(&self, info: &MonitorInfo) -> bool {
        !info.has_failed_heartbeat() && !self.shutting_down.load(Ordering::SeqCst)
    }
}

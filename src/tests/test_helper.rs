#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crate::config::TaskQueueConfig;
use crate::manager::TaskManager;
use crate::memory::MemoryStore;
use crate::monitor::LocalMonitor;
use crate::store::{KeyValueStore, PageIterator};
use crate::task::{TaskData, TaskRegistry};

/// Short intervals so the end-to-end scenarios settle in milliseconds.
pub fn fast_config() -> TaskQueueConfig {
    TaskQueueConfig {
        poll_interval_ms: 200,
        max_tasks_in_interval: 10,
        cleanup_intervals: 3,
        max_backoff_ms: 25,
        pool_size: 4,
    }
}

/// Wires a manager to hermetic in-memory collaborators.
pub async fn manager_with(
    registry: TaskRegistry,
) -> (Arc<TaskManager>, Arc<LocalMonitor>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let monitor = Arc::new(LocalMonitor::new("test-node"));
    let manager = TaskManager::new(
        store.clone(),
        monitor.clone(),
        Arc::new(registry),
        fast_config(),
    )
    .await
    .unwrap();
    (manager, monitor, store)
}

/// Polls a task until the predicate holds; panics with the last observed
/// snapshot on timeout.
pub async fn wait_for_task(
    manager: &Arc<TaskManager>,
    task_id: i64,
    timeout_ms: u64,
    predicate: impl Fn(&TaskData) -> bool,
) -> TaskData {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut last: Option<TaskData> = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(task) = manager.get_task(task_id).await.unwrap() {
            if predicate(&task) {
                return task;
            }
            last = Some(task);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task_id={} did not reach the expected state in {}ms, last={:?}",
        task_id, timeout_ms, last
    );
}

/// Every row currently in the lock table.
pub async fn lock_rows(store: &Arc<MemoryStore>) -> Vec<crate::store::Row> {
    let mut rows = Vec::new();
    let mut iter = PageIterator::new();
    while iter.has_next() {
        rows.extend(
            store
                .scan_index(crate::codec::LOCKS_TABLE, None, &mut iter)
                .await
                .unwrap(),
        );
    }
    rows
}

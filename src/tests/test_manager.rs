#[cfg(test)]
mod test_manager {
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    use crate::task::{TaskContext, TaskData, TaskHandler, TaskRegistry};
    use crate::task::TaskState;
    use crate::tests::test_helper::{lock_rows, manager_with, wait_for_task};

    static ECHO_RUNS: AtomicUsize = AtomicUsize::new(0);

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            ECHO_RUNS.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    static SLOW_ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static SLOW_OVERLAPS: AtomicUsize = AtomicUsize::new(0);

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            if SLOW_ACTIVE.fetch_add(1, Ordering::SeqCst) > 0 {
                SLOW_OVERLAPS.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            SLOW_ACTIVE.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    static GATE_OPEN: AtomicBool = AtomicBool::new(false);
    static GATED_RUNS: AtomicUsize = AtomicUsize::new(0);

    struct GatedHandler;

    #[async_trait]
    impl TaskHandler for GatedHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            GATED_RUNS.fetch_add(1, Ordering::SeqCst);
            while !GATE_OPEN.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(None)
        }
    }

    static NEVER_RUNS: AtomicUsize = AtomicUsize::new(0);

    struct NeverHandler;

    #[async_trait]
    impl TaskHandler for NeverHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            NEVER_RUNS.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    static FLAKY_RUNS: AtomicUsize = AtomicUsize::new(0);
    static FLAKY_GATE: AtomicBool = AtomicBool::new(false);

    struct FlakyHandler;

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            if FLAKY_RUNS.fetch_add(1, Ordering::SeqCst) == 0 {
                // First run hangs until the test simulates the crash.
                while !FLAKY_GATE.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
            Ok(None)
        }
    }

    static FAILING_RUNS: AtomicUsize = AtomicUsize::new(0);

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn run(&self, _ctx: TaskContext) -> Result<Option<TaskData>, String> {
            FAILING_RUNS.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn single_task_runs_to_success() {
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task = manager
            .create_task()
            .entity_type("echo")
            .entity_id("e1")
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        manager.add_task(task).await.unwrap();

        let done = wait_for_task(&manager, task_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Success);
        assert_eq!(done.run_count, 1);
        assert_eq!(done.monitor_id, None);
        assert!(done.end_time.unwrap() >= done.start_time.unwrap());
        assert_eq!(ECHO_RUNS.load(Ordering::SeqCst), 1);
        assert!(lock_rows(&store).await.is_empty());

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn named_lock_serializes_two_tasks() {
        SLOW_ACTIVE.store(0, Ordering::SeqCst);
        SLOW_OVERLAPS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("slow".to_string(), || Box::new(SlowHandler {})).await;
        let (manager, _monitor, store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let mut task_ids = Vec::new();
        for entity_id in ["a", "b"] {
            let task = manager
                .create_task()
                .entity_type("slow")
                .entity_id(entity_id)
                .lock_ids(BTreeSet::from(["L".to_string()]))
                .build()
                .await
                .unwrap();
            task_ids.push(task.task_id);
            manager.add_task(task).await.unwrap();
        }

        for task_id in &task_ids {
            let done = wait_for_task(&manager, *task_id, 10_000, |task| {
                task.task_state.is_terminal()
            })
            .await;
            assert_eq!(done.task_state, TaskState::Success);
        }
        // Exactly one of the two was ever running at a time.
        assert_eq!(SLOW_OVERLAPS.load(Ordering::SeqCst), 0);
        assert!(lock_rows(&store).await.is_empty());

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn prerequisite_orders_two_tasks() {
        GATE_OPEN.store(false, Ordering::SeqCst);
        GATED_RUNS.store(0, Ordering::SeqCst);
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("gated".to_string(), || Box::new(GatedHandler {})).await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task_a = manager
            .create_task()
            .entity_type("gated")
            .entity_id("a")
            .build()
            .await
            .unwrap();
        let a_id = task_a.task_id;
        manager.add_task(task_a).await.unwrap();

        let task_c = manager
            .create_task()
            .entity_type("echo")
            .entity_id("c")
            .prerequisite_task_ids(BTreeSet::from([a_id]))
            .build()
            .await
            .unwrap();
        let c_id = task_c.task_id;
        manager.add_task(task_c).await.unwrap();

        // C parks on A's barrier while A is still running.
        wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state == TaskState::WaitingForPrerequisite
        })
        .await;
        assert_eq!(ECHO_RUNS.load(Ordering::SeqCst), 0);

        GATE_OPEN.store(true, Ordering::SeqCst);
        let done_a = wait_for_task(&manager, a_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done_a.task_state, TaskState::Success);
        let done_c = wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done_c.task_state, TaskState::Success);
        assert!(done_c.end_time.unwrap() >= done_a.end_time.unwrap());

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn sleep_timer_runs_after_the_interval() {
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task = manager
            .create_task()
            .entity_type("echo")
            .entity_id("d")
            .milliseconds_remaining(250)
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        let added = manager.add_task(task).await.unwrap();
        assert_eq!(added.task_state, TaskState::WaitingForInterval);

        // The claim leaves the task sleeping on a live monitor.
        wait_for_task(&manager, task_id, 2_000, |task| {
            task.task_state == TaskState::WaitingForInterval
                && task.monitor_id.as_deref().map(|mid| mid.starts_with("mon-")) == Some(true)
        })
        .await;
        assert_eq!(ECHO_RUNS.load(Ordering::SeqCst), 0);

        let done = wait_for_task(&manager, task_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Success);
        assert_eq!(ECHO_RUNS.load(Ordering::SeqCst), 1);

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn crashed_worker_is_recovered_by_peer_sweep() {
        FLAKY_RUNS.store(0, Ordering::SeqCst);
        FLAKY_GATE.store(false, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("flaky".to_string(), || Box::new(FlakyHandler {})).await;
        let (manager, _monitor, store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task = manager
            .create_task()
            .entity_type("flaky")
            .entity_id("x")
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        manager.add_task(task).await.unwrap();

        let running = wait_for_task(&manager, task_id, 5_000, |task| {
            task.task_state == TaskState::Running
        })
        .await;
        let dead_monitor = running.monitor_id.unwrap();

        // The heartbeat registry reports the monitor dead; recovery flips
        // the task back to QUEUED and a second run completes it.
        manager
            .release_locks_for_monitor_id(&dead_monitor)
            .await
            .unwrap();

        let done = wait_for_task(&manager, task_id, 10_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Success);
        assert_eq!(done.run_count, 2);
        assert_eq!(FLAKY_RUNS.load(Ordering::SeqCst), 2);

        // Let the first, orphaned run unwind; its guarded write fails and
        // only fails its own heartbeat.
        FLAKY_GATE.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(lock_rows(&store).await.is_empty());

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn canceling_a_waiting_task_skips_its_handler() {
        GATE_OPEN.store(false, Ordering::SeqCst);
        GATED_RUNS.store(0, Ordering::SeqCst);
        NEVER_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("gated".to_string(), || Box::new(GatedHandler {})).await;
        registry.register("never".to_string(), || Box::new(NeverHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task_a = manager
            .create_task()
            .entity_type("gated")
            .entity_id("a")
            .build()
            .await
            .unwrap();
        let a_id = task_a.task_id;
        manager.add_task(task_a).await.unwrap();

        let task_c = manager
            .create_task()
            .entity_type("never")
            .entity_id("c")
            .prerequisite_task_ids(BTreeSet::from([a_id]))
            .build()
            .await
            .unwrap();
        let c_id = task_c.task_id;
        manager.add_task(task_c).await.unwrap();

        wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state == TaskState::WaitingForPrerequisite
        })
        .await;

        manager.cancel_task("alice", c_id).await.unwrap();
        let done = wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Canceled);
        assert_eq!(done.canceled_by.as_deref(), Some("alice"));
        assert_eq!(NEVER_RUNS.load(Ordering::SeqCst), 0);

        GATE_OPEN.store(true, Ordering::SeqCst);
        wait_for_task(&manager, a_id, 5_000, |task| task.task_state.is_terminal()).await;
        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn failed_handler_records_an_error_id() {
        FAILING_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("failing".to_string(), || Box::new(FailingHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task = manager
            .create_task()
            .entity_type("failing")
            .entity_id("f")
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        manager.add_task(task).await.unwrap();

        let done = wait_for_task(&manager, task_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Failed);
        assert_eq!(done.error_message.as_deref(), Some("boom"));
        assert!(done.error_id.is_some());
        assert!(done
            .error_stack_trace
            .as_deref()
            .unwrap()
            .contains("node_name=test-node"));

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn terminal_subscribers_observe_the_final_snapshot() {
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let seen: Arc<std::sync::Mutex<Vec<(i64, TaskState)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = manager.add_on_terminal_state(Arc::new(move |task| {
            sink.lock().unwrap().push((task.task_id, task.task_state));
        }));
        // A panicking subscriber is swallowed and must not break delivery.
        manager.add_on_terminal_state(Arc::new(|_task| panic!("subscriber bug")));

        let task = manager
            .create_task()
            .entity_type("echo")
            .entity_id("s")
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        manager.add_task(task).await.unwrap();

        wait_for_task(&manager, task_id, 5_000, |task| task.task_state.is_terminal()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = seen.lock().unwrap().clone();
        assert!(events.contains(&(task_id, TaskState::Success)));
        assert!(manager.remove_on_terminal_state(subscription));

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn delete_task_refuses_a_running_task() {
        GATE_OPEN.store(false, Ordering::SeqCst);
        GATED_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("gated".to_string(), || Box::new(GatedHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task = manager
            .create_task()
            .entity_type("gated")
            .entity_id("g")
            .build()
            .await
            .unwrap();
        let task_id = task.task_id;
        manager.add_task(task).await.unwrap();

        wait_for_task(&manager, task_id, 5_000, |task| {
            task.task_state == TaskState::Running
        })
        .await;
        assert!(matches!(
            manager.delete_task(task_id).await,
            Err(crate::error::TaskError::TaskLocked(_))
        ));

        GATE_OPEN.store(true, Ordering::SeqCst);
        wait_for_task(&manager, task_id, 5_000, |task| task.task_state.is_terminal()).await;
        // Terminal tasks carry no monitor id and may be deleted.
        manager.delete_task(task_id).await.unwrap();
        assert!(manager.get_task(task_id).await.unwrap().is_none());

        manager.stop_task_queue_monitor(false).await;
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn add_task_validates_its_input() {
        let mut registry = TaskRegistry::new().await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;

        let unregistered = manager
            .create_task()
            .entity_type("mystery")
            .entity_id("m")
            .build()
            .await
            .unwrap();
        assert!(matches!(
            manager.add_task(unregistered).await,
            Err(crate::error::TaskError::InvalidArgument(_))
        ));

        let no_entity = manager.create_task().entity_id("m").build().await.unwrap();
        assert!(manager.add_task(no_entity).await.is_err());

        let mut no_id = TaskData::default();
        no_id.entity_type = "echo".to_string();
        no_id.entity_id = "m".to_string();
        assert!(manager.add_task(no_id).await.is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn entity_queries_page_and_filter() {
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;

        for entity_id in ["alpha/1", "alpha/2", "beta/1"] {
            let task = manager
                .create_task()
                .entity_type("echo")
                .entity_id(entity_id)
                .build()
                .await
                .unwrap();
            manager.add_task(task).await.unwrap();
        }

        let mut iter = crate::store::PageIterator::new().page_size(2);
        let mut all = Vec::new();
        while iter.has_next() {
            all.extend(manager.get_tasks_by_entity_type("echo", &mut iter).await.unwrap());
        }
        assert_eq!(all.len(), 3);
        // Entity-scoped queries come back sorted by task id.
        let ids: Vec<i64> = all.iter().map(|task| task.task_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        let mut iter = crate::store::PageIterator::new();
        let alphas = manager
            .get_tasks_by_entity_id_begins_with("echo", "alpha/", &mut iter)
            .await
            .unwrap();
        assert_eq!(alphas.len(), 2);

        let mut iter = crate::store::PageIterator::new();
        let non_terminal = manager.get_non_terminal_tasks(&mut iter).await.unwrap();
        assert_eq!(non_terminal.len(), 3);

        let mut iter = crate::store::PageIterator::new();
        let everything = manager.get_all_tasks(&mut iter).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn update_task_requeues_a_waiting_task() {
        GATE_OPEN.store(false, Ordering::SeqCst);
        GATED_RUNS.store(0, Ordering::SeqCst);
        ECHO_RUNS.store(0, Ordering::SeqCst);
        let mut registry = TaskRegistry::new().await;
        registry.register("gated".to_string(), || Box::new(GatedHandler {})).await;
        registry.register("echo".to_string(), || Box::new(EchoHandler {})).await;
        let (manager, _monitor, _store) = manager_with(registry).await;
        manager.monitor_task_queue();

        let task_a = manager
            .create_task()
            .entity_type("gated")
            .entity_id("a")
            .build()
            .await
            .unwrap();
        let a_id = task_a.task_id;
        manager.add_task(task_a).await.unwrap();

        let task_c = manager
            .create_task()
            .entity_type("echo")
            .entity_id("c")
            .prerequisite_task_ids(BTreeSet::from([a_id]))
            .build()
            .await
            .unwrap();
        let c_id = task_c.task_id;
        manager.add_task(task_c).await.unwrap();

        wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state == TaskState::WaitingForPrerequisite
        })
        .await;

        // The update bypasses the wait: the handler runs with the bytes
        // in-band even though A is still running.
        manager.update_task(b"payload".to_vec(), c_id).await.unwrap();
        let done = wait_for_task(&manager, c_id, 5_000, |task| {
            task.task_state.is_terminal()
        })
        .await;
        assert_eq!(done.task_state, TaskState::Success);
        assert_eq!(done.update_data, None);
        assert_eq!(ECHO_RUNS.load(Ordering::SeqCst), 1);

        GATE_OPEN.store(true, Ordering::SeqCst);
        wait_for_task(&manager, a_id, 5_000, |task| task.task_state.is_terminal()).await;
        manager.stop_task_queue_monitor(false).await;
    }
}

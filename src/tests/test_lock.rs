#[cfg(test)]
mod test_lock {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use crate::codec::{
        encode_task, lock_table_schema, sort_key, task_table_schema, LOCKS_TABLE,
        MONITOR_ID_QUEUED, MONITOR_ID_WAITING, TASKS_TABLE, TASK_ID_NONE,
    };
    use crate::lock::{prereq_barrier, Locks};
    use crate::memory::MemoryStore;
    use crate::store::{AttrValue, Key, KeyValueStore};
    use crate::task::{TaskData, TaskState};

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table(&task_table_schema()).await.unwrap();
        store.ensure_table(&lock_table_schema()).await.unwrap();
        store
    }

    fn task(task_id: i64, monitor_id: &str, state: TaskState) -> TaskData {
        TaskData {
            task_id,
            entity_type: "echo".to_string(),
            entity_id: format!("e{}", task_id),
            task_state: state,
            monitor_id: Some(monitor_id.to_string()),
            ..TaskData::default()
        }
    }

    async fn put_task(store: &Arc<MemoryStore>, task: &TaskData) {
        store.put(TASKS_TABLE, encode_task(task)).await.unwrap();
    }

    async fn held_lock(store: &Arc<MemoryStore>, lock_id: &str) -> Option<crate::store::Row> {
        store
            .get(LOCKS_TABLE, &Key::with_range(lock_id, TASK_ID_NONE))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_grants_named_lock_and_own_barrier() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);
        let mut task_a = task(1, "mon-a", TaskState::Running);
        task_a.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_a).await;

        let mut acquired = Vec::new();
        let got = locks.acquire(&mut task_a, &mut acquired, "mon-a").await.unwrap();
        assert!(got);
        // Sorted ascending: the named lock before the barrier.
        assert_eq!(acquired, vec!["L".to_string(), prereq_barrier(1)]);

        let row = held_lock(&store, "L").await.unwrap();
        assert_eq!(row.get("mid"), Some(&AttrValue::from("mon-a")));
        assert_eq!(row.get("rtid"), Some(&AttrValue::Num(1)));
        assert_eq!(row.get("agn"), Some(&AttrValue::Num(1)));
        assert!(held_lock(&store, &prereq_barrier(1)).await.is_some());
    }

    #[tokio::test]
    async fn contended_lock_enqueues_a_fenced_waiter() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);

        let mut task_a = task(1, "mon-a", TaskState::Running);
        task_a.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_a).await;
        let mut acquired_a = Vec::new();
        assert!(locks.acquire(&mut task_a, &mut acquired_a, "mon-a").await.unwrap());

        let mut task_b = task(2, "mon-b", TaskState::Running);
        task_b.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_b).await;
        let mut acquired_b = Vec::new();
        let got = locks.acquire(&mut task_b, &mut acquired_b, "mon-b").await.unwrap();
        assert!(!got);
        assert_eq!(task_b.task_state, TaskState::WaitingForLock);

        // The waiter entry exists and the enqueue bumped the fence.
        let waiter = store
            .get(LOCKS_TABLE, &Key::with_range("L", sort_key(2)))
            .await
            .unwrap();
        assert!(waiter.is_some());
        let held = held_lock(&store, "L").await.unwrap();
        assert_eq!(held.get("agn"), Some(&AttrValue::Num(2)));
        assert_eq!(held.get("mid"), Some(&AttrValue::from("mon-a")));
    }

    #[tokio::test]
    async fn release_wakes_one_waiter_and_deletes_the_lock() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);

        let mut task_a = task(1, "mon-a", TaskState::Running);
        task_a.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_a).await;
        let mut acquired_a = Vec::new();
        assert!(locks.acquire(&mut task_a, &mut acquired_a, "mon-a").await.unwrap());

        let mut task_b = task(2, "mon-b", TaskState::Running);
        task_b.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_b).await;
        let mut acquired_b = Vec::new();
        assert!(!locks.acquire(&mut task_b, &mut acquired_b, "mon-b").await.unwrap());

        // B persisted as waiting, the shape release expects to flip.
        let mut task_b = task(2, MONITOR_ID_WAITING, TaskState::WaitingForLock);
        task_b.lock_ids = BTreeSet::from(["L".to_string()]);
        put_task(&store, &task_b).await;

        let mut tasks_to_run = Vec::new();
        locks
            .release(&mut acquired_a, 1, "mon-a", &mut tasks_to_run, true)
            .await
            .unwrap();
        assert_eq!(tasks_to_run, vec![2]);

        // B is dispatchable again and the held rows are gone.
        let row = store.get(TASKS_TABLE, &Key::hash(2)).await.unwrap().unwrap();
        assert_eq!(row.get("mid"), Some(&AttrValue::from(MONITOR_ID_QUEUED)));
        assert!(held_lock(&store, "L").await.is_none());
        assert!(held_lock(&store, &prereq_barrier(1)).await.is_none());
    }

    #[tokio::test]
    async fn terminal_prerequisite_does_not_block() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);
        put_task(&store, &TaskData {
            task_id: 1,
            entity_type: "echo".to_string(),
            entity_id: "e1".to_string(),
            task_state: TaskState::Success,
            ..TaskData::default()
        })
        .await;

        let mut task_c = task(3, "mon-c", TaskState::Running);
        task_c.prerequisite_task_ids = BTreeSet::from([1]);
        put_task(&store, &task_c).await;
        assert!(locks.check_prerequisites(&mut task_c).await.unwrap());
    }

    #[tokio::test]
    async fn live_prerequisite_blocks_with_a_waiter_entry() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);
        put_task(&store, &task(1, MONITOR_ID_QUEUED, TaskState::Queued)).await;

        let mut task_c = task(3, "mon-c", TaskState::Running);
        task_c.prerequisite_task_ids = BTreeSet::from([1]);
        put_task(&store, &task_c).await;
        assert!(!locks.check_prerequisites(&mut task_c).await.unwrap());
        assert_eq!(task_c.task_state, TaskState::WaitingForPrerequisite);

        let waiter = store
            .get(LOCKS_TABLE, &Key::with_range(prereq_barrier(1), sort_key(3)))
            .await
            .unwrap();
        assert!(waiter.is_some());
    }

    #[tokio::test]
    async fn any_prerequisite_unblocks_on_first_terminal() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);
        put_task(&store, &task(1, MONITOR_ID_QUEUED, TaskState::Queued)).await;
        put_task(&store, &TaskData {
            task_id: 2,
            entity_type: "echo".to_string(),
            entity_id: "e2".to_string(),
            task_state: TaskState::Success,
            ..TaskData::default()
        })
        .await;

        let mut task_c = task(3, "mon-c", TaskState::Running);
        task_c.prerequisite_task_ids = BTreeSet::from([1, 2]);
        task_c.any_prerequisite = true;
        put_task(&store, &task_c).await;
        assert!(locks.check_prerequisites(&mut task_c).await.unwrap());

        // No waiter cruft survives the pass.
        let waiter = store
            .get(LOCKS_TABLE, &Key::with_range(prereq_barrier(1), sort_key(3)))
            .await
            .unwrap();
        assert!(waiter.is_none());
    }

    #[tokio::test]
    async fn reentrant_acquire_after_recovery() {
        let store = store().await;
        let locks = Locks::new(store.clone(), 5);
        let mut task_a = task(1, "mon-a", TaskState::Running);
        put_task(&store, &task_a).await;
        let mut first = Vec::new();
        assert!(locks.acquire(&mut task_a, &mut first, "mon-a").await.unwrap());

        // The same task re-acquires under a new monitor after recovery.
        let mut second = Vec::new();
        assert!(locks.acquire(&mut task_a, &mut second, "mon-b").await.unwrap());
        let held = held_lock(&store, &prereq_barrier(1)).await.unwrap();
        assert_eq!(held.get("mid"), Some(&AttrValue::from("mon-b")));
    }
}

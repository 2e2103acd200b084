use std::collections::HashMap;

use crate::error::StoreError;
use crate::lock::LockData;
use crate::store::{AttrValue, IndexSchema, Row, TableSchema};
use crate::task::{TaskData, TaskState};

pub const TASKS_TABLE: &str = "monitor-tasks";
pub const LOCKS_TABLE: &str = "monitor-locks";
pub const SEQUENCES_TABLE: &str = "sequences";

/// Range key of a held-lock row; waiter rows carry `sort_key(taskId)`.
pub const TASK_ID_NONE: &str = "#";
/// `monitorId` sentinel of a dispatchable task.
pub const MONITOR_ID_QUEUED: &str = "#";
/// `monitorId` sentinel of a task blocked on locks or prerequisites.
pub const MONITOR_ID_WAITING: &str = "$";

pub const SORT_KEY_LEN: usize = 16;

/// Fixed-width, lexicographically sortable encoding of a signed 64-bit
/// integer: flip the sign bit and print 16 hex digits.
pub fn sort_key(value: i64) -> String {
    format!("{:016x}", (value as u64) ^ (1u64 << 63))
}

pub fn sort_key_to_i64(key: &str) -> Option<i64> {
    if key.len() != SORT_KEY_LEN {
        return None;
    }
    u64::from_str_radix(key, 16)
        .ok()
        .map(|value| (value ^ (1u64 << 63)) as i64)
}

/// Compound entity-range key: entity-scoped queries sort by task id.
pub fn to_eid(entity_id: &str, task_id: i64) -> String {
    format!("{}@{}", entity_id, sort_key(task_id))
}

pub fn from_eid(eid: &str) -> Option<&str> {
    if eid.len() < SORT_KEY_LEN + 1 {
        return None;
    }
    Some(&eid[..eid.len() - SORT_KEY_LEN - 1])
}

pub fn state_to_letter(state: TaskState) -> &'static str {
    match state {
        TaskState::Queued => "Q",
        TaskState::Running => "R",
        TaskState::WaitingForInterval => "T",
        TaskState::WaitingForPrerequisite => "N",
        TaskState::WaitingForLock => "L",
        TaskState::Failed => "F",
        TaskState::Success => "S",
        TaskState::Canceled => "C",
    }
}

pub fn letter_to_state(letter: &str) -> Option<TaskState> {
    match letter {
        "Q" => Some(TaskState::Queued),
        "R" => Some(TaskState::Running),
        "T" => Some(TaskState::WaitingForInterval),
        "N" => Some(TaskState::WaitingForPrerequisite),
        "L" => Some(TaskState::WaitingForLock),
        "F" => Some(TaskState::Failed),
        "S" => Some(TaskState::Success),
        "C" => Some(TaskState::Canceled),
        _ => None,
    }
}

pub fn task_table_schema() -> TableSchema {
    TableSchema {
        name: TASKS_TABLE,
        hash_attr: "id",
        range_attr: None,
        indices: vec![
            // Query on monitor ids, or the "special" sentinels:
            //    '#' - runnable
            //    '$' - waiting on lock/prerequisite
            IndexSchema {
                name: "mid-id-index",
                hash_attr: "mid",
                range_attr: Some("id"),
            },
            IndexSchema {
                name: "ety-eid-index",
                hash_attr: "ety",
                range_attr: Some("eid"),
            },
            // Same as above, but only non-terminal tasks appear:
            IndexSchema {
                name: "ntty-ntid-index",
                hash_attr: "ntty",
                range_attr: Some("ntid"),
            },
        ],
    }
}

pub fn lock_table_schema() -> TableSchema {
    TableSchema {
        name: LOCKS_TABLE,
        // Rows are either held locks (tid = TASK_ID_NONE) or waiter
        // entries (tid = sort_key(waiting task id)).
        hash_attr: "lid",
        range_attr: Some("tid"),
        indices: vec![IndexSchema {
            name: "mid-index",
            hash_attr: "mid",
            range_attr: None,
        }],
    }
}

pub fn sequence_table_schema() -> TableSchema {
    TableSchema {
        name: SEQUENCES_TABLE,
        hash_attr: "SKey",
        range_attr: None,
        indices: Vec::new(),
    }
}

/// Encodes a task into its stored attribute row.
///
/// The non-terminal mirror attributes `ntty`/`ntid` are derived here and
/// deliberately omitted on terminal states, which removes the row from the
/// non-terminal index in the same write.
pub fn encode_task(task: &TaskData) -> Row {
    let mut row: Row = HashMap::new();
    row.insert("id".to_string(), AttrValue::Num(task.task_id));
    row.insert("ety".to_string(), AttrValue::Str(task.entity_type.clone()));
    row.insert(
        "eid".to_string(),
        AttrValue::Str(to_eid(&task.entity_id, task.task_id)),
    );
    row.insert(
        "stat".to_string(),
        AttrValue::Str(state_to_letter(task.task_state).to_string()),
    );
    if !task.task_state.is_terminal() {
        row.insert("ntty".to_string(), AttrValue::Str(task.entity_type.clone()));
        row.insert(
            "ntid".to_string(),
            AttrValue::Str(to_eid(&task.entity_id, task.task_id)),
        );
    }
    if !task.lock_ids.is_empty() {
        row.insert("lids".to_string(), AttrValue::StrSet(task.lock_ids.clone()));
    }
    if !task.prerequisite_task_ids.is_empty() {
        row.insert(
            "preq".to_string(),
            AttrValue::NumSet(task.prerequisite_task_ids.clone()),
        );
        row.insert("any".to_string(), AttrValue::Bool(task.any_prerequisite));
    }
    if let Some(monitor_id) = &task.monitor_id {
        row.insert("mid".to_string(), AttrValue::Str(monitor_id.clone()));
    }
    if let Some(update_data) = &task.update_data {
        row.insert("upd".to_string(), AttrValue::Bytes(update_data.clone()));
    }
    if let Some(checkpoint_data) = &task.checkpoint_data {
        row.insert("st8".to_string(), AttrValue::Bytes(checkpoint_data.clone()));
    }
    if let Some(error_message) = &task.error_message {
        row.insert("err".to_string(), AttrValue::Str(error_message.clone()));
    }
    if let Some(error_stack_trace) = &task.error_stack_trace {
        row.insert(
            "errT".to_string(),
            AttrValue::Str(error_stack_trace.clone()),
        );
    }
    if let Some(error_id) = &task.error_id {
        row.insert("errId".to_string(), AttrValue::Str(error_id.clone()));
    }
    if let Some(start_time) = task.start_time {
        row.insert("ts".to_string(), AttrValue::Num(start_time));
    }
    if let Some(end_time) = task.end_time {
        row.insert("tf".to_string(), AttrValue::Num(end_time));
    }
    row.insert("cnt".to_string(), AttrValue::Num(task.run_count));
    if let Some(requeues) = task.requeues {
        row.insert("agn".to_string(), AttrValue::Num(requeues));
    }
    if let Some(milliseconds_remaining) = task.milliseconds_remaining {
        row.insert("tic".to_string(), AttrValue::Num(milliseconds_remaining));
    }
    if let Some(canceled_by) = &task.canceled_by {
        row.insert("cancel".to_string(), AttrValue::Str(canceled_by.clone()));
    }
    row
}

pub fn decode_task(row: &Row) -> Result<TaskData, StoreError> {
    let task_id = row
        .get("id")
        .and_then(AttrValue::as_num)
        .ok_or_else(|| StoreError::Codec("task row is missing 'id'".to_string()))?;
    let letter = row
        .get("stat")
        .and_then(AttrValue::as_str)
        .ok_or_else(|| StoreError::Codec(format!("task_id={} is missing 'stat'", task_id)))?;
    let task_state = letter_to_state(letter)
        .ok_or_else(|| StoreError::Codec(format!("unknown task state '{}'", letter)))?;
    let entity_id = row
        .get("eid")
        .and_then(AttrValue::as_str)
        .and_then(from_eid)
        .unwrap_or_default()
        .to_string();
    Ok(TaskData {
        task_id,
        entity_type: row
            .get("ety")
            .and_then(AttrValue::as_str)
            .unwrap_or_default()
            .to_string(),
        entity_id,
        task_state,
        lock_ids: row
            .get("lids")
            .and_then(AttrValue::as_str_set)
            .cloned()
            .unwrap_or_default(),
        prerequisite_task_ids: row
            .get("preq")
            .and_then(AttrValue::as_num_set)
            .cloned()
            .unwrap_or_default(),
        any_prerequisite: row
            .get("any")
            .and_then(AttrValue::as_bool)
            .unwrap_or(false),
        monitor_id: row
            .get("mid")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
        update_data: row
            .get("upd")
            .and_then(AttrValue::as_bytes)
            .map(<[u8]>::to_vec),
        checkpoint_data: row
            .get("st8")
            .and_then(AttrValue::as_bytes)
            .map(<[u8]>::to_vec),
        error_message: row
            .get("err")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
        error_stack_trace: row
            .get("errT")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
        error_id: row
            .get("errId")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
        start_time: row.get("ts").and_then(AttrValue::as_num),
        end_time: row.get("tf").and_then(AttrValue::as_num),
        run_count: row.get("cnt").and_then(AttrValue::as_num).unwrap_or(0),
        requeues: row.get("agn").and_then(AttrValue::as_num),
        milliseconds_remaining: row.get("tic").and_then(AttrValue::as_num),
        canceled_by: row
            .get("cancel")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
    })
}

pub fn encode_lock(lock: &LockData) -> Row {
    let mut row: Row = HashMap::new();
    row.insert("lid".to_string(), AttrValue::Str(lock.lock_id.clone()));
    row.insert("tid".to_string(), AttrValue::Str(lock.task_id.clone()));
    if let Some(running_task_id) = lock.running_task_id {
        row.insert("rtid".to_string(), AttrValue::Num(running_task_id));
    }
    if let Some(monitor_id) = &lock.monitor_id {
        row.insert("mid".to_string(), AttrValue::Str(monitor_id.clone()));
    }
    if let Some(tasks_queued) = lock.tasks_queued {
        row.insert("agn".to_string(), AttrValue::Num(tasks_queued));
    }
    row
}

pub fn decode_lock(row: &Row) -> Result<LockData, StoreError> {
    Ok(LockData {
        lock_id: row
            .get("lid")
            .and_then(AttrValue::as_str)
            .ok_or_else(|| StoreError::Codec("lock row is missing 'lid'".to_string()))?
            .to_string(),
        task_id: row
            .get("tid")
            .and_then(AttrValue::as_str)
            .ok_or_else(|| StoreError::Codec("lock row is missing 'tid'".to_string()))?
            .to_string(),
        running_task_id: row.get("rtid").and_then(AttrValue::as_num),
        monitor_id: row
            .get("mid")
            .and_then(AttrValue::as_str)
            .map(str::to_string),
        tasks_queued: row.get("agn").and_then(AttrValue::as_num),
    })
}

#[cfg(test)]
mod test_codec {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn sort_keys_preserve_order() {
        let values = [i64::MIN, -17, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<String> = values.iter().map(|value| sort_key(*value)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        for value in values {
            assert_eq!(sort_key_to_i64(&sort_key(value)), Some(value));
        }
        assert_eq!(sort_key_to_i64("nonsense"), None);
    }

    #[test]
    fn state_letters_round_trip() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::WaitingForInterval,
            TaskState::WaitingForPrerequisite,
            TaskState::WaitingForLock,
            TaskState::Failed,
            TaskState::Success,
            TaskState::Canceled,
        ] {
            assert_eq!(letter_to_state(state_to_letter(state)), Some(state));
        }
        assert_eq!(letter_to_state("X"), None);
    }

    #[test]
    fn eid_round_trip() {
        let eid = to_eid("build/linux@amd64", 99);
        assert_eq!(from_eid(&eid), Some("build/linux@amd64"));
        assert_eq!(from_eid("short"), None);
    }

    fn sample_task() -> TaskData {
        TaskData {
            task_id: 7,
            entity_type: "echo".to_string(),
            entity_id: "e1".to_string(),
            task_state: TaskState::Queued,
            lock_ids: BTreeSet::from(["L".to_string()]),
            prerequisite_task_ids: BTreeSet::from([3, 5]),
            any_prerequisite: true,
            monitor_id: Some(MONITOR_ID_QUEUED.to_string()),
            update_data: Some(vec![1, 2, 3]),
            checkpoint_data: Some(vec![9]),
            error_message: None,
            error_stack_trace: None,
            error_id: None,
            start_time: Some(1_000),
            end_time: None,
            run_count: 2,
            requeues: Some(1),
            milliseconds_remaining: None,
            canceled_by: None,
        }
    }

    #[test]
    fn task_row_round_trip() {
        let task = sample_task();
        let decoded = decode_task(&encode_task(&task)).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn terminal_tasks_leave_the_non_terminal_index() {
        let mut task = sample_task();
        let row = encode_task(&task);
        assert!(row.contains_key("ntty"));
        assert!(row.contains_key("ntid"));

        task.task_state = TaskState::Success;
        let row = encode_task(&task);
        assert!(!row.contains_key("ntty"));
        assert!(!row.contains_key("ntid"));
    }

    #[test]
    fn lock_row_round_trip() {
        let lock = LockData {
            lock_id: "_TASK:0000000000000007".to_string(),
            task_id: TASK_ID_NONE.to_string(),
            running_task_id: Some(7),
            monitor_id: Some("mon-1".to_string()),
            tasks_queued: Some(4),
        };
        let decoded = decode_lock(&encode_lock(&lock)).unwrap();
        assert_eq!(decoded.lock_id, lock.lock_id);
        assert_eq!(decoded.task_id, lock.task_id);
        assert_eq!(decoded.running_task_id, lock.running_task_id);
        assert_eq!(decoded.monitor_id, lock.monitor_id);
        assert_eq!(decoded.tasks_queued, lock.tasks_queued);
    }
}

use thiserror::Error;

/// Errors surfaced by a [`crate::store::KeyValueStore`] driver.
///
/// `PreconditionFailed` is the coordination primitive of the whole system:
/// it means "someone else got there first" and callers convert it into a
/// local decision (retry, give up, rewrite state). Drivers must never
/// report a connection problem as a failed precondition.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write predicate evaluated to false.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The store could not be reached or the request failed in transit.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store aborted the operation mid-flight.
    #[error("store operation aborted")]
    Interrupted,

    /// A stored row could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Errors surfaced by the task queue itself.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A synchronous caller error: missing required field, unregistered
    /// handler, and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `delete_task` was called on a task currently locked by a monitor.
    #[error("task_id={0} is currently locked")]
    TaskLocked(i64),

    /// A `mid = me` guard failed during a run. Fatal to the current
    /// monitor context: the caller fails the heartbeat so peers recover
    /// every lock this monitor holds.
    #[error("lost lock: {0}")]
    LostLock(String),

    /// The monitor contract refused to dispatch further work.
    #[error("monitor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

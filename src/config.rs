/// Tuning knobs for the task queue.
///
/// The defaults are the values the system was designed around; production
/// deployments normally keep them and only tests shrink the intervals.
///
/// # Fields
///
/// - `poll_interval_ms`: How often the background sweep scans for queued tasks. Also paces claim attempts together with `max_tasks_in_interval`.
/// - `max_tasks_in_interval`: At most this many claim attempts are made per `poll_interval_ms`.
/// - `cleanup_intervals`: The deep-cleanup pass runs every this-many sweep ticks.
/// - `max_backoff_ms`: Upper bound of the random sleep before lock acquire/release retries.
/// - `pool_size`: Worker thread pool size; claim concurrency is capped at `pool_size - 1` (at least 1, at most 10).
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub poll_interval_ms: u64,
    pub max_tasks_in_interval: u32,
    pub cleanup_intervals: u32,
    pub max_backoff_ms: u64,
    pub pool_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_tasks_in_interval: 10,
            cleanup_intervals: 30,
            max_backoff_ms: 500,
            pool_size: 4,
        }
    }
}

impl TaskQueueConfig {
    /// Number of concurrently running claim attempts.
    pub(crate) fn max_capacity(&self) -> usize {
        self.pool_size.saturating_sub(1).clamp(1, 10)
    }

    /// Minimum spacing between two claim attempts.
    pub(crate) fn dispatch_gap_ms(&self) -> u64 {
        self.poll_interval_ms / u64::from(self.max_tasks_in_interval.max(1))
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn default_capacity_is_pool_minus_one() {
        let config = TaskQueueConfig::default();
        assert_eq!(config.max_capacity(), 3);
        assert_eq!(config.dispatch_gap_ms(), 1_000);
    }

    #[test]
    fn capacity_is_clamped() {
        let mut config = TaskQueueConfig::default();
        config.pool_size = 1;
        assert_eq!(config.max_capacity(), 1);
        config.pool_size = 64;
        assert_eq!(config.max_capacity(), 10);
    }
}

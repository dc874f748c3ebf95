//! Per-job timing statistics gathered by workers.

use std::time::Duration;

/// Timing data for a single job run. The completer treats this as an opaque
/// payload attached to a state transition and hands it back to subscribers
/// alongside the updated job row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatistics {
    /// Time spent persisting the job's terminal state.
    pub complete_duration: Duration,
    /// Time the job spent waiting in the queue before being worked.
    pub queue_wait_duration: Duration,
    /// Time spent executing the job itself.
    pub run_duration: Duration,
}

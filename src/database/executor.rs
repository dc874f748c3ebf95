//! Executor abstraction over the queue's SQL surface.
//!
//! The completer funnels every persistence operation through
//! [`Executor::job_set_state_if_running_many`]; the remaining operations are
//! the minimal producer/observer surface used by the worker pool and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::database::models::{JobRow, JobState};

/// The intent to move one job out of the `running` state.
///
/// Transitions are built through the constructors below, which encode which
/// fields each target state requires. The update itself is predicated on
/// `state = 'running'` in SQL, so a transition for a job that has already
/// left `running` is a no-op.
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub id: i64,
    /// Target state.
    pub state: JobState,
    /// Set for finalized states (`completed`, `cancelled`, `discarded`).
    pub finalized_at: Option<DateTime<Utc>>,
    /// Opaque error payload appended to the job's `errors` array.
    pub error: Option<serde_json::Value>,
    /// Next attempt time for states returning the job to the pool.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Replacement `max_attempts`, used by the snoozed variants so a snooze
    /// does not consume the retry budget.
    pub max_attempts: Option<i32>,
}

impl JobTransition {
    /// Job finished successfully.
    pub fn completed(id: i64, finalized_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Completed,
            finalized_at: Some(finalized_at),
            error: None,
            scheduled_at: None,
            max_attempts: None,
        }
    }

    /// Job was cancelled mid-run.
    pub fn cancelled(id: i64, finalized_at: DateTime<Utc>, error: serde_json::Value) -> Self {
        Self {
            id,
            state: JobState::Cancelled,
            finalized_at: Some(finalized_at),
            error: Some(error),
            scheduled_at: None,
            max_attempts: None,
        }
    }

    /// Job failed permanently.
    pub fn discarded(id: i64, finalized_at: DateTime<Utc>, error: serde_json::Value) -> Self {
        Self {
            id,
            state: JobState::Discarded,
            finalized_at: Some(finalized_at),
            error: Some(error),
            scheduled_at: None,
            max_attempts: None,
        }
    }

    /// Job errored but its next attempt is due immediately.
    pub fn error_available(id: i64, scheduled_at: DateTime<Utc>, error: serde_json::Value) -> Self {
        Self {
            id,
            state: JobState::Available,
            finalized_at: None,
            error: Some(error),
            scheduled_at: Some(scheduled_at),
            max_attempts: None,
        }
    }

    /// Job errored and will be retried at `scheduled_at`.
    pub fn error_retryable(id: i64, scheduled_at: DateTime<Utc>, error: serde_json::Value) -> Self {
        Self {
            id,
            state: JobState::Retryable,
            finalized_at: None,
            error: Some(error),
            scheduled_at: Some(scheduled_at),
            max_attempts: None,
        }
    }

    /// Job asked to be re-run at `scheduled_at` without counting an attempt.
    /// `max_attempts` is the bumped replacement value (typically current + 1).
    pub fn snoozed(id: i64, scheduled_at: DateTime<Utc>, max_attempts: i32) -> Self {
        Self {
            id,
            state: JobState::Scheduled,
            finalized_at: None,
            error: None,
            scheduled_at: Some(scheduled_at),
            max_attempts: Some(max_attempts),
        }
    }

    /// Like [`JobTransition::snoozed`], but the snooze period has already
    /// elapsed so the job goes straight back to `available`.
    pub fn snoozed_available(id: i64, scheduled_at: DateTime<Utc>, max_attempts: i32) -> Self {
        Self {
            id,
            state: JobState::Available,
            finalized_at: None,
            error: None,
            scheduled_at: Some(scheduled_at),
            max_attempts: Some(max_attempts),
        }
    }

    /// Whether the target state is one where a cancellation requested during
    /// the run (a `cancel_attempted_at` metadata marker) takes precedence.
    pub fn cancel_eligible(&self) -> bool {
        matches!(self.state, JobState::Retryable | JobState::Scheduled)
    }
}

/// Parameters for inserting a new job.
#[derive(Debug, Clone)]
pub struct JobInsertParams {
    pub args: String,
    pub kind: String,
    pub max_attempts: i32,
    pub metadata: String,
    pub priority: i32,
    pub queue: String,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    pub tags: Option<String>,
    pub unique_key: Option<Vec<u8>>,
}

impl JobInsertParams {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            args: "{}".to_string(),
            kind: kind.into(),
            max_attempts: 25,
            metadata: "{}".to_string(),
            priority: 1,
            queue: "default".to_string(),
            state: JobState::Available,
            scheduled_at: Utc::now(),
            tags: None,
            unique_key: None,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// The queue's SQL surface.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Apply a batch of state transitions, each predicated on the job still
    /// being `running`. Jobs no longer running are skipped and omitted from
    /// the result. Returns the updated rows in input order.
    async fn job_set_state_if_running_many(
        &self,
        transitions: &[JobTransition],
    ) -> Result<Vec<JobRow>>;

    /// Insert many jobs, returning the created rows in input order.
    async fn job_insert_many(&self, params: &[JobInsertParams]) -> Result<Vec<JobRow>>;

    /// Fetch a single job by id.
    async fn job_get_by_id(&self, id: i64) -> Result<Option<JobRow>>;

    /// Count jobs currently in `state`.
    async fn job_count_by_state(&self, state: JobState) -> Result<i64>;
}

//! Job row model and state enumeration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job lifecycle states.
///
/// `completed`, `cancelled`, and `discarded` are finalized resting states.
/// `available`, `retryable`, and `scheduled` return the job to the ready
/// pool for another attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
    /// Job is ready to be claimed by a worker.
    Available,
    /// Job was cancelled and will not run again.
    Cancelled,
    /// Job finished successfully.
    Completed,
    /// Job failed permanently (retries exhausted or non-retryable error).
    Discarded,
    /// Job is waiting on external dependencies before becoming available.
    Pending,
    /// Job errored and is awaiting its next scheduled attempt.
    Retryable,
    /// Job is currently being worked.
    Running,
    /// Job is scheduled to become available at `scheduled_at`.
    Scheduled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
            Self::Pending => "pending",
            Self::Retryable => "retryable",
            Self::Running => "running",
            Self::Scheduled => "scheduled",
        }
    }

    /// Whether a job in this state will never be worked again.
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Discarded)
    }
}

/// A single errored attempt, appended to a job's `errors` array.
///
/// Workers serialize this shape; the queue itself treats the payload as an
/// opaque JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptError {
    /// When the attempt errored.
    pub at: DateTime<Utc>,
    /// Which attempt number errored.
    pub attempt: i32,
    /// The error message.
    pub error: String,
    /// Optional stack trace or backtrace text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// A full job row as stored in the `jobs` table.
///
/// JSON-typed columns (`args`, `attempted_by`, `errors`, `metadata`, `tags`)
/// are carried as raw text; callers decode the pieces they care about.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRow {
    pub id: i64,
    /// Encoded job arguments (JSON object).
    pub args: String,
    pub attempt: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    /// JSON array of worker/client identifiers that attempted this job.
    pub attempted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// JSON array of [`AttemptError`] entries, one per errored attempt.
    pub errors: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub kind: String,
    pub max_attempts: i32,
    /// JSON object of auxiliary metadata. A `cancel_attempted_at` key marks a
    /// cancellation requested while the job was running.
    pub metadata: String,
    pub priority: i32,
    pub queue: String,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    /// JSON array of tags.
    pub tags: Option<String>,
    pub unique_key: Option<Vec<u8>>,
}

impl JobRow {
    /// Decode the `errors` column.
    pub fn attempt_errors(&self) -> crate::Result<Vec<AttemptError>> {
        match &self.errors {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Vec::new()),
        }
    }
}

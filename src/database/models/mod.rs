//! Database row models.

pub mod job;

pub use job::{AttemptError, JobRow, JobState};

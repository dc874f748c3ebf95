//! brookq: a persistent background job queue for SQLite.
//!
//! The completer subsystem durably applies terminal state transitions
//! emitted by job workers and fans successful updates out to in-process
//! subscribers.

pub mod completer;
pub mod database;
pub mod error;
pub mod stats;

pub use completer::{
    AsyncCompleter, AsyncCompleterConfig, BatchCompleter, BatchCompleterConfig, InlineCompleter,
    JobCompleter, JobUpdate, SubscribeChan,
};
pub use database::{Executor, JobInsertParams, JobRow, JobState, JobTransition, SqliteExecutor};
pub use error::{Error, Result};
pub use stats::JobStatistics;

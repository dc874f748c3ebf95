//! Shared helpers for integration tests: in-memory database setup, job
//! factories, and executor doubles that wrap the real SQLite executor.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use brookq::database::executor::{Executor, JobInsertParams, JobTransition};
use brookq::database::{init_pool_with_size, run_migrations};
use brookq::{Error, JobRow, JobState, JobUpdate, Result, SqliteExecutor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One-connection in-memory database with migrations applied. A single
/// connection keeps every query on the same memory database.
pub async fn setup_executor() -> SqliteExecutor {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("failed to create test pool");
    run_migrations(&pool).await.expect("failed to run migrations");
    SqliteExecutor::from_pool(pool)
}

pub async fn insert_running_job(exec: &SqliteExecutor) -> JobRow {
    insert_job(exec, JobInsertParams::new("test_kind").with_state(JobState::Running)).await
}

pub async fn insert_job(exec: &SqliteExecutor, params: JobInsertParams) -> JobRow {
    exec.job_insert_many(std::slice::from_ref(&params))
        .await
        .expect("failed to insert job")
        .into_iter()
        .next()
        .expect("insert returned no row")
}

pub async fn require_job_state(exec: &SqliteExecutor, id: i64, state: JobState) -> JobRow {
    let job = exec
        .job_get_by_id(id)
        .await
        .expect("failed to fetch job")
        .expect("job not found");
    assert_eq!(job.state, state, "job {id} in unexpected state");
    job
}

/// Collect every update until the subscribe channel closes.
pub async fn collect_updates(mut rx: mpsc::Receiver<Vec<JobUpdate>>) -> Vec<JobUpdate> {
    let mut all = Vec::new();
    while let Some(updates) = rx.recv().await {
        assert!(!updates.is_empty(), "empty subscriber message");
        all.extend(updates);
    }
    all
}

/// Drain the subscribe channel from a background task, returning the total
/// number of updates seen once the channel closes.
pub fn drain_continuously(mut rx: mpsc::Receiver<Vec<JobUpdate>>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut total = 0;
        while let Some(updates) = rx.recv().await {
            total += updates.len();
        }
        total
    })
}

/// Wraps the real executor, failing the first `failures` set-state calls
/// with a transient error before delegating.
pub struct FlakyExecutor {
    inner: SqliteExecutor,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyExecutor {
    pub fn new(inner: SqliteExecutor, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn job_set_state_if_running_many(
        &self,
        transitions: &[JobTransition],
    ) -> Result<Vec<JobRow>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::Database(format!("error from executor {n}")));
        }
        self.inner.job_set_state_if_running_many(transitions).await
    }

    async fn job_insert_many(&self, params: &[JobInsertParams]) -> Result<Vec<JobRow>> {
        self.inner.job_insert_many(params).await
    }

    async fn job_get_by_id(&self, id: i64) -> Result<Option<JobRow>> {
        self.inner.job_get_by_id(id).await
    }

    async fn job_count_by_state(&self, state: JobState) -> Result<i64> {
        self.inner.job_count_by_state(state).await
    }
}

/// Which terminal failure a [`TerminalExecutor`] produces.
#[derive(Debug, Clone, Copy)]
pub enum TerminalKind {
    Canceled,
    PoolClosed,
}

impl TerminalKind {
    fn to_error(self) -> Error {
        match self {
            Self::Canceled => Error::Canceled,
            Self::PoolClosed => Error::DatabaseSqlx(sqlx::Error::PoolClosed),
        }
    }
}

/// Wraps the real executor but fails every set-state call with a terminal
/// error, leaving the underlying jobs untouched.
pub struct TerminalExecutor {
    inner: SqliteExecutor,
    kind: TerminalKind,
    calls: AtomicUsize,
}

impl TerminalExecutor {
    pub fn new(inner: SqliteExecutor, kind: TerminalKind) -> Arc<Self> {
        Arc::new(Self {
            inner,
            kind,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for TerminalExecutor {
    async fn job_set_state_if_running_many(
        &self,
        _transitions: &[JobTransition],
    ) -> Result<Vec<JobRow>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.kind.to_error())
    }

    async fn job_insert_many(&self, params: &[JobInsertParams]) -> Result<Vec<JobRow>> {
        self.inner.job_insert_many(params).await
    }

    async fn job_get_by_id(&self, id: i64) -> Result<Option<JobRow>> {
        self.inner.job_get_by_id(id).await
    }

    async fn job_count_by_state(&self, state: JobState) -> Result<i64> {
        self.inner.job_count_by_state(state).await
    }
}

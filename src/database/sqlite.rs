//! SQLite implementation of the [`Executor`] trait.

use async_trait::async_trait;
use chrono::Utc;

use crate::database::executor::{Executor, JobInsertParams, JobTransition};
use crate::database::models::{JobRow, JobState};
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// One conditional update per transition, predicated on the job still being
/// in `running`. A cancellation requested mid-run (`cancel_attempted_at` in
/// metadata) overrides transitions that would return the job to the pool.
/// SET expressions see the pre-update row, so `metadata` here is the state
/// the worker saw.
const JOB_SET_STATE_IF_RUNNING: &str = r#"
UPDATE jobs SET
    state = CASE
        WHEN ?3 AND json_extract(metadata, '$.cancel_attempted_at') IS NOT NULL THEN 'cancelled'
        ELSE ?2
    END,
    finalized_at = CASE
        WHEN ?3 AND json_extract(metadata, '$.cancel_attempted_at') IS NOT NULL THEN ?4
        WHEN ?5 IS NOT NULL THEN ?5
        ELSE finalized_at
    END,
    errors = CASE
        WHEN ?6 IS NOT NULL THEN json_insert(COALESCE(errors, '[]'), '$[#]', json(?6))
        ELSE errors
    END,
    max_attempts = CASE
        WHEN ?7 IS NOT NULL
            AND NOT (?3 AND json_extract(metadata, '$.cancel_attempted_at') IS NOT NULL) THEN ?7
        ELSE max_attempts
    END,
    scheduled_at = CASE
        WHEN ?8 IS NOT NULL
            AND NOT (?3 AND json_extract(metadata, '$.cancel_attempted_at') IS NOT NULL) THEN ?8
        ELSE scheduled_at
    END,
    unique_key = CASE
        WHEN ?2 IN ('cancelled', 'discarded')
            OR (?3 AND json_extract(metadata, '$.cancel_attempted_at') IS NOT NULL) THEN NULL
        ELSE unique_key
    END
WHERE id = ?1 AND state = 'running'
RETURNING id, args, attempt, attempted_at, attempted_by, created_at, errors,
    finalized_at, kind, max_attempts, metadata, priority, queue, state,
    scheduled_at, tags, unique_key
"#;

const JOB_INSERT: &str = r#"
INSERT INTO jobs (
    args, attempt, created_at, kind, max_attempts, metadata, priority, queue,
    state, scheduled_at, tags, unique_key
)
VALUES (?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
RETURNING id, args, attempt, attempted_at, attempted_by, created_at, errors,
    finalized_at, kind, max_attempts, metadata, priority, queue, state,
    scheduled_at, tags, unique_key
"#;

/// SQLx-backed executor.
///
/// Reads go through `pool`; every batched state update runs inside a single
/// `BEGIN IMMEDIATE` transaction on `write_pool`.
#[derive(Clone)]
pub struct SqliteExecutor {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqliteExecutor {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    /// Build an executor that uses one pool for both reads and writes.
    /// Intended for tests and single-connection deployments.
    pub fn from_pool(pool: DbPool) -> Self {
        Self {
            write_pool: pool.clone(),
            pool,
        }
    }

    /// The read pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn job_set_state_if_running_many(
        &self,
        transitions: &[JobTransition],
    ) -> Result<Vec<JobRow>> {
        if transitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = begin_immediate(&self.write_pool).await?;
        let mut updated = Vec::with_capacity(transitions.len());

        for transition in transitions {
            let error_json = transition
                .error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let row: Option<JobRow> = sqlx::query_as(JOB_SET_STATE_IF_RUNNING)
                .bind(transition.id)
                .bind(transition.state)
                .bind(transition.cancel_eligible())
                .bind(Utc::now())
                .bind(transition.finalized_at)
                .bind(error_json)
                .bind(transition.max_attempts)
                .bind(transition.scheduled_at)
                .fetch_optional(&mut *tx)
                .await?;

            // No row means the job already left `running`; skip it.
            if let Some(row) = row {
                updated.push(row);
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn job_insert_many(&self, params: &[JobInsertParams]) -> Result<Vec<JobRow>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = begin_immediate(&self.write_pool).await?;
        let mut inserted = Vec::with_capacity(params.len());

        for param in params {
            let row: JobRow = sqlx::query_as(JOB_INSERT)
                .bind(&param.args)
                .bind(Utc::now())
                .bind(&param.kind)
                .bind(param.max_attempts)
                .bind(&param.metadata)
                .bind(param.priority)
                .bind(&param.queue)
                .bind(param.state)
                .bind(param.scheduled_at)
                .bind(&param.tags)
                .bind(&param.unique_key)
                .fetch_one(&mut *tx)
                .await?;
            inserted.push(row);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn job_get_by_id(&self, id: i64) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn job_count_by_state(&self, state: JobState) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM jobs WHERE state = ?")
            .bind(state)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

impl SqliteExecutor {
    /// Fetch a job by id, erroring if it doesn't exist.
    pub async fn job_get_by_id_required(&self, id: i64) -> Result<JobRow> {
        self.job_get_by_id(id).await?.ok_or(Error::JobNotFound(id))
    }
}

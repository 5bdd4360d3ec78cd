use crate::types::{to_millis, JobRow};
use crate::MIGRATOR;
use anyhow::Context;
use async_trait::async_trait;
use errand::core::job::{ErrorDetail, JobRecord, JobState, NewJob};
use errand::core::job_processor::JobProcessor;
use errand::core::queue::{Queue, QueueError};
use errand::core::retry::{FailureOutcome, RetryPolicy};
use errand::core::{bincode::Decode, new_xid, DateTime, Duration, Utc, Xid};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

/// An implementation of the Queue backed by SQLite.
///
/// Every state transition is a single conditional statement. SQLite runs each one under its
/// writer lock, which arbitrates between concurrent workers, including workers in other
/// processes sharing the same database file. No transaction is ever held open across an
/// `.await`, so dropping any of these futures leaves the connection clean.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
}

impl SqliteQueue {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Open (creating if needed) the database at `url` and bring its schema up to date.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool_options = if is_in_memory(url) {
            // Every connection to an in-memory database would see a database of its own.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to the database")?;
        MIGRATOR
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(Self::with_pool(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Current state and attempt count of a job, `JobNotFound` if there is no such job.
async fn current_state(pool: &SqlitePool, jid: Xid) -> Result<(JobState, u32), QueueError> {
    let row = sqlx::query("SELECT state, attempt_count FROM errand_jobs WHERE jid = ?1")
        .bind(jid.to_string())
        .fetch_optional(pool)
        .await
        .context("Failed to look up job")?
        .ok_or(QueueError::JobNotFound(jid))?;
    let state: String = row.try_get("state").context("Failed to read job state")?;
    let state = JobState::from_str(&state).context("Corrupted job state")?;
    let attempt_count: u32 = row
        .try_get("attempt_count")
        .context("Failed to read attempt count")?;
    Ok((state, attempt_count))
}

fn expect_in_flight(jid: Xid, state: JobState) -> Result<(), QueueError> {
    if state == JobState::InFlight {
        Ok(())
    } else {
        Err(QueueError::InvalidState {
            jid,
            expected: JobState::InFlight,
            actual: state,
        })
    }
}

/// Explain why a conditional update on an in-flight job matched nothing.
async fn not_in_flight(pool: &SqlitePool, jid: Xid) -> QueueError {
    match current_state(pool, jid).await {
        Ok((JobState::InFlight, _)) => QueueError::ClaimConflict(jid),
        Ok((state, _)) => QueueError::InvalidState {
            jid,
            expected: JobState::InFlight,
            actual: state,
        },
        Err(e) => e,
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[instrument(skip_all, err, fields(queue = %new_job.queue_name, job_type = %new_job.job_type, args_size = new_job.arguments.len()))]
    async fn enqueue_job(&self, new_job: NewJob) -> Result<Xid, QueueError> {
        let jid = new_xid();
        sqlx::query(
            "INSERT INTO errand_jobs (jid, queue, job_type, arguments, state, attempt_count, next_run_at_ms, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
        )
        .bind(jid.to_string())
        .bind(&new_job.queue_name)
        .bind(&new_job.job_type)
        .bind(new_job.arguments.as_ref())
        .bind(to_millis(new_job.run_at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            QueueError::EnqueueFailed(anyhow::Error::new(e).context("Failed to add job to the queue"))
        })?;
        Ok(jid)
    }

    #[instrument(skip_all, err, fields(queue = queue_name, worker = worker_token))]
    async fn claim_next_with_instant(
        &self,
        queue_name: &str,
        worker_token: &str,
        now: DateTime,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now_ms = to_millis(now);
        sqlx::query(
            "UPDATE errand_jobs SET state = 'pending' \
             WHERE queue = ?1 AND state = 'retry_scheduled' AND next_run_at_ms <= ?2",
        )
        .bind(queue_name)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to promote due retries")?;

        // Selection and checkout are one statement, so two workers can never take the same row.
        let row = sqlx::query(
            "UPDATE errand_jobs \
             SET state = 'in_flight', attempt_count = attempt_count + 1, claimed_by = ?1, claimed_at_ms = ?2 \
             WHERE state = 'pending' AND jid = ( \
                 SELECT jid FROM errand_jobs \
                 WHERE queue = ?3 AND state = 'pending' AND next_run_at_ms <= ?2 \
                 ORDER BY created_at_ms, jid LIMIT 1) \
             RETURNING *",
        )
        .bind(worker_token)
        .bind(now_ms)
        .bind(queue_name)
        .try_map(|row| JobRow::from_row(&row))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check out a job from the queue")?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), err)]
    async fn mark_done(&self, job_id: Xid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE errand_jobs SET state = 'done', claimed_by = NULL, claimed_at_ms = NULL \
             WHERE jid = ?1 AND state = 'in_flight'",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to mark job as completed")?;
        if result.rows_affected() == 0 {
            return Err(not_in_flight(&self.pool, job_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), err, fields(kind = %error.kind))]
    async fn mark_failed_with_instant(
        &self,
        job_id: Xid,
        error: ErrorDetail,
        now: DateTime,
    ) -> Result<FailureOutcome, QueueError> {
        let (state, attempt_count) = current_state(&self.pool, job_id).await?;
        expect_in_flight(job_id, state)?;
        let outcome = self.retry_policy.decide(attempt_count, now);
        let (state, next_run_at) = match outcome {
            FailureOutcome::RetryScheduled { next_run_at } => {
                (JobState::RetryScheduled, Some(to_millis(next_run_at)))
            }
            FailureOutcome::Dead => (JobState::Dead, None),
        };
        // Keyed on the attempt we just read, so a concurrent requeue or reclaim is not overwritten.
        let result = sqlx::query(
            "UPDATE errand_jobs \
             SET state = ?1, next_run_at_ms = COALESCE(?2, next_run_at_ms), \
                 last_error_kind = ?3, last_error_message = ?4, claimed_by = NULL, claimed_at_ms = NULL \
             WHERE jid = ?5 AND state = 'in_flight' AND attempt_count = ?6",
        )
        .bind(state.as_str())
        .bind(next_run_at)
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(job_id.to_string())
        .bind(attempt_count)
        .execute(&self.pool)
        .await
        .context("Failed to mark job as failed")?;
        if result.rows_affected() == 0 {
            return Err(not_in_flight(&self.pool, job_id).await);
        }
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale_inflight_with_instant(
        &self,
        max_age: Duration,
        now: DateTime,
    ) -> Result<u64, QueueError> {
        let cutoff = to_millis(now - max_age);
        let result = sqlx::query(
            "UPDATE errand_jobs \
             SET state = 'pending', next_run_at_ms = ?1, claimed_by = NULL, claimed_at_ms = NULL \
             WHERE state = 'in_flight' AND (claimed_at_ms IS NULL OR claimed_at_ms < ?2)",
        )
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to requeue stale jobs")?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn cancel_job(&self, job_id: Xid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM errand_jobs WHERE jid = ?1 AND state IN ('pending', 'retry_scheduled')",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to remove job from the queue")?;

        if result.rows_affected() == 0 {
            Err(QueueError::JobNotFound(job_id))
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self), err, fields(job_type = J::name()))]
    async fn unschedule_job<J>(&self, job_id: Xid) -> Result<J::Payload, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode<()>,
    {
        let jid_string = job_id.to_string();
        let arguments: Vec<u8> = sqlx::query(
            "SELECT arguments FROM errand_jobs \
             WHERE jid = ?1 AND job_type = ?2 AND state IN ('pending', 'retry_scheduled')",
        )
        .bind(&jid_string)
        .bind(J::name())
        .try_map(|row: sqlx::sqlite::SqliteRow| row.try_get("arguments"))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up job")?
        .ok_or(QueueError::JobNotFound(job_id))?;
        // Decode first: a payload that does not decode stays in the queue.
        let (payload, _) =
            bincode::decode_from_slice(&arguments, bincode::config::standard())?;

        let result = sqlx::query(
            "DELETE FROM errand_jobs \
             WHERE jid = ?1 AND job_type = ?2 AND state IN ('pending', 'retry_scheduled')",
        )
        .bind(&jid_string)
        .bind(J::name())
        .execute(&self.pool)
        .await
        .context("Failed to remove job from the queue")?;
        if result.rows_affected() == 0 {
            // Claimed between the read and the delete.
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(payload)
    }

    async fn get_job(&self, job_id: Xid) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query("SELECT * FROM errand_jobs WHERE jid = ?1")
            .bind(job_id.to_string())
            .try_map(|row| JobRow::from_row(&row))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;
        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        queue_name: &str,
        state: JobState,
        limit: u32,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM errand_jobs WHERE queue = ?1 AND state = ?2 \
             ORDER BY created_at_ms, jid LIMIT ?3",
        )
        .bind(queue_name)
        .bind(state.as_str())
        .bind(limit)
        .try_map(|row| JobRow::from_row(&row))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list jobs")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

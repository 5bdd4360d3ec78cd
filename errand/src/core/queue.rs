use async_trait::async_trait;
use bincode::{Decode, Encode};
use chrono::Utc;
use thiserror::Error;

use crate::core::job::{ErrorDetail, JobRecord, JobState, NewJob};
use crate::core::job_processor::JobProcessor;
use crate::core::retry::{FailureOutcome, RetryPolicy};
use crate::core::{DateTime, Duration, Xid};

/// An interface to the durable queue store. Responsible for persisting jobs and for every state
/// transition a job goes through.
///
/// ### Claims
///
/// `claim_next` must be atomic: two concurrent callers never receive the same record. Records
/// are handed out in FIFO order of `created_at` within a queue, ties broken by id.
///
/// ### Time
///
/// Every time-dependent operation has a `*_with_instant` variant that takes the current time.
/// Implementations only need to provide those; the plain variants pass `Utc::now()`.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Policy applied by `mark_failed`.
    fn retry_policy(&self) -> RetryPolicy;

    /// The same store with failed attempts judged by `retry_policy`.
    fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self
    where
        Self: Sized;

    /// Durably persist a new `Pending` record.
    async fn enqueue_job(&self, new_job: NewJob) -> Result<Xid, QueueError>;

    /// Schedule a typed job on the given queue to run at the future time.
    async fn enqueue_at<J>(
        &self,
        queue_name: &str,
        payload: J::Payload,
        run_at: DateTime,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let arguments = bincode::encode_to_vec(&payload, bincode::config::standard())?;
        let new_job = NewJob::new(queue_name, J::name(), arguments).run_at(run_at);
        self.enqueue_job(new_job).await
    }

    /// Schedule a typed job to run next. Depending on queue backlog this may start running later than you expect.
    async fn enqueue<J>(&self, queue_name: &str, payload: J::Payload) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        self.enqueue_at::<J>(queue_name, payload, Utc::now()).await
    }

    /// Schedule a typed job to run at the future time relative to now.
    async fn enqueue_in<J>(
        &self,
        queue_name: &str,
        payload: J::Payload,
        delay: Duration,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let when = Utc::now() + delay;
        self.enqueue_at::<J>(queue_name, payload, when).await
    }

    /// Claim the oldest eligible record of `queue_name`. Implementation should not wait for the
    /// next job, if there is nothing return `Ok(None)`.
    async fn claim_next_with_instant(
        &self,
        queue_name: &str,
        worker_token: &str,
        now: DateTime,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// Claim the oldest eligible record of `queue_name`, if there is nothing return `Ok(None)`.
    async fn claim_next(
        &self,
        queue_name: &str,
        worker_token: &str,
    ) -> Result<Option<JobRecord>, QueueError> {
        self.claim_next_with_instant(queue_name, worker_token, Utc::now())
            .await
    }

    /// Transition an `InFlight` record to `Done`.
    async fn mark_done(&self, job_id: Xid) -> Result<(), QueueError>;

    /// Record a failed attempt and let the retry policy decide what happens next.
    async fn mark_failed_with_instant(
        &self,
        job_id: Xid,
        error: ErrorDetail,
        now: DateTime,
    ) -> Result<FailureOutcome, QueueError>;

    /// Record a failed attempt and let the retry policy decide what happens next.
    async fn mark_failed(
        &self,
        job_id: Xid,
        error: ErrorDetail,
    ) -> Result<FailureOutcome, QueueError> {
        self.mark_failed_with_instant(job_id, error, Utc::now())
            .await
    }

    /// Reset `InFlight` records claimed more than `max_age` before `now` back to `Pending`.
    /// `attempt_count` is left untouched. Returns how many records were reset.
    async fn requeue_stale_inflight_with_instant(
        &self,
        max_age: Duration,
        now: DateTime,
    ) -> Result<u64, QueueError>;

    /// Reset `InFlight` records whose claim is older than `max_age` back to `Pending`.
    async fn requeue_stale_inflight(&self, max_age: Duration) -> Result<u64, QueueError> {
        self.requeue_stale_inflight_with_instant(max_age, Utc::now())
            .await
    }

    /// Cancel job that has been scheduled. This will only cancel if the job isn't running and
    /// hasn't finished.
    async fn cancel_job(&self, job_id: Xid) -> Result<(), QueueError>;

    /// The same as [`cancel_job`](Queue::cancel_job), but returns payload of canceled job.
    /// If deserialization fails, then job won't be cancelled.
    async fn unschedule_job<J>(&self, job_id: Xid) -> Result<J::Payload, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode<()>;

    /// Fetch a single record, whatever its state.
    async fn get_job(&self, job_id: Xid) -> Result<Option<JobRecord>, QueueError>;

    /// List records of a queue in a given state, oldest first.
    async fn list_jobs(
        &self,
        queue_name: &str,
        state: JobState,
        limit: u32,
    ) -> Result<Vec<JobRecord>, QueueError>;
}

/// Errors related to queue operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Encountered an error when tried to serialize job arguments.
    #[error("Failed to serialize job arguments")]
    EncodeError {
        #[from]
        source: bincode::error::EncodeError,
    },
    /// Encountered an error when tried to deserialize job arguments.
    #[error("Failed to deserialize job arguments")]
    DecodeError {
        #[from]
        source: bincode::error::DecodeError,
    },
    #[error("Interval must be greater than zero: {0:?}")]
    InvalidInterval(Duration),
    /// The store could not persist the job; it was not created.
    #[error("Failed to enqueue job")]
    EnqueueFailed(#[source] anyhow::Error),
    #[error("Job by that ID does not exist: {0}")]
    JobNotFound(Xid),
    #[error("Job {jid} is {actual}, expected {expected}")]
    InvalidState {
        jid: Xid,
        expected: JobState,
        actual: JobState,
    },
    /// Another worker took the record between selection and update. Callers retry the claim.
    #[error("Lost the race to claim job {0}")]
    ClaimConflict(Xid),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

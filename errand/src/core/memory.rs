use crate::core::job::{ErrorDetail, JobRecord, JobState, NewJob};
use crate::core::job_processor::JobProcessor;
use crate::core::queue::{Queue, QueueError};
use crate::core::retry::{FailureOutcome, RetryPolicy};
use crate::core::{new_xid, DateTime, Duration, Utc, Xid};
use async_trait::async_trait;
use bincode::Decode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Queue kept in process memory. Nothing survives a restart, so this is meant for tests and
/// local development. Every transition happens under one lock, which makes claims atomic.
#[derive(Clone, Debug, Default)]
pub struct InMemoryQueue {
    jobs: Arc<Mutex<HashMap<Xid, JobRecord>>>,
    retry_policy: RetryPolicy,
}

impl InMemoryQueue {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            jobs: Default::default(),
            retry_policy,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Xid, JobRecord>>, QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Other(anyhow::anyhow!("Lock is poisoned")))
    }

    fn take_if_cancellable(&self, job_id: Xid) -> Result<JobRecord, QueueError> {
        let mut jobs = self.lock()?;
        match jobs.get(&job_id) {
            Some(job) if matches!(job.state, JobState::Pending | JobState::RetryScheduled) => {}
            _ => return Err(QueueError::JobNotFound(job_id)),
        }
        jobs.remove(&job_id).ok_or(QueueError::JobNotFound(job_id))
    }
}

fn expect_in_flight(job: &JobRecord) -> Result<(), QueueError> {
    if job.state == JobState::InFlight {
        Ok(())
    } else {
        Err(QueueError::InvalidState {
            jid: job.id,
            expected: JobState::InFlight,
            actual: job.state,
        })
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    async fn enqueue_job(&self, new_job: NewJob) -> Result<Xid, QueueError> {
        let jid = new_xid();
        let record = JobRecord::from_new_job(jid, new_job, Utc::now());
        self.lock()?.insert(jid, record);
        Ok(jid)
    }

    async fn claim_next_with_instant(
        &self,
        queue_name: &str,
        worker_token: &str,
        now: DateTime,
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut jobs = self.lock()?;
        for job in jobs.values_mut() {
            if job.queue_name == queue_name
                && job.state == JobState::RetryScheduled
                && job.next_run_at <= now
            {
                job.state = JobState::Pending;
            }
        }
        let candidate = jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.is_claimable(now))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
            })
            .map(|job| job.id);

        Ok(candidate.and_then(|jid| jobs.get_mut(&jid)).map(|job| {
            job.state = JobState::InFlight;
            job.attempt_count += 1;
            job.claimed_by = Some(worker_token.to_string());
            job.claimed_at = Some(now);
            job.clone()
        }))
    }

    async fn mark_done(&self, job_id: Xid) -> Result<(), QueueError> {
        let mut jobs = self.lock()?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        expect_in_flight(job)?;
        job.state = JobState::Done;
        job.claimed_by = None;
        job.claimed_at = None;
        Ok(())
    }

    async fn mark_failed_with_instant(
        &self,
        job_id: Xid,
        error: ErrorDetail,
        now: DateTime,
    ) -> Result<FailureOutcome, QueueError> {
        let mut jobs = self.lock()?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        expect_in_flight(job)?;
        let outcome = self.retry_policy.decide(job.attempt_count, now);
        match outcome {
            FailureOutcome::RetryScheduled { next_run_at } => {
                job.state = JobState::RetryScheduled;
                job.next_run_at = next_run_at;
            }
            FailureOutcome::Dead => job.state = JobState::Dead,
        }
        job.last_error = Some(error);
        job.claimed_by = None;
        job.claimed_at = None;
        Ok(outcome)
    }

    async fn requeue_stale_inflight_with_instant(
        &self,
        max_age: Duration,
        now: DateTime,
    ) -> Result<u64, QueueError> {
        let cutoff = now - max_age;
        let mut jobs = self.lock()?;
        let mut count = 0;
        for job in jobs.values_mut() {
            let stale = job.state == JobState::InFlight
                && job.claimed_at.map_or(true, |claimed_at| claimed_at < cutoff);
            if stale {
                job.state = JobState::Pending;
                job.next_run_at = now;
                job.claimed_by = None;
                job.claimed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_job(&self, job_id: Xid) -> Result<(), QueueError> {
        self.take_if_cancellable(job_id).map(|_| ())
    }

    async fn unschedule_job<J>(&self, job_id: Xid) -> Result<J::Payload, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode<()>,
    {
        let mut jobs = self.lock()?;
        let job = jobs
            .get(&job_id)
            .filter(|job| matches!(job.state, JobState::Pending | JobState::RetryScheduled))
            .filter(|job| job.job_type == J::name())
            .ok_or(QueueError::JobNotFound(job_id))?;
        let (payload, _) =
            bincode::decode_from_slice(job.arguments.as_ref(), bincode::config::standard())?;
        jobs.remove(&job_id);
        Ok(payload)
    }

    async fn get_job(&self, job_id: Xid) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        queue_name: &str,
        state: JobState,
        limit: u32,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let jobs = self.lock()?;
        let mut found: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.state == state)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        found.truncate(limit as usize);
        Ok(found)
    }
}

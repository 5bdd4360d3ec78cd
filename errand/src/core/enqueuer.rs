use crate::core::job::NewJob;
use crate::core::job_processor::JobProcessor;
use crate::core::queue::{Queue, QueueError};
use crate::core::{Bytes, Duration, Xid};
use bincode::Encode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::instrument;

/// Producer side of the queue. This is what a web request handler holds on to.
///
/// An enqueuer obtained from `JobRunner::enqueuer` shares a wake signal with the runner, so idle
/// worker slots in the same process pick new jobs up without waiting for the next poll.
pub struct Enqueuer<Q> {
    queue: Arc<Q>,
    wake: Arc<Notify>,
}

impl<Q> Clone for Enqueuer<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<Q> Enqueuer<Q>
where
    Q: Queue,
{
    pub fn new(queue: Arc<Q>) -> Self {
        Self::with_wake(queue, Arc::new(Notify::new()))
    }

    pub(crate) fn with_wake(queue: Arc<Q>, wake: Arc<Notify>) -> Self {
        Self { queue, wake }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Enqueue a typed job on the queue its processor names.
    pub async fn enqueue<J>(&self, payload: J::Payload) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        self.enqueue_to::<J>(J::queue(), payload, Duration::zero())
            .await
    }

    /// Enqueue a typed job on `queue_name`, eligible after `delay`.
    pub async fn enqueue_to<J>(
        &self,
        queue_name: &str,
        payload: J::Payload,
        delay: Duration,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let arguments = bincode::encode_to_vec(&payload, bincode::config::standard())?;
        self.enqueue_raw(queue_name, J::name(), arguments, delay)
            .await
    }

    /// Enqueue already encoded arguments for `job_type`.
    #[instrument(skip(self, arguments), err, fields(args_size))]
    pub async fn enqueue_raw(
        &self,
        queue_name: &str,
        job_type: &str,
        arguments: impl Into<Bytes> + Send,
        delay: Duration,
    ) -> Result<Xid, QueueError> {
        let arguments = arguments.into();
        tracing::Span::current().record("args_size", &arguments.len());
        let new_job = NewJob::new(queue_name, job_type, arguments).delayed_by(delay);
        let jid = self.queue.enqueue_job(new_job).await?;
        tracing::debug!(jid = %jid, "Job enqueued");
        if delay <= Duration::zero() {
            self.wake.notify_waiters();
        }
        Ok(jid)
    }
}

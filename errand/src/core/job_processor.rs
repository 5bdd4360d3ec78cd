use crate::core::Xid;
use async_trait::async_trait;
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Business logic for one job type.
///
/// The runner hands every claimed record whose `job_type` equals [`JobProcessor::name`] to
/// `handle`. Returning `Ok` completes the job; returning an error (or panicking) sends it through
/// the queue's retry policy. Payloads travel through the store as bincode, so to be routable they
/// must derive `Encode` and `Decode`.
///
/// ## Example
/// ```rust
/// use errand::prelude::{CancellationToken, Decode, Encode, JobProcessor, Xid};
///
/// /// Stand-in for a mail client shared by every invocation.
/// struct Outbox;
///
/// impl Outbox {
///     async fn deliver(&self, to: &str, body: &str) -> anyhow::Result<()> {
///         println!("to {}: {}", to, body);
///         Ok(())
///     }
/// }
///
/// struct SendReceipt {
///     outbox: Outbox,
/// }
///
/// #[derive(Encode, Decode)]
/// struct Receipt {
///     email: String,
///     total_cents: u64,
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for SendReceipt {
///     type Payload = Receipt;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "send_receipt"
///     }
///
///     fn queue() -> &'static str {
///         "mailers"
///     }
///
///     async fn handle(&self, _jid: Xid, receipt: Receipt, stop: CancellationToken) -> anyhow::Result<()> {
///         let body = format!("You paid {:.2}", receipt.total_cents as f64 / 100.0);
///         tokio::select! {
///             sent = self.outbox.deliver(&receipt.email, &body) => sent,
///             // Not sent yet, so let the job be retried later.
///             _ = stop.cancelled() => anyhow::bail!("stopped before delivery"),
///         }
///     }
/// }
/// ```
///
/// Dependencies such as connection pools or HTTP clients live in the processor's own fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Arguments of a single job.
    type Payload: Send;
    type Error: Send;

    /// Process one job. `cancellation_token` fires when the job timeout elapses or the runner is
    /// shutting down; a handler that stops early should return an error so the job is retried.
    async fn handle(
        &self,
        jid: Xid,
        payload: Self::Payload,
        cancellation_token: CancellationToken,
    ) -> Result<(), Self::Error>;

    /// Grace period granted after a shutdown request before the job is abandoned.
    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Job type stored with every record and used for routing.
    fn name() -> &'static str
    where
        Self: Sized;

    /// Queue used by `Enqueuer::enqueue` when none is given explicitly.
    fn queue() -> &'static str
    where
        Self: Sized,
    {
        "default"
    }
}

/// Failure of a routed job, as seen by the runner.
#[derive(Error, Debug)]
pub enum JobError {
    /// Stored arguments are not a valid payload for the job type.
    #[error("Arguments of {job_type} job could not be decoded")]
    Undecodable {
        job_type: &'static str,
        #[source]
        source: bincode::error::DecodeError,
    },

    /// The handler was still running when its shutdown grace period ran out.
    #[error("Abandoned after exceeding the shutdown timeout of {0:?}")]
    PastShutdownGrace(Duration),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl From<Infallible> for JobError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

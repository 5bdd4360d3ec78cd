use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job::{ErrorDetail, FailureKind, JobRecord};
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::queue::{Queue, QueueError};
use crate::core::retry::FailureOutcome;
use crate::core::CancellationToken;
use bincode::{Decode, Encode};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tracing::instrument;

/// Routing table from job type to processor.
///
/// Each registered processor is wrapped so it receives its typed payload decoded from the stored
/// bincode arguments; `Encode` and `Decode` are re-exported in the prelude.
///
/// ## Example
/// ```rust
/// use errand::prelude::{CancellationToken, Decode, Encode, JobProcessor, RunnerRouter, Xid};
///
/// struct PurgeCache;
///
/// #[derive(Encode, Decode)]
/// struct Prefix(String);
///
/// #[async_trait::async_trait]
/// impl JobProcessor for PurgeCache {
///     type Payload = Prefix;
///     type Error = std::convert::Infallible;
///
///     fn name() -> &'static str {
///         "purge_cache"
///     }
///
///     async fn handle(&self, _jid: Xid, prefix: Prefix, _stop: CancellationToken) -> Result<(), Self::Error> {
///         println!("purging {}*", prefix.0);
///         Ok(())
///     }
/// }
///
/// let mut router = RunnerRouter::default();
/// router.add_job_handler(PurgeCache);
/// assert_eq!(router.types(), vec!["purge_cache"]);
///```
#[derive(Default)]
pub struct RunnerRouter {
    jobs: HashMap<&'static str, BoxedJobHandler>,
    job_timeout: Option<std::time::Duration>,
}

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Completed,
    Failed {
        error: ErrorDetail,
        outcome: FailureOutcome,
    },
}

impl RunnerRouter {
    /// Register a job handler with the router. If job by that name already present, it will get replaced.
    pub fn add_job_handler<J>(&mut self, job: J)
    where
        J: JobProcessor + 'static,
        J::Payload: Decode<()> + Encode,
        J::Error: Into<JobError>,
    {
        let name = J::name();
        let boxed = WrappedJobHandler::new(job).boxed();
        if self.jobs.insert(name, boxed).is_some() {
            tracing::warn!("Replaced handler for job type {}", name);
        }
    }

    /// Upper bound on a single handler run. Handlers that overrun are cancelled and failed with a
    /// timeout.
    pub fn set_job_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.job_timeout = timeout;
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.jobs.keys().copied().collect()
    }

    /// Run a claimed job and report the result back to the queue. A failing or panicking handler
    /// never escapes this function; only queue errors do.
    ///
    /// `shutdown` firing cancels the handler's token and gives it the processor's
    /// `shutdown_timeout` to wrap up.
    #[instrument(skip_all, err, fields(job_type = %job.job_type, jid = %job.id, attempt = job.attempt_count))]
    pub async fn process<Q>(
        &self,
        queue: &Q,
        job: JobRecord,
        shutdown: &CancellationToken,
    ) -> Result<Processed, RunnerError>
    where
        Q: Queue,
    {
        let result = match self.jobs.get(job.job_type.as_str()) {
            Some(handler) => self.execute(handler, &job, shutdown).await,
            None => Err(ErrorDetail::new(
                FailureKind::UnknownJobType,
                RunnerError::UnknownJobType(job.job_type.clone()).to_string(),
            )),
        };

        match result {
            Ok(()) => {
                queue.mark_done(job.id).await?;
                tracing::info!("Job completed");
                Ok(Processed::Completed)
            }
            Err(error) => {
                match error.kind {
                    FailureKind::Crash => tracing::error!("Job crashed: {}", error.message),
                    _ => tracing::warn!("Error during job processing: {}", error),
                }
                let outcome = queue.mark_failed(job.id, error.clone()).await?;
                match outcome {
                    FailureOutcome::Dead => {
                        tracing::warn!("Moving job {} to dead set", job.id)
                    }
                    FailureOutcome::RetryScheduled { next_run_at } => {
                        tracing::info!("Job {} will be retried at {}", job.id, next_run_at)
                    }
                }
                Ok(Processed::Failed { error, outcome })
            }
        }
    }

    async fn execute(
        &self,
        handler: &BoxedJobHandler,
        job: &JobRecord,
        shutdown: &CancellationToken,
    ) -> Result<(), ErrorDetail> {
        let token = shutdown.child_token();
        let run = AssertUnwindSafe(handler.handle(job.id, job.arguments.clone(), token.clone()))
            .catch_unwind();
        tokio::pin!(run);

        let deadline = async {
            match self.job_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending::<()>().await,
            }
        };

        let result = tokio::select! {
            result = &mut run => classify(result),
            _ = deadline => {
                token.cancel();
                Err(ErrorDetail::new(
                    FailureKind::Timeout,
                    format!("Job exceeded its timeout of {:?}", self.job_timeout.unwrap_or_default()),
                ))
            }
            _ = shutdown.cancelled() => {
                let grace = handler.shutdown_timeout();
                match tokio::time::timeout(grace, &mut run).await {
                    Ok(result) => classify(result),
                    Err(_) => Err(ErrorDetail::new(
                        FailureKind::Timeout,
                        JobError::PastShutdownGrace(grace).to_string(),
                    )),
                }
            }
        };

        // A handler that gave up because the runner is stopping did not fail on its own.
        match result {
            Err(error) if error.kind == FailureKind::Handler && shutdown.is_cancelled() => {
                Err(ErrorDetail::new(
                    FailureKind::Timeout,
                    format!("Interrupted by shutdown: {}", error.message),
                ))
            }
            result => result,
        }
    }
}

fn classify(result: Result<Result<(), JobError>, Box<dyn Any + Send>>) -> Result<(), ErrorDetail> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ JobError::PastShutdownGrace(_))) => {
            Err(ErrorDetail::new(FailureKind::Timeout, e.to_string()))
        }
        Ok(Err(e)) => Err(ErrorDetail::new(FailureKind::Handler, error_chain(&e))),
        Err(panic) => Err(ErrorDetail::new(FailureKind::Crash, panic_message(panic.as_ref()))),
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Handler panicked: {}", message)
    } else {
        "Handler panicked".to_string()
    }
}

/// Errors returned by the router.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Runner is not configured to run this job type: {0}")]
    UnknownJobType(String),
    #[error("Invalid runner configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    QueueError(#[from] QueueError),
}

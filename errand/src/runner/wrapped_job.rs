use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::{Bytes, CancellationToken, Xid};
use async_trait::async_trait;
use bincode::{Decode, Encode};
use tracing::instrument;

/// A processor of any job type, taking the stored bincode arguments as they are.
pub type BoxedJobHandler = Box<dyn JobProcessor<Payload = Bytes, Error = JobError>>;

/// Erases the payload type of a processor so processors of different job types can share a
/// routing table. Decoding happens here, right before the typed handler runs.
pub struct WrappedJobHandler<J: JobProcessor> {
    inner: J,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: Decode<()> + Encode,
    J::Error: Into<JobError>,
{
    pub fn new(inner: J) -> Self {
        Self { inner }
    }

    pub fn boxed(self) -> BoxedJobHandler {
        Box::new(self)
    }

    fn decode(arguments: &[u8]) -> Result<J::Payload, JobError> {
        bincode::decode_from_slice(arguments, bincode::config::standard())
            .map(|(payload, _)| payload)
            .map_err(|source| JobError::Undecodable {
                job_type: J::name(),
                source,
            })
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: Decode<()> + Encode,
    J::Error: Into<JobError>,
{
    type Payload = Bytes;
    type Error = JobError;

    #[instrument(skip_all, err, fields(jid = %jid, job_type = J::name()))]
    async fn handle(
        &self,
        jid: Xid,
        arguments: Bytes,
        cancellation_token: CancellationToken,
    ) -> Result<(), JobError> {
        let payload = Self::decode(&arguments)?;
        self.inner
            .handle(jid, payload, cancellation_token)
            .await
            .map_err(Into::into)
    }

    fn shutdown_timeout(&self) -> std::time::Duration {
        self.inner.shutdown_timeout()
    }

    fn name() -> &'static str {
        J::name()
    }

    fn queue() -> &'static str {
        J::queue()
    }
}

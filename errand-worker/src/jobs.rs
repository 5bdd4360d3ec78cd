use async_trait::async_trait;
use bincode::{Decode, Encode};
use chrono::Utc;
use errand::prelude::{CancellationToken, JobProcessor, Xid};

const NAP: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Encode, Decode, Debug, Clone, Default, PartialEq)]
pub struct SleepyPayload {
    pub note: Option<String>,
}

/// Demo job: naps for a while, then logs the time it woke up.
pub struct SleepyTimestamp {
    nap: std::time::Duration,
}

impl SleepyTimestamp {
    pub fn with_nap(nap: std::time::Duration) -> Self {
        Self { nap }
    }
}

impl Default for SleepyTimestamp {
    fn default() -> Self {
        Self::with_nap(NAP)
    }
}

#[async_trait]
impl JobProcessor for SleepyTimestamp {
    type Payload = SleepyPayload;
    type Error = anyhow::Error;

    async fn handle(
        &self,
        jid: Xid,
        payload: Self::Payload,
        cancellation_token: CancellationToken,
    ) -> Result<(), Self::Error> {
        tokio::select! {
            _ = tokio::time::sleep(self.nap) => {}
            _ = cancellation_token.cancelled() => {
                anyhow::bail!("interrupted by shutdown");
            }
        }
        tracing::info!(
            %jid,
            note = payload.note.as_deref().unwrap_or(""),
            "woke up at {}",
            Utc::now().to_rfc3339()
        );
        Ok(())
    }

    fn name() -> &'static str {
        "sleepy_timestamp"
    }
}

use super::job_router::RunnerError;
use crate::core::retry::RetryPolicy;
use crate::core::Duration;

/// Operational configuration shared by the store, the enqueuer and the runner. Build it once at
/// startup and hand it to every component that needs it.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of worker slots.
    pub concurrency: usize,
    /// Queues in priority order. A slot always takes work from the first queue that has some.
    pub queues: Vec<String>,
    /// Policy for failed attempts. `JobRunner::new` installs it on the store it is given.
    pub retry_policy: RetryPolicy,
    /// How long an idle slot waits before polling again.
    pub poll_interval: Duration,
    /// Claims older than this are presumed abandoned by a crashed worker.
    pub stale_inflight_threshold: Duration,
    /// How often to sweep for abandoned claims.
    pub stale_check_interval: Duration,
    /// Optional upper bound on a single handler run.
    pub job_timeout: Option<Duration>,
    /// Connection string of the store backend. The runner itself never connects; this is what
    /// the binary opens the store with.
    pub store_url: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            queues: vec!["default".to_string()],
            retry_policy: RetryPolicy::default(),
            poll_interval: Duration::seconds(1),
            stale_inflight_threshold: Duration::minutes(30),
            stale_check_interval: Duration::minutes(1),
            job_timeout: None,
            store_url: "sqlite://errand.db".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_inflight_threshold(mut self, threshold: Duration) -> Self {
        self.stale_inflight_threshold = threshold;
        self
    }

    pub fn with_stale_check_interval(mut self, interval: Duration) -> Self {
        self.stale_check_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = url.into();
        self
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.concurrency == 0 {
            return Err(RunnerError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.queues.is_empty() || self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(RunnerError::InvalidConfig(
                "queues must be a non-empty list of names".into(),
            ));
        }
        if self.retry_policy.backoff.base() < Duration::zero() {
            return Err(RunnerError::InvalidConfig(
                "backoff base must not be negative".into(),
            ));
        }
        for (name, value) in [
            ("poll_interval", Some(self.poll_interval)),
            ("stale_inflight_threshold", Some(self.stale_inflight_threshold)),
            ("stale_check_interval", Some(self.stale_check_interval)),
            ("job_timeout", self.job_timeout),
        ] {
            if matches!(value, Some(d) if d <= Duration::zero()) {
                return Err(RunnerError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

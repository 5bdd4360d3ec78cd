use crate::core::{Bytes, DateTime, Duration, Utc, Xid};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a job record.
///
/// ```text
/// Pending -> InFlight -> Done
///                     -> RetryScheduled -> Pending
///                     -> Dead
/// ```
///
/// `Done` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    InFlight,
    RetryScheduled,
    Dead,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::RetryScheduled => "retry_scheduled",
            JobState::Dead => "dead",
            JobState::Done => "done",
        }
    }

    /// Terminal records are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("Unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "in_flight" | "inflight" => Ok(JobState::InFlight),
            "retry_scheduled" | "retry" => Ok(JobState::RetryScheduled),
            "dead" => Ok(JobState::Dead),
            "done" => Ok(JobState::Done),
            other => Err(UnknownJobState(other.to_string())),
        }
    }
}

/// Why an execution attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    Crash,
    /// The handler ran past its timeout or the shutdown grace period.
    Timeout,
    /// No handler is registered for the job type.
    UnknownJobType,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Handler => "handler",
            FailureKind::Crash => "crash",
            FailureKind::Timeout => "timeout",
            FailureKind::UnknownJobType => "unknown_job_type",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "handler" => Ok(FailureKind::Handler),
            "crash" => Ok(FailureKind::Crash),
            "timeout" => Ok(FailureKind::Timeout),
            "unknown_job_type" => Ok(FailureKind::UnknownJobType),
            other => Err(anyhow::anyhow!("Unknown failure kind: {}", other)),
        }
    }
}

/// Structured failure detail stored on the record as `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a producer hands to the queue. `arguments` is the encoded payload of the job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub job_type: String,
    pub arguments: Bytes,
    pub run_at: DateTime,
}

impl NewJob {
    /// A job that is eligible immediately.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        arguments: impl Into<Bytes>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            arguments: arguments.into(),
            run_at: Utc::now(),
        }
    }

    pub fn run_at(mut self, run_at: DateTime) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.run_at = Utc::now() + delay;
        self
    }
}

/// A persisted job together with its execution metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Xid,
    pub queue_name: String,
    pub job_type: String,
    pub arguments: Bytes,
    pub state: JobState,
    /// Incremented on every claim, never reset.
    pub attempt_count: u32,
    pub next_run_at: DateTime,
    pub last_error: Option<ErrorDetail>,
    pub created_at: DateTime,
    /// Worker token of the current claim, only set while `InFlight`.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime>,
}

impl JobRecord {
    /// Build a fresh `Pending` record for a newly enqueued job.
    pub fn from_new_job(id: Xid, new_job: NewJob, created_at: DateTime) -> Self {
        Self {
            id,
            queue_name: new_job.queue_name,
            job_type: new_job.job_type,
            arguments: new_job.arguments,
            state: JobState::Pending,
            attempt_count: 0,
            next_run_at: new_job.run_at,
            last_error: None,
            created_at,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Whether a claim at `now` may pick this record up.
    pub fn is_claimable(&self, now: DateTime) -> bool {
        matches!(self.state, JobState::Pending | JobState::RetryScheduled)
            && self.next_run_at <= now
    }
}

#![doc = include_str!("../README.md")]

pub mod core;

/// Default implementation of the worker pool and dispatcher.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod config;
    pub mod job_router;
    pub mod job_runner;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        enqueuer::Enqueuer,
        job::{ErrorDetail, FailureKind, JobRecord, JobState, NewJob},
        job_processor::{JobError, JobProcessor},
        memory::InMemoryQueue,
        queue::{Queue, QueueError},
        retry::{Backoff, FailureOutcome, RetryPolicy},
        CancellationToken, Duration, Xid,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        config::RunnerConfig,
        job_router::{Processed, RunnerError, RunnerRouter},
        job_runner::{JobRunner, RunnerStats},
    };
    pub use bincode::{Decode, Encode};
}

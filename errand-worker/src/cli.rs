//! Command line interface of the worker binary.
//!
//! Every operational knob can also come from the environment (`ERRAND_*`), so a deployment can
//! configure the worker without touching its command line.

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use errand::prelude::{Backoff, Duration, JobState, RetryPolicy, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "errand-worker")]
#[command(about = "Run and feed a durable background job queue backed by SQLite")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(short, long, default_value = "info", global = true, env = "ERRAND_LOG_LEVEL")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process jobs until interrupted with Ctrl-C.
    Run(RunArgs),
    /// Add demo jobs to a queue.
    Enqueue(EnqueueArgs),
    /// Print the jobs of a queue that are in a given state.
    Inspect(InspectArgs),
}

/// Store and retry settings shared by every command.
#[derive(Args, Debug)]
pub struct StoreArgs {
    #[arg(
        long,
        global = true,
        env = "ERRAND_DATABASE_URL",
        default_value = "sqlite://errand.db"
    )]
    pub database_url: String,

    /// Retries allowed after the first attempt.
    #[arg(long, global = true, env = "ERRAND_MAX_RETRIES", default_value_t = 1)]
    pub max_retries: u32,

    /// Backoff strategy between attempts (constant, linear, exponential).
    #[arg(long, global = true, env = "ERRAND_BACKOFF", default_value = "exponential")]
    pub backoff: String,

    #[arg(long, global = true, env = "ERRAND_BACKOFF_BASE_SECS", default_value_t = 5)]
    pub backoff_base_secs: i64,
}

impl StoreArgs {
    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        ensure!(
            self.backoff_base_secs >= 0,
            "--backoff-base-secs must not be negative, got {}",
            self.backoff_base_secs
        );
        let base = Duration::seconds(self.backoff_base_secs);
        let backoff = Backoff::from_name(&self.backoff, base)?;
        Ok(RetryPolicy::new(self.max_retries, backoff))
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of jobs processed at the same time.
    #[arg(short, long, env = "ERRAND_CONCURRENCY", default_value_t = 5)]
    pub concurrency: usize,

    /// Comma separated queues, highest priority first.
    #[arg(
        long,
        env = "ERRAND_QUEUES",
        value_delimiter = ',',
        default_value = "default"
    )]
    pub queues: Vec<String>,

    #[arg(long, env = "ERRAND_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: i64,

    /// Claims older than this are handed to another worker.
    #[arg(long, env = "ERRAND_STALE_THRESHOLD_SECS", default_value_t = 1800)]
    pub stale_threshold_secs: i64,

    /// Abort a single job after this many seconds.
    #[arg(long, env = "ERRAND_JOB_TIMEOUT_SECS")]
    pub job_timeout_secs: Option<i64>,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    #[arg(short, long, default_value = "default")]
    pub queue: String,

    /// Seconds before the jobs become eligible to run.
    #[arg(long, default_value_t = 0)]
    pub delay_secs: i64,

    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// Free text logged by the job when it runs.
    #[arg(long)]
    pub note: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(short, long, default_value = "default")]
    pub queue: String,

    /// pending, in_flight, retry_scheduled, done or dead.
    #[arg(short, long, default_value = "dead")]
    pub state: String,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

impl InspectArgs {
    pub fn state(&self) -> anyhow::Result<JobState> {
        self.state
            .parse()
            .with_context(|| format!("Invalid job state: {}", self.state))
    }
}

impl Cli {
    pub fn runner_config(&self, args: &RunArgs) -> anyhow::Result<RunnerConfig> {
        let config = RunnerConfig::new(args.concurrency)
            .with_queues(args.queues.iter().map(|q| q.trim().to_string()))
            .with_retry_policy(self.store.retry_policy()?)
            .with_poll_interval(Duration::milliseconds(args.poll_interval_ms))
            .with_stale_inflight_threshold(Duration::seconds(args.stale_threshold_secs))
            .with_job_timeout(args.job_timeout_secs.map(Duration::seconds))
            .with_store_url(self.store.database_url.clone());
        config.validate()?;
        Ok(config)
    }
}

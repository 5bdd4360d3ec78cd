use anyhow::Context;
use clap::Parser;
use errand::prelude::{
    CancellationToken, Duration, Enqueuer, JobRunner, Queue, RunnerRouter,
};
use errand_sqlite::SqliteQueue;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod jobs;

use cli::{Cli, Commands, EnqueueArgs, InspectArgs, RunArgs};
use jobs::{SleepyPayload, SleepyTimestamp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match &cli.command {
        Commands::Run(args) => run(&cli, args).await,
        Commands::Enqueue(args) => enqueue(args, open(&cli.store.database_url).await?).await,
        Commands::Inspect(args) => inspect(args, open(&cli.store.database_url).await?).await,
    }
}

async fn open(url: &str) -> anyhow::Result<SqliteQueue> {
    SqliteQueue::connect(url)
        .await
        .with_context(|| format!("Failed to open store at {}", url))
}

async fn run(cli: &Cli, args: &RunArgs) -> anyhow::Result<()> {
    let config = cli.runner_config(args)?;
    // The runner installs the configured retry policy on the store.
    let queue = open(&config.store_url).await?;
    let mut router = RunnerRouter::default();
    router.add_job_handler(SleepyTimestamp::default());
    let runner = JobRunner::new(queue, router, config)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
                Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    runner.run(shutdown).await?;
    let stats = runner.stats();
    tracing::info!(
        completed = stats.completed,
        retried = stats.retried,
        dead = stats.dead,
        crashed = stats.crashed,
        "Worker stopped"
    );
    Ok(())
}

async fn enqueue(args: &EnqueueArgs, queue: SqliteQueue) -> anyhow::Result<()> {
    let enqueuer = Enqueuer::new(Arc::new(queue));
    let delay = Duration::seconds(args.delay_secs);
    for _ in 0..args.count {
        let payload = SleepyPayload {
            note: args.note.clone(),
        };
        let jid = enqueuer
            .enqueue_to::<SleepyTimestamp>(&args.queue, payload, delay)
            .await?;
        println!("{}", jid);
    }
    Ok(())
}

async fn inspect(args: &InspectArgs, queue: SqliteQueue) -> anyhow::Result<()> {
    let state = args.state()?;
    let jobs = queue.list_jobs(&args.queue, state, args.limit).await?;
    if jobs.is_empty() {
        println!("No {} jobs in queue {}", state, args.queue);
    }
    for job in jobs {
        let error = job
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{}\t{}\tattempts={}\tnext_run_at={}\t{}",
            job.id,
            job.job_type,
            job.attempt_count,
            job.next_run_at.to_rfc3339(),
            error
        );
    }
    Ok(())
}

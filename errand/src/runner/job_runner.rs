use super::config::RunnerConfig;
use super::job_router::{Processed, RunnerError, RunnerRouter};
use crate::core::enqueuer::Enqueuer;
use crate::core::job::{FailureKind, JobRecord};
use crate::core::queue::{Queue, QueueError};
use crate::core::retry::FailureOutcome;
use crate::core::{new_xid, CancellationToken, Duration, Xid};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::Instrument;

pub const JITTER_INTERVAL_MS: [u64; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// How long a slot backs off after the queue returned an error.
const QUEUE_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// A bridge between job processors and the queue: the worker pool and its dispatcher.
///
/// ## Implementation
///
/// - `concurrency` worker slots run as independent tasks. Each slot, while idle:
///     - Tries to claim a job from each configured queue, in order
///     - Processes the job through the router and reports the result to the queue
///     - If nothing was claimable, waits for the poll interval (plus random jitter), a wake
///       signal from an `Enqueuer` of this runner, or shutdown
/// - One more task periodically puts abandoned in-flight jobs back into the queue.
///
/// Slots never talk to each other; the queue is the only point of coordination.
///
/// ## Examples
/// See `errand-sqlite` for examples.
pub struct JobRunner<Q>
where
    Q: Queue,
{
    id: Xid,
    queue: Arc<Q>,
    processor: Arc<RunnerRouter>,
    config: Arc<RunnerConfig>,
    wake: Arc<Notify>,
    stats: Arc<SharedStats>,
}

impl<Q> JobRunner<Q>
where
    Q: Queue + 'static,
{
    /// Create a new JobRunner from queue, router and configuration.
    pub fn new(
        queue: Q,
        processor: RunnerRouter,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        let queue = queue.with_retry_policy(config.retry_policy);
        Self::with_shared_queue(Arc::new(queue), processor, config)
    }

    /// Like `new`, for a queue that is already shared. The queue must already apply the retry
    /// policy of `config`.
    pub fn with_shared_queue(
        queue: Arc<Q>,
        mut processor: RunnerRouter,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        if queue.retry_policy() != config.retry_policy {
            return Err(RunnerError::InvalidConfig(format!(
                "queue retries with {:?}, config asks for {:?}",
                queue.retry_policy(),
                config.retry_policy
            )));
        }
        let job_timeout = config
            .job_timeout
            .map(to_std)
            .transpose()?;
        processor.set_job_timeout(job_timeout);
        Ok(Self {
            id: new_xid(),
            queue,
            processor: Arc::new(processor),
            config: Arc::new(config),
            wake: Arc::new(Notify::new()),
            stats: Default::default(),
        })
    }

    pub fn id(&self) -> Xid {
        self.id
    }

    /// Producer handle that wakes this runner's idle slots.
    pub fn enqueuer(&self) -> Enqueuer<Q> {
        Enqueuer::with_wake(self.queue.clone(), self.wake.clone())
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot(self.config.concurrency)
    }

    /// Run worker slots and the stale claim sweeper until `shutdown` is cancelled. Jobs that are
    /// running when it fires get their processor's shutdown timeout to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        let poll_interval = to_std(self.config.poll_interval)?;
        let sweep_interval = to_std(self.config.stale_check_interval)?;
        tracing::info!(
            runner = %self.id,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Starting job runner"
        );

        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);
        for slot in 0..self.config.concurrency {
            let worker = WorkerSlot {
                token: format!("{}:{}", self.id, slot),
                queue: self.queue.clone(),
                processor: self.processor.clone(),
                config: self.config.clone(),
                wake: self.wake.clone(),
                stats: self.stats.clone(),
                poll_interval,
            };
            let span = tracing::info_span!("worker", slot);
            tasks.push(tokio::spawn(worker.run(shutdown.clone()).instrument(span)));
        }

        let queue = self.queue.clone();
        let max_age = self.config.stale_inflight_threshold;
        tasks.push(tokio::spawn(sweep_stale_claims(
            queue,
            max_age,
            sweep_interval,
            shutdown.clone(),
        )));

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Runner task aborted: {}", e);
            }
        }
        tracing::info!(runner = %self.id, "Job runner stopped");
        Ok(())
    }
}

struct WorkerSlot<Q> {
    token: String,
    queue: Arc<Q>,
    processor: Arc<RunnerRouter>,
    config: Arc<RunnerConfig>,
    wake: Arc<Notify>,
    stats: Arc<SharedStats>,
    poll_interval: std::time::Duration,
}

impl<Q> WorkerSlot<Q>
where
    Q: Queue + 'static,
{
    async fn run(self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            // Register interest before polling so an enqueue between the poll and the wait is not lost.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim().await {
                Ok(Some(job)) => {
                    self.stats.active.fetch_add(1, Ordering::SeqCst);
                    let result = self.processor.process(&*self.queue, job, &shutdown).await;
                    self.stats.active.fetch_sub(1, Ordering::SeqCst);
                    match result {
                        Ok(processed) => self.stats.record(&processed),
                        Err(RunnerError::QueueError(e)) => {
                            handle_queue_error(e, &shutdown).await
                        }
                        Err(e) => tracing::error!("Failed to process job: {}", e),
                    }
                }
                Ok(None) => {
                    let wait = self.poll_interval + get_random_jitter();
                    tokio::select! {
                        _ = &mut notified => tracing::trace!("Woken up by enqueue"),
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                Err(e) => handle_queue_error(e, &shutdown).await,
            }
        }
        tracing::debug!(worker = %self.token, "Worker slot stopped");
    }

    /// First claimable job across the configured queues, in priority order.
    async fn claim(&self) -> Result<Option<JobRecord>, QueueError> {
        for queue_name in &self.config.queues {
            loop {
                match self.queue.claim_next(queue_name, &self.token).await {
                    Ok(Some(job)) => return Ok(Some(job)),
                    Ok(None) => break,
                    Err(QueueError::ClaimConflict(jid)) => {
                        tracing::debug!("Lost claim on {}, trying again", jid)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }
}

async fn sweep_stale_claims<Q>(
    queue: Arc<Q>,
    max_age: Duration,
    every: std::time::Duration,
    shutdown: CancellationToken,
) where
    Q: Queue + 'static,
{
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        match queue.requeue_stale_inflight(max_age).await {
            Ok(0) => {}
            Ok(count) => tracing::warn!("Requeued {} stale in-flight jobs", count),
            Err(e) => tracing::error!("Failed to requeue stale in-flight jobs: {}", e),
        }
    }
}

/// Counters describing what a runner did so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub concurrency: usize,
    pub active: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
    pub crashed: u64,
}

impl RunnerStats {
    pub fn total_processed(&self) -> u64 {
        self.completed + self.retried + self.dead
    }
}

#[derive(Default)]
struct SharedStats {
    active: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    crashed: AtomicU64,
}

impl SharedStats {
    fn record(&self, processed: &Processed) {
        match processed {
            Processed::Completed => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            Processed::Failed { error, outcome } => {
                if error.kind == FailureKind::Crash {
                    self.crashed.fetch_add(1, Ordering::SeqCst);
                }
                match outcome {
                    FailureOutcome::RetryScheduled { .. } => self.retried.fetch_add(1, Ordering::SeqCst),
                    FailureOutcome::Dead => self.dead.fetch_add(1, Ordering::SeqCst),
                };
            }
        }
    }

    fn snapshot(&self, concurrency: usize) -> RunnerStats {
        RunnerStats {
            concurrency,
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dead: self.dead.load(Ordering::SeqCst),
            crashed: self.crashed.load(Ordering::SeqCst),
        }
    }
}

fn to_std(duration: Duration) -> Result<std::time::Duration, RunnerError> {
    duration
        .to_std()
        .map_err(|_| QueueError::InvalidInterval(duration).into())
}

async fn handle_queue_error(error: QueueError, shutdown: &CancellationToken) {
    tracing::error!("Encountered QueueError: {}", error);
    tracing::warn!("Suspending worker for {:?}", QUEUE_ERROR_BACKOFF);
    tokio::select! {
        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
        _ = shutdown.cancelled() => {}
    }
}

fn get_random_jitter() -> std::time::Duration {
    JITTER_INTERVAL_MS
        .choose(&mut rand::thread_rng())
        .map(|ms| std::time::Duration::from_millis(*ms))
        .unwrap_or_else(|| std::time::Duration::from_millis(5)) // Always takes a happy path technically
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::job::{JobState, NewJob};
    use crate::core::job_processor::JobProcessor;
    use crate::core::memory::InMemoryQueue;
    use crate::core::retry::{Backoff, RetryPolicy};
    use crate::core::Utc;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Barrier;

    #[derive(Clone, Default)]
    struct Echo {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobProcessor for Echo {
        type Payload = Vec<String>;
        type Error = Infallible;

        async fn handle(
            &self,
            _jid: Xid,
            payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), Infallible> {
            self.seen.lock().unwrap().extend(payload);
            Ok(())
        }

        fn name() -> &'static str {
            "echo"
        }
    }

    /// Fails the first `failures` runs, then succeeds.
    struct Flaky {
        failures: usize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for Flaky {
        type Payload = ();
        type Error = anyhow::Error;

        async fn handle(
            &self,
            _jid: Xid,
            _payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), anyhow::Error> {
            if self.runs.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("not yet");
            }
            Ok(())
        }

        fn name() -> &'static str {
            "flaky"
        }
    }

    struct Crashy;

    #[async_trait]
    impl JobProcessor for Crashy {
        type Payload = ();
        type Error = Infallible;

        async fn handle(
            &self,
            _jid: Xid,
            _payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), Infallible> {
            panic!("worker blew up");
        }

        fn name() -> &'static str {
            "crashy"
        }
    }

    /// Only finishes once two of them are running at the same time.
    struct Rendezvous {
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl JobProcessor for Rendezvous {
        type Payload = u8;
        type Error = Infallible;

        async fn handle(
            &self,
            _jid: Xid,
            _payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), Infallible> {
            self.barrier.wait().await;
            Ok(())
        }

        fn name() -> &'static str {
            "rendezvous"
        }
    }

    fn config(concurrency: usize) -> RunnerConfig {
        RunnerConfig::new(concurrency).with_poll_interval(Duration::milliseconds(10))
    }

    fn start(
        runner: JobRunner<InMemoryQueue>,
    ) -> (
        Arc<JobRunner<InMemoryQueue>>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), RunnerError>>,
    ) {
        let runner = Arc::new(runner);
        let shutdown = CancellationToken::new();
        let handle = {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run(shutdown).await })
        };
        (runner, shutdown, handle)
    }

    async fn wait_for_state(queue: &InMemoryQueue, jid: Xid, state: JobState) -> JobRecord {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let job = queue.get_job(jid).await.unwrap().unwrap();
            if job.state == state {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {}",
                jid,
                job.state
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_job_ends_done() {
        let echo = Echo::default();
        let mut router = RunnerRouter::default();
        router.add_job_handler(echo.clone());
        let runner = JobRunner::new(InMemoryQueue::default(), router, config(1)).unwrap();
        let enqueuer = runner.enqueuer();
        let (runner, shutdown, handle) = start(runner);

        let jid = enqueuer
            .enqueue::<Echo>(vec!["x".to_string()])
            .await
            .unwrap();
        let job = wait_for_state(enqueuer.queue(), jid, JobState::Done).await;
        assert_eq!(job.attempt_count, 1);
        assert_eq!(*echo.seen.lock().unwrap(), vec!["x".to_string()]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(runner.stats().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn always_failing_job_without_retries_dies_after_one_attempt() {
        let mut router = RunnerRouter::default();
        router.add_job_handler(Flaky {
            failures: usize::MAX,
            runs: AtomicUsize::new(0),
        });
        let config = config(1).with_retry_policy(RetryPolicy::no_retries());
        let runner = JobRunner::new(InMemoryQueue::default(), router, config).unwrap();
        let enqueuer = runner.enqueuer();
        let (runner, shutdown, handle) = start(runner);

        let jid = enqueuer.enqueue::<Flaky>(()).await.unwrap();
        let job = wait_for_state(enqueuer.queue(), jid, JobState::Dead).await;
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Handler);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(runner.stats().dead, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn job_failing_once_succeeds_on_retry() {
        let mut router = RunnerRouter::default();
        router.add_job_handler(Flaky {
            failures: 1,
            runs: AtomicUsize::new(0),
        });
        let config =
            config(1).with_retry_policy(RetryPolicy::new(1, Backoff::Constant(Duration::zero())));
        let runner = JobRunner::new(InMemoryQueue::default(), router, config).unwrap();
        let enqueuer = runner.enqueuer();
        let (runner, shutdown, handle) = start(runner);

        let jid = enqueuer.enqueue::<Flaky>(()).await.unwrap();
        let job = wait_for_state(enqueuer.queue(), jid, JobState::Done).await;
        assert_eq!(job.attempt_count, 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let stats = runner.stats();
        assert_eq!((stats.retried, stats.completed), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_idle_slots_take_two_jobs_at_once() {
        let mut router = RunnerRouter::default();
        router.add_job_handler(Rendezvous {
            barrier: Arc::new(Barrier::new(2)),
        });
        let queue = Arc::new(InMemoryQueue::default());
        let first = queue.enqueue::<Rendezvous>("default", 1).await.unwrap();
        let second = queue.enqueue::<Rendezvous>("default", 2).await.unwrap();
        let runner = JobRunner::with_shared_queue(queue.clone(), router, config(2)).unwrap();
        let (_runner, shutdown, handle) = start(runner);

        // Neither job can finish unless both were claimed concurrently.
        wait_for_state(&queue, first, JobState::Done).await;
        wait_for_state(&queue, second, JobState::Done).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashing_job_does_not_take_down_the_slot() {
        let echo = Echo::default();
        let mut router = RunnerRouter::default();
        router.add_job_handler(Crashy);
        router.add_job_handler(echo.clone());
        let queue = Arc::new(InMemoryQueue::new(RetryPolicy::no_retries()));
        let crashed = queue.enqueue::<Crashy>("default", ()).await.unwrap();
        let fine = queue
            .enqueue::<Echo>("default", vec!["after".to_string()])
            .await
            .unwrap();
        let config = config(1).with_retry_policy(RetryPolicy::no_retries());
        let runner = JobRunner::with_shared_queue(queue.clone(), router, config).unwrap();
        let (runner, shutdown, handle) = start(runner);

        let job = wait_for_state(&queue, crashed, JobState::Dead).await;
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Crash);
        wait_for_state(&queue, fine, JobState::Done).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let stats = runner.stats();
        assert_eq!((stats.crashed, stats.dead, stats.completed), (1, 1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queues_are_checked_in_priority_order() {
        let echo = Echo::default();
        let mut router = RunnerRouter::default();
        router.add_job_handler(echo.clone());
        let queue = Arc::new(InMemoryQueue::default());
        queue
            .enqueue::<Echo>("default", vec!["routine".to_string()])
            .await
            .unwrap();
        let urgent = queue
            .enqueue::<Echo>("critical", vec!["urgent".to_string()])
            .await
            .unwrap();
        let config = config(1).with_queues(["critical", "default"]);
        let runner = JobRunner::with_shared_queue(queue.clone(), router, config).unwrap();
        let (_runner, shutdown, handle) = start(runner);

        wait_for_state(&queue, urgent, JobState::Done).await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while echo.seen.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            *echo.seen.lock().unwrap(),
            vec!["urgent".to_string(), "routine".to_string()]
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_claims_are_picked_up_again() {
        let echo = Echo::default();
        let mut router = RunnerRouter::default();
        router.add_job_handler(echo.clone());
        let queue = Arc::new(InMemoryQueue::default());
        // A worker that claimed the job an hour ago and never reported back.
        let an_hour_ago = Utc::now() - Duration::hours(1);
        let arguments =
            bincode::encode_to_vec(vec!["again".to_string()], bincode::config::standard()).unwrap();
        let jid = queue
            .enqueue_job(NewJob::new("default", Echo::name(), arguments).run_at(an_hour_ago))
            .await
            .unwrap();
        let stranded = queue
            .claim_next_with_instant("default", "crashed-worker", an_hour_ago)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stranded.id, jid);

        let config = config(1)
            .with_stale_inflight_threshold(Duration::minutes(1))
            .with_stale_check_interval(Duration::milliseconds(10));
        let runner = JobRunner::with_shared_queue(queue.clone(), router, config).unwrap();
        let (_runner, shutdown, handle) = start(runner);

        let job = wait_for_state(&queue, jid, JobState::Done).await;
        // One stranded claim plus the run that completed it.
        assert_eq!(job.attempt_count, 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = JobRunner::new(
            InMemoryQueue::default(),
            RunnerRouter::default(),
            RunnerConfig::new(0),
        );
        assert!(matches!(result, Err(RunnerError::InvalidConfig(_))));
    }

    #[test]
    fn runner_installs_its_retry_policy_on_the_queue() {
        let config = config(1).with_retry_policy(RetryPolicy::no_retries());
        let runner = JobRunner::new(InMemoryQueue::default(), RunnerRouter::default(), config)
            .unwrap();
        assert_eq!(
            runner.enqueuer().queue().retry_policy(),
            RetryPolicy::no_retries()
        );
    }

    #[test]
    fn shared_queue_with_other_retry_policy_is_rejected() {
        let queue = Arc::new(InMemoryQueue::default());
        let config = config(1).with_retry_policy(RetryPolicy::no_retries());
        let result = JobRunner::with_shared_queue(queue, RunnerRouter::default(), config);
        assert!(matches!(result, Err(RunnerError::InvalidConfig(_))));
    }
}

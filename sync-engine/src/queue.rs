//! Async job queues with bounded worker pools.
//!
//! A [`JobQueue`] wraps a [`JobBuffer`] from `sync-core` and drives it with
//! tokio tasks: `concurrency` workers pull the highest-priority, oldest
//! ready job and hand it to a [`JobHandler`], and one reaper task returns
//! jobs whose lease expired (see [`JobBuffer::reap_stalled`]).
//!
//! ## Design Notes
//!
//! The buffer lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. Idle workers park on a `Notify` and wake on new jobs, on resume,
//! on requeued stalls, or when the earliest delayed job becomes ready.
//!
//! Each job runs in its own task so a panicking handler fails the job
//! instead of killing the worker. The reaper aborts the task of every lease
//! it reclaims, so a handler that hangs gives its worker slot back and the
//! requeued job can run again.

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::{
    Activation, FailOutcome, Job, JobBuffer, JobCounts, JobId, JobOptions, JobPriority, JobState,
    LeaseToken, QueueError, StallOutcome, Stalled,
};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

fn clock_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    /// Run one attempt. An error fails the attempt; the queue retries it
    /// with backoff while attempts remain.
    async fn handle(&self, job: &JobContext<T>) -> Result<(), EngineError>;

    /// Called once when a job fails for good (attempts exhausted or stalled
    /// too often).
    fn on_failed(&self, _data: &T, _reason: &str) {}
}

struct Shared<T> {
    name: &'static str,
    buffer: Mutex<JobBuffer<T>>,
    wake: Notify,
    /// Handler tasks holding a lease, by job.
    running: DashMap<JobId, (LeaseToken, AbortHandle)>,
    metrics: Arc<EngineMetrics>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, JobBuffer<T>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A job handed to a [`JobHandler`].
pub struct JobContext<T> {
    /// Job id.
    pub id: JobId,
    /// Uniqueness key.
    pub key: String,
    /// Payload.
    pub data: T,
    /// 1-based attempt number.
    pub attempt: u32,
    token: LeaseToken,
    shared: Arc<Shared<T>>,
}

impl<T: Clone> JobContext<T> {
    /// Report progress (0-100). Also extends the job's lease.
    ///
    /// Returns false if the lease was lost (the job stalled and was handed
    /// to another worker, or failed).
    pub fn progress(&self, percent: u8) -> bool {
        let mut buffer = self.shared.lock();
        buffer
            .report_progress(self.id, self.token, percent, clock_now())
            .is_ok()
    }

    /// Name of the queue running this job.
    pub fn queue_name(&self) -> &'static str {
        self.shared.name
    }
}

/// Job queue with a worker pool.
pub struct JobQueue<T> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> JobQueue<T> {
    /// Create a stopped queue. Jobs may be added before [`JobQueue::start`].
    pub fn new(name: &'static str, options: JobOptions, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                buffer: Mutex::new(JobBuffer::new(options)),
                wake: Notify::new(),
                running: DashMap::new(),
                metrics,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Spawn `concurrency` workers and a stall reaper.
    pub fn start<H: JobHandler<T>>(
        &self,
        handler: Arc<H>,
        concurrency: usize,
        stalled_check_interval: Duration,
    ) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for slot in 0..concurrency.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                Arc::clone(&handler),
                slot,
            )));
        }
        tasks.push(tokio::spawn(reaper_loop(
            Arc::clone(&self.shared),
            handler,
            stalled_check_interval,
        )));
        tracing::info!(
            "{} queue started with {} workers",
            self.shared.name,
            concurrency.max(1)
        );
    }

    /// Add a job.
    pub fn add(
        &self,
        key: impl Into<String>,
        data: T,
        priority: JobPriority,
    ) -> Result<JobId, QueueError> {
        let key = key.into();
        let id = self
            .shared
            .lock()
            .add(key.clone(), data, priority, clock_now())?;
        tracing::debug!(
            "{} queue: added job {} ({}, priority {:?})",
            self.shared.name,
            id,
            key,
            priority
        );
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Per-state job counts.
    pub fn counts(&self) -> JobCounts {
        self.shared.lock().counts()
    }

    /// Copy of a job, while it is live or in recent history.
    pub fn job(&self, id: JobId) -> Option<Job<T>> {
        self.shared.lock().get(id).cloned()
    }

    /// Stop handing out jobs. Running jobs finish normally.
    pub fn pause(&self) {
        self.shared.lock().pause();
        tracing::info!("{} queue paused", self.shared.name);
    }

    /// Resume handing out jobs.
    pub fn resume(&self) {
        self.shared.lock().resume();
        self.shared.wake.notify_waiters();
        tracing::info!("{} queue resumed", self.shared.name);
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.lock().is_paused()
    }

    /// True when nothing is waiting, delayed or running.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Drop finished jobs in `state` that finished at least `grace` ago.
    pub fn clean(&self, state: JobState, grace: Duration) -> usize {
        let removed = self.shared.lock().clean(state, grace, clock_now());
        if removed > 0 {
            tracing::debug!(
                "{} queue: cleaned {} {:?} jobs",
                self.shared.name,
                removed,
                state
            );
        }
        removed
    }

    /// Run one stall check now.
    pub fn reap_stalled(&self) -> Vec<Stalled> {
        reap(&self.shared)
    }

    /// Wait until the queue is idle, polling every `interval`.
    pub async fn wait_idle(&self, interval: Duration) {
        while !self.is_idle() {
            tokio::time::sleep(interval).await;
        }
    }

    /// Abort workers, running handlers and the reaper. Queued jobs stay in
    /// the buffer.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        for entry in self.shared.running.iter() {
            entry.value().1.abort();
        }
        self.shared.running.clear();
        tracing::info!("{} queue stopped", self.shared.name);
    }
}

async fn worker_loop<T, H>(shared: Arc<Shared<T>>, handler: Arc<H>, slot: usize)
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
{
    loop {
        // Register for wake-ups before looking at the buffer so a notify
        // between the check and the wait is not lost.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // Launched under the buffer lock: a lease the reaper reclaims always
        // has its task registered in `running`.
        let (started, ready_at) = {
            let mut buffer = shared.lock();
            let started = buffer
                .next(clock_now())
                .map(|activation| launch(&shared, &handler, activation, slot));
            (started, buffer.next_ready_at())
        };

        match started {
            Some(job) => run_job(&shared, &handler, job, slot).await,
            None => match ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    }
                }
                None => notified.await,
            },
        }
    }
}

/// A leased job whose handler task is running.
struct Started<T> {
    id: JobId,
    data: T,
    token: LeaseToken,
    attempt: u32,
    task: JoinHandle<Result<(), EngineError>>,
}

fn launch<T, H>(
    shared: &Arc<Shared<T>>,
    handler: &Arc<H>,
    activation: Activation<T>,
    slot: usize,
) -> Started<T>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
{
    let Activation {
        id,
        key,
        data,
        token,
        attempt,
    } = activation;
    tracing::debug!(
        "{} queue: worker {} running job {} ({}), attempt {}",
        shared.name,
        slot,
        id,
        key,
        attempt
    );

    let ctx = JobContext {
        id,
        key,
        data: data.clone(),
        attempt,
        token,
        shared: Arc::clone(shared),
    };
    let task_handler = Arc::clone(handler);
    let task = tokio::spawn(async move { task_handler.handle(&ctx).await });
    shared.running.insert(id, (token, task.abort_handle()));

    Started {
        id,
        data,
        token,
        attempt,
        task,
    }
}

async fn run_job<T, H>(shared: &Arc<Shared<T>>, handler: &Arc<H>, job: Started<T>, slot: usize)
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
{
    let Started {
        id,
        data,
        token,
        attempt,
        task,
    } = job;

    let joined = task.await;
    shared.running.remove_if(&id, |_, (held, _)| *held == token);

    let result = match joined {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(join_err) if join_err.is_cancelled() => {
            // The reaper already requeued or failed the job.
            tracing::debug!(
                "{} queue: worker {} released job {}, lease reclaimed",
                shared.name,
                slot,
                id
            );
            return;
        }
        Err(join_err) => Err(format!("job panicked: {}", join_err)),
    };

    let failed_for_good = {
        let mut buffer = shared.lock();
        let now = clock_now();
        match result {
            Ok(()) => match buffer.complete(id, token, now) {
                Ok(()) => {
                    shared.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("{} queue: job {} completed", shared.name, id);
                    None
                }
                Err(e) => {
                    tracing::warn!("{} queue: completion of job {} ignored: {}", shared.name, id, e);
                    None
                }
            },
            Err(reason) => match buffer.fail(id, token, reason.clone(), now) {
                Ok(FailOutcome::Retry { delay }) => {
                    tracing::warn!(
                        "{} queue: job {} failed (attempt {}): {}. Retrying in {}ms",
                        shared.name,
                        id,
                        attempt,
                        reason,
                        delay.as_millis()
                    );
                    None
                }
                Ok(FailOutcome::Failed) => {
                    shared.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "{} queue: job {} failed after {} attempts: {}",
                        shared.name,
                        id,
                        attempt,
                        reason
                    );
                    Some(reason)
                }
                Err(e) => {
                    tracing::warn!("{} queue: failure of job {} ignored: {}", shared.name, id, e);
                    None
                }
            },
        }
    };

    if let Some(reason) = failed_for_good {
        handler.on_failed(&data, &reason);
    }
}

fn reap<T: Clone>(shared: &Shared<T>) -> Vec<Stalled> {
    let stalled = {
        let mut buffer = shared.lock();
        let stalled = buffer.reap_stalled(clock_now());
        for s in &stalled {
            if let Some((_, (_, task))) = shared.running.remove(&s.id) {
                task.abort();
            }
        }
        stalled
    };
    for s in &stalled {
        shared.metrics.jobs_stalled.fetch_add(1, Ordering::Relaxed);
        match s.outcome {
            StallOutcome::Requeued => tracing::warn!(
                "{} queue: job {} ({}) stalled ({} times), requeued",
                shared.name,
                s.id,
                s.key,
                s.stalled_count
            ),
            StallOutcome::Failed => {
                shared.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "{} queue: job {} ({}) stalled {} times, failing",
                    shared.name,
                    s.id,
                    s.key,
                    s.stalled_count
                );
            }
        }
    }
    if stalled.iter().any(|s| s.outcome == StallOutcome::Requeued) {
        shared.wake.notify_waiters();
    }
    stalled
}

async fn reaper_loop<T, H>(shared: Arc<Shared<T>>, handler: Arc<H>, every: Duration)
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
{
    let mut timer = tokio::time::interval(every.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    timer.tick().await;
    loop {
        timer.tick().await;
        for s in reap(&shared) {
            if s.outcome != StallOutcome::Failed {
                continue;
            }
            let data = shared.lock().get(s.id).map(|job| job.data.clone());
            if let Some(data) = data {
                handler.on_failed(&data, sync_core::STALLED_REASON);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    fn options() -> JobOptions {
        JobOptions {
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            lock_duration: Duration::from_secs(60),
            max_stalled_count: 1,
            keep_completed: 10,
            keep_failed: 10,
        }
    }

    fn queue() -> JobQueue<u32> {
        JobQueue::new("test", options(), Arc::new(EngineMetrics::default()))
    }

    /// Records processed payloads; fails payloads listed in `fail_first`
    /// on their first `n` attempts.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        fail_times: u32,
        failed_for_good: Mutex<Vec<(u32, String)>>,
    }

    #[async_trait]
    impl JobHandler<u32> for Recorder {
        async fn handle(&self, job: &JobContext<u32>) -> Result<(), EngineError> {
            self.seen.lock().unwrap().push(job.data);
            if job.attempt <= self.fail_times {
                return Err(EngineError::Validation(format!("attempt {}", job.attempt)));
            }
            Ok(())
        }

        fn on_failed(&self, data: &u32, reason: &str) {
            self.failed_for_good
                .lock()
                .unwrap()
                .push((*data, reason.to_string()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_priority_order() {
        let queue = queue();
        queue.add("low", 3, JobPriority::Low).unwrap();
        queue.add("normal", 2, JobPriority::Normal).unwrap();
        queue.add("high", 1, JobPriority::High).unwrap();

        let handler = Arc::new(Recorder::default());
        queue.start(Arc::clone(&handler), 1, Duration::from_secs(60));
        queue.wait_idle(Duration::from_millis(10)).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.counts().completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_retried_with_backoff() {
        let queue = queue();
        let handler = Arc::new(Recorder {
            fail_times: 2,
            ..Recorder::default()
        });
        queue.start(Arc::clone(&handler), 2, Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        let id = queue.add("job", 7, JobPriority::Normal).unwrap();
        queue.wait_idle(Duration::from_millis(10)).await;

        // 1s then 2s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(*handler.seen.lock().unwrap(), vec![7, 7, 7]);
        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_jobs_fail_and_report_once() {
        let queue = queue();
        let handler = Arc::new(Recorder {
            fail_times: 10,
            ..Recorder::default()
        });
        queue.start(Arc::clone(&handler), 1, Duration::from_secs(60));

        let id = queue.add("job", 9, JobPriority::Normal).unwrap();
        queue.wait_idle(Duration::from_millis(10)).await;

        assert_eq!(handler.seen.lock().unwrap().len(), 3);
        assert_eq!(queue.job(id).unwrap().state, JobState::Failed);
        assert_eq!(
            *handler.failed_for_good.lock().unwrap(),
            vec![(9, "validation failed: attempt 3".to_string())]
        );
        assert_eq!(queue.counts().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_queue_holds_jobs_until_resumed() {
        let queue = queue();
        let handler = Arc::new(Recorder::default());
        queue.start(Arc::clone(&handler), 2, Duration::from_secs(60));
        queue.pause();

        queue.add("a", 1, JobPriority::Normal).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(queue.counts().waiting, 1);

        queue.resume();
        queue.wait_idle(Duration::from_millis(10)).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_live_keys_are_rejected() {
        let queue = queue();
        queue.add("same", 1, JobPriority::Normal).unwrap();
        let err = queue.add("same", 2, JobPriority::Normal).unwrap_err();
        assert_eq!(err, QueueError::DuplicateJob("same".into()));
    }

    struct Sleeper {
        runs: AtomicU32,
        failed: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler<u32> for Sleeper {
        async fn handle(&self, _job: &JobContext<u32>) -> Result<(), EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            // Never reports progress.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn on_failed(&self, _data: &u32, reason: &str) {
            assert_eq!(reason, sync_core::STALLED_REASON);
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_jobs_are_requeued_then_failed() {
        let metrics = Arc::new(EngineMetrics::default());
        let queue = JobQueue::new("stall", options(), Arc::clone(&metrics));
        let handler = Arc::new(Sleeper {
            runs: AtomicU32::new(0),
            failed: AtomicUsize::new(0),
        });
        queue.start(Arc::clone(&handler), 2, Duration::from_secs(30));

        let id = queue.add("slow", 1, JobPriority::Normal).unwrap();
        // Lease 60s, reaper every 30s, one requeue allowed.
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(queue.job(id).unwrap().state, JobState::Failed);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
        assert_eq!(handler.failed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().jobs_stalled, 2);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_reruns_stalled_job_until_it_fails() {
        let metrics = Arc::new(EngineMetrics::default());
        let queue = JobQueue::new("stall", options(), Arc::clone(&metrics));
        let handler = Arc::new(Sleeper {
            runs: AtomicU32::new(0),
            failed: AtomicUsize::new(0),
        });
        queue.start(Arc::clone(&handler), 1, Duration::from_secs(30));

        let id = queue.add("slow", 1, JobPriority::Normal).unwrap();
        tokio::time::sleep(Duration::from_secs(400)).await;

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.stalled_count, options().max_stalled_count + 1);
        assert_eq!(
            handler.runs.load(Ordering::SeqCst),
            options().max_stalled_count + 1
        );
        assert_eq!(handler.failed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts().active, 0);
        queue.shutdown();
    }

    /// Hangs on its first run, succeeds on every later one.
    #[derive(Default)]
    struct HangsOnce {
        runs: AtomicU32,
        done: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl JobHandler<u32> for HangsOnce {
        async fn handle(&self, job: &JobContext<u32>) -> Result<(), EngineError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            self.done.lock().unwrap().push(job.data);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_gives_back_its_worker() {
        let queue = queue();
        let handler = Arc::new(HangsOnce::default());
        queue.start(Arc::clone(&handler), 1, Duration::from_secs(30));

        let hung = queue.add("hung", 1, JobPriority::Normal).unwrap();
        let next = queue.add("next", 2, JobPriority::Normal).unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        let job = queue.job(hung).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.stalled_count, 1);
        assert_eq!(queue.job(next).unwrap().state, JobState::Completed);
        assert_eq!(*handler.done.lock().unwrap(), vec![1, 2]);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert!(queue.is_idle());
    }

    struct Reporter;

    #[async_trait]
    impl JobHandler<u32> for Reporter {
        async fn handle(&self, job: &JobContext<u32>) -> Result<(), EngineError> {
            for step in 0..4u8 {
                tokio::time::sleep(Duration::from_secs(25)).await;
                job.progress(step * 25);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_keeps_long_jobs_alive() {
        let queue = queue();
        queue.start(Arc::new(Reporter), 1, Duration::from_secs(30));

        let id = queue.add("long", 1, JobPriority::Normal).unwrap();
        queue.wait_idle(Duration::from_secs(1)).await;

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.stalled_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_drops_old_history() {
        let queue = queue();
        queue.start(Arc::new(Recorder::default()), 1, Duration::from_secs(60));
        queue.add("a", 1, JobPriority::Normal).unwrap();
        queue.wait_idle(Duration::from_millis(10)).await;

        assert_eq!(queue.clean(JobState::Completed, Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(queue.clean(JobState::Completed, Duration::from_secs(60)), 1);
        assert_eq!(queue.counts().completed, 0);
    }
}

//! Job buffer for crm-sync queues.
//!
//! This module provides the bookkeeping behind one job queue, with:
//! - Priority ordering (high before normal before low, then arrival order)
//! - Duplicate rejection for live jobs sharing a key
//! - Leases: an active job holds a token and a deadline; progress extends it
//! - Stall detection: expired leases go back to waiting, up to a limit
//! - Job-level retries with exponential backoff
//! - Bounded completed/failed history
//!
//! Jobs flow through the buffer in this order:
//! 1. `add()` - job is waiting
//! 2. `next()` - highest-priority waiting job becomes active
//! 3. `complete()` or `fail()` - job finishes, or is delayed for a retry
//!
//! No clocks are read here; every call takes `now`.

use crate::backoff::job_backoff;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Reason recorded when a job exceeds the stall limit.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A waiting, delayed or active job already uses this key.
    DuplicateJob(String),
    /// No job with this id.
    UnknownJob(JobId),
    /// The job is not active under this lease token.
    LockMismatch(JobId),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::DuplicateJob(key) => write!(f, "duplicate job key: {}", key),
            QueueError::UnknownJob(id) => write!(f, "unknown job: {}", id),
            QueueError::LockMismatch(id) => write!(f, "job {} is not locked by this worker", id),
        }
    }
}

impl std::error::Error for QueueError {}

/// Job identifier, unique within one buffer and increasing with arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token proving a worker holds a job's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

/// Dispatch priority. Lower numeric value sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Dispatched first.
    High = 1,
    /// Default.
    #[default]
    Normal = 2,
    /// Dispatched last.
    Low = 3,
}

/// Where a job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to run.
    Waiting,
    /// Leased to a worker.
    Active,
    /// Waiting out a retry backoff.
    Delayed,
    /// Finished successfully.
    Completed,
    /// Finished with no retries left.
    Failed,
}

/// Buffer policy.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Total attempts per job, including the first.
    pub attempts: u32,
    /// Base delay for job retries.
    pub backoff_base: Duration,
    /// Lease length; a job without progress for this long is stalled.
    pub lock_duration: Duration,
    /// Stalls tolerated before the job fails.
    pub max_stalled_count: u32,
    /// Completed jobs kept for inspection.
    pub keep_completed: usize,
    /// Failed jobs kept for inspection.
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_base: Duration::from_secs(1),
            lock_duration: Duration::from_secs(60),
            max_stalled_count: 3,
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LeaseToken,
    deadline: Instant,
}

/// A job and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Job<T> {
    /// Job id.
    pub id: JobId,
    /// Uniqueness key.
    pub key: String,
    /// Payload.
    pub data: T,
    /// Dispatch priority.
    pub priority: JobPriority,
    /// Current state.
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    /// Times the job stalled.
    pub stalled_count: u32,
    /// Last reported progress, 0-100.
    pub progress: u8,
    /// Failure reason of the last failed attempt.
    pub failed_reason: Option<String>,
    /// When the job was added.
    pub enqueued_at: Instant,
    /// When the job was last activated.
    pub processed_at: Option<Instant>,
    /// When the job completed or failed for good.
    pub finished_at: Option<Instant>,
    ready_at: Option<Instant>,
    lease: Option<Lease>,
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Activation<T> {
    /// Job id.
    pub id: JobId,
    /// Uniqueness key.
    pub key: String,
    /// Payload copy.
    pub data: T,
    /// Lease token to present on progress/complete/fail.
    pub token: LeaseToken,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Job will run again after `delay`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// No attempts left.
    Failed,
}

/// What the reaper did with a stalled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    /// Returned to waiting.
    Requeued,
    /// Stall limit exceeded.
    Failed,
}

/// A job found stalled by [`JobBuffer::reap_stalled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stalled {
    /// Job id.
    pub id: JobId,
    /// Uniqueness key.
    pub key: String,
    /// Stall count after this stall.
    pub stalled_count: u32,
    /// What happened.
    pub outcome: StallOutcome,
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Ready to run.
    pub waiting: usize,
    /// Leased to a worker.
    pub active: usize,
    /// Kept in completed history.
    pub completed: usize,
    /// Kept in failed history.
    pub failed: usize,
    /// Waiting out a retry backoff.
    pub delayed: usize,
}

/// Job buffer with lease tracking.
#[derive(Debug)]
pub struct JobBuffer<T> {
    options: JobOptions,
    jobs: HashMap<JobId, Job<T>>,
    live_keys: HashMap<String, JobId>,
    waiting: BTreeSet<(JobPriority, JobId)>,
    delayed: BTreeSet<(Instant, JobId)>,
    active: HashSet<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    next_id: u64,
    next_token: u64,
    paused: bool,
}

impl<T: Clone> JobBuffer<T> {
    /// Create an empty buffer.
    pub fn new(options: JobOptions) -> Self {
        Self {
            options,
            jobs: HashMap::new(),
            live_keys: HashMap::new(),
            waiting: BTreeSet::new(),
            delayed: BTreeSet::new(),
            active: HashSet::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            next_id: 1,
            next_token: 1,
            paused: false,
        }
    }

    /// Buffer policy.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Add a job.
    ///
    /// Returns an error if a live (waiting, delayed or active) job already
    /// uses `key`. Finished jobs do not block their key.
    pub fn add(
        &mut self,
        key: impl Into<String>,
        data: T,
        priority: JobPriority,
        now: Instant,
    ) -> Result<JobId, QueueError> {
        let key = key.into();
        if self.live_keys.contains_key(&key) {
            return Err(QueueError::DuplicateJob(key));
        }

        let id = JobId(self.next_id);
        self.next_id += 1;

        self.live_keys.insert(key.clone(), id);
        self.waiting.insert((priority, id));
        self.jobs.insert(
            id,
            Job {
                id,
                key,
                data,
                priority,
                state: JobState::Waiting,
                attempts_made: 0,
                stalled_count: 0,
                progress: 0,
                failed_reason: None,
                enqueued_at: now,
                processed_at: None,
                finished_at: None,
                ready_at: None,
                lease: None,
            },
        );
        Ok(id)
    }

    /// Lease the highest-priority, oldest waiting job.
    ///
    /// Delayed jobs whose backoff has elapsed are promoted first. Returns
    /// `None` when paused or nothing is ready.
    pub fn next(&mut self, now: Instant) -> Option<Activation<T>> {
        self.promote_delayed(now);
        if self.paused {
            return None;
        }

        let (_, id) = self.waiting.pop_first()?;

        let token = LeaseToken(self.next_token);
        self.next_token += 1;

        let job = self.jobs.get_mut(&id)?;
        job.state = JobState::Active;
        job.processed_at = Some(now);
        job.lease = Some(Lease {
            token,
            deadline: now + self.options.lock_duration,
        });
        self.active.insert(id);

        Some(Activation {
            id,
            key: job.key.clone(),
            data: job.data.clone(),
            token,
            attempt: job.attempts_made + 1,
        })
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some((ready_at, id)) = self.delayed.first().copied() {
            if ready_at > now {
                break;
            }
            self.delayed.remove(&(ready_at, id));
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.ready_at = None;
                self.waiting.insert((job.priority, id));
            }
        }
    }

    fn leased(&mut self, id: JobId, token: LeaseToken) -> Result<&mut Job<T>, QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
        let held = job.state == JobState::Active && job.lease.is_some_and(|l| l.token == token);
        if held {
            Ok(job)
        } else {
            Err(QueueError::LockMismatch(id))
        }
    }

    /// Extend the lease of an active job.
    pub fn extend_lock(&mut self, id: JobId, token: LeaseToken, now: Instant) -> Result<(), QueueError> {
        let lock_duration = self.options.lock_duration;
        let job = self.leased(id, token)?;
        job.lease = Some(Lease {
            token,
            deadline: now + lock_duration,
        });
        Ok(())
    }

    /// Record progress (0-100) and extend the lease.
    pub fn report_progress(
        &mut self,
        id: JobId,
        token: LeaseToken,
        progress: u8,
        now: Instant,
    ) -> Result<(), QueueError> {
        self.extend_lock(id, token, now)?;
        self.leased(id, token)?.progress = progress.min(100);
        Ok(())
    }

    /// Mark an active job completed.
    pub fn complete(&mut self, id: JobId, token: LeaseToken, now: Instant) -> Result<(), QueueError> {
        let job = self.leased(id, token)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.lease = None;
        job.finished_at = Some(now);
        let key = job.key.clone();

        self.active.remove(&id);
        self.live_keys.remove(&key);
        self.completed.push_back(id);
        Self::trim(&mut self.jobs, &mut self.completed, self.options.keep_completed);
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The job is delayed for a retry while attempts remain, otherwise it
    /// moves to failed history.
    pub fn fail(
        &mut self,
        id: JobId,
        token: LeaseToken,
        reason: impl Into<String>,
        now: Instant,
    ) -> Result<FailOutcome, QueueError> {
        let attempts = self.options.attempts;
        let base = self.options.backoff_base;

        let job = self.leased(id, token)?;
        job.attempts_made += 1;
        job.failed_reason = Some(reason.into());
        job.lease = None;

        if job.attempts_made < attempts {
            let delay = job_backoff(job.attempts_made, base);
            let ready_at = now + delay;
            job.state = JobState::Delayed;
            job.ready_at = Some(ready_at);
            self.active.remove(&id);
            self.delayed.insert((ready_at, id));
            return Ok(FailOutcome::Retry { delay });
        }

        self.active.remove(&id);
        self.finish_failed(id, now);
        Ok(FailOutcome::Failed)
    }

    fn finish_failed(&mut self, id: JobId, now: Instant) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Failed;
            job.lease = None;
            job.finished_at = Some(now);
            self.live_keys.remove(&job.key);
        }
        self.failed.push_back(id);
        Self::trim(&mut self.jobs, &mut self.failed, self.options.keep_failed);
    }

    fn trim(jobs: &mut HashMap<JobId, Job<T>>, history: &mut VecDeque<JobId>, keep: usize) {
        while history.len() > keep {
            if let Some(old) = history.pop_front() {
                jobs.remove(&old);
            }
        }
    }

    /// Return active jobs whose lease expired to waiting, or fail them once
    /// they stalled more than `max_stalled_count` times.
    pub fn reap_stalled(&mut self, now: Instant) -> Vec<Stalled> {
        let mut expired: Vec<JobId> = self
            .active
            .iter()
            .copied()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .and_then(|job| job.lease)
                    .map_or(true, |lease| lease.deadline <= now)
            })
            .collect();
        expired.sort();

        let mut stalled = Vec::with_capacity(expired.len());
        for id in expired {
            self.active.remove(&id);
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.lease = None;
            job.stalled_count += 1;
            let stalled_count = job.stalled_count;
            let key = job.key.clone();

            let outcome = if stalled_count > self.options.max_stalled_count {
                job.failed_reason = Some(STALLED_REASON.to_string());
                self.finish_failed(id, now);
                StallOutcome::Failed
            } else {
                job.state = JobState::Waiting;
                self.waiting.insert((job.priority, id));
                StallOutcome::Requeued
            };

            stalled.push(Stalled {
                id,
                key,
                stalled_count,
                outcome,
            });
        }
        stalled
    }

    /// Earliest instant a delayed job becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().next().map(|(at, _)| *at)
    }

    /// Stop handing out jobs. Active jobs keep running.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume handing out jobs.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether the buffer is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Look up a job by id.
    pub fn get(&self, id: JobId) -> Option<&Job<T>> {
        self.jobs.get(&id)
    }

    /// Look up a live job by key.
    pub fn find_live(&self, key: &str) -> Option<&Job<T>> {
        self.live_keys.get(key).and_then(|id| self.jobs.get(id))
    }

    /// Jobs in a given state, oldest first.
    pub fn jobs_in(&self, state: JobState) -> Vec<&Job<T>> {
        let mut jobs: Vec<&Job<T>> = self.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Per-state counts.
    pub fn counts(&self) -> JobCounts {
        JobCounts {
            waiting: self.waiting.len(),
            active: self.active.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            delayed: self.delayed.len(),
        }
    }

    /// True when nothing is waiting, delayed or active.
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.delayed.is_empty() && self.active.is_empty()
    }

    /// Drop finished jobs in `state` that finished at least `grace` ago.
    ///
    /// Only `Completed` and `Failed` are cleanable; other states return 0.
    pub fn clean(&mut self, state: JobState, grace: Duration, now: Instant) -> usize {
        let history = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return 0,
        };

        let jobs = &mut self.jobs;
        let before = history.len();
        history.retain(|id| {
            let expired = jobs
                .get(id)
                .and_then(|j| j.finished_at)
                .map_or(true, |at| now.saturating_duration_since(at) >= grace);
            if expired {
                jobs.remove(id);
            }
            !expired
        });
        before - history.len()
    }
}

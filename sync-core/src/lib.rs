//! # sync-core
//!
//! Pure logic for crm-sync (no I/O, instant tests).
//!
//! This crate implements the decision logic of the sync engine without any
//! network, disk or async runtime, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (remote API, record store, timers) is performed by
//! `sync-client` and `sync-engine`, which drive these structures.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod bucket;
pub mod conflict;
pub mod queue;

pub use backoff::{calculate_backoff, job_backoff};
pub use bucket::{BucketStatus, TokenBucket};
pub use conflict::{
    detect, detect_conflict, find_conflicting_fields, merge_fields, open_conflict, priority_for,
    refresh_conflict, resolve, Detection, Resolution, ResolutionError, COMPARABLE_FIELDS,
};
pub use queue::{
    Activation, FailOutcome, Job, JobBuffer, JobCounts, JobId, JobOptions, JobPriority, JobState,
    LeaseToken, QueueError, StallOutcome, Stalled, STALLED_REASON,
};

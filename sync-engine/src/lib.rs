//! # sync-engine
//!
//! Bidirectional sync service between a local record store and a remote CRM.
//!
//! This crate implements the engine that:
//! - Pushes local contact and company edits to the remote CRM
//! - Pulls remote changes, one record at a time or by full batch scan
//! - Detects divergent concurrent edits and records them as conflicts
//! - Resolves conflicts manually (keep local, keep remote, field merge) or
//!   by an automatic policy
//! - Logs every attempt and retries failed jobs with backoff
//!
//! ## Architecture
//!
//! ```text
//!  local edits ──► outbound-sync ──┐              ┌──► notifications
//!                                  │              │
//!  webhooks ─────► inbound-sync ───┼─► orchestrator ─┼──► conflicts
//!                                  │      │       │
//!  scheduler ────► batch-poll ─────┘      │       └──► attempt logs
//!                                         ▼
//!                              rate-limited CRM client
//! ```
//!
//! Every job runs under a per-record lock, so the stored snapshot a conflict
//! check reads is never overwritten between the check and the write.
//!
//! ## Example
//!
//! ```ignore
//! let config = Config::from_file(Path::new("crm-sync.toml"))?;
//! init_tracing(&config.logging);
//!
//! let store = SyncEngine::open_store(&config.storage).await?;
//! let engine = Arc::new(SyncEngine::new(config, store, remote)?);
//! engine.start();
//!
//! engine.enqueue_batch_poll(PollTarget::All)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod conflicts;
pub mod engine;
pub mod error;
pub mod http;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use conflicts::{ConflictService, LastWriterWins, ManualResolution, ResolutionPolicy};
pub use engine::{SyncEngine, SyncStats};
pub use error::{EngineError, ErrorKind, Result, StoreError};
pub use jobs::{InboundEvent, PollCounts, PollTarget, QueueStats};
pub use notify::SyncNotification;
pub use orchestrator::{SyncOrchestrator, SyncOutcome};
pub use store::{MemoryStore, Page, Paged, RecordStore, SqliteStore};
pub use telemetry::init_tracing;

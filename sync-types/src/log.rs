//! Append-only sync attempt logs.
//!
//! One [`SyncLog`] is written per orchestration attempt. It is opened as
//! `pending` and finalized exactly once as `success` or `failed` by the
//! attempt that opened it. The only later transition is an operator retry,
//! which bumps a failed log to `retrying`.

use crate::entity::{Direction, EntityType};
use crate::error::LogError;
use crate::ids::{EntityId, LogId, RemoteId};
use crate::time::Timestamp;
use crate::value::Fields;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the attempt did to the target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Record created on the target side.
    Create,
    /// Record updated on the target side.
    Update,
    /// Record archived / soft-deleted on the target side.
    Delete,
}

impl SyncAction {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Attempt in progress.
    Pending,
    /// Attempt succeeded.
    Success,
    /// Attempt failed (including aborted by conflict).
    Failed,
    /// Failed attempt re-queued by an operator.
    Retrying,
}

impl LogStatus {
    /// Every status.
    pub const ALL: [LogStatus; 4] = [
        LogStatus::Pending,
        LogStatus::Success,
        LogStatus::Failed,
        LogStatus::Retrying,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one synchronization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    /// Log id.
    pub id: LogId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Local entity, once known. Inbound creates learn it mid-attempt.
    pub entity_id: Option<EntityId>,
    /// Remote id, once known.
    pub remote_id: Option<RemoteId>,
    /// What the attempt did.
    pub action: SyncAction,
    /// Which way data flowed.
    pub direction: Direction,
    /// Lifecycle status.
    pub status: LogStatus,
    /// Short error message.
    pub error_message: Option<String>,
    /// Full error chain.
    pub error_detail: Option<String>,
    /// Number of operator retries.
    pub retry_count: u32,
    /// Snapshot of what was sent or received.
    pub payload: Option<Fields>,
    /// Snapshot of the remote response.
    pub response: Option<Fields>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: Option<u64>,
    /// When the attempt started.
    pub created_at: Timestamp,
    /// When the attempt was finalized.
    pub completed_at: Option<Timestamp>,
}

impl SyncLog {
    /// Open a pending log.
    pub fn open(
        entity_type: EntityType,
        direction: Direction,
        action: SyncAction,
        now: Timestamp,
    ) -> Self {
        Self {
            id: LogId::new(),
            entity_type,
            entity_id: None,
            remote_id: None,
            action,
            direction,
            status: LogStatus::Pending,
            error_message: None,
            error_detail: None,
            retry_count: 0,
            payload: None,
            response: None,
            duration_ms: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Attach the local entity id.
    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Attach the remote id.
    pub fn with_remote_id(mut self, remote_id: Option<RemoteId>) -> Self {
        self.remote_id = remote_id;
        self
    }

    /// Attach the payload snapshot.
    pub fn with_payload(mut self, payload: Fields) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True once the log reached `success` or `failed`.
    pub fn is_finalized(&self) -> bool {
        self.status != LogStatus::Pending
    }

    /// Finalize as success.
    pub fn succeed(&mut self, response: Option<Fields>, now: Timestamp) -> Result<(), LogError> {
        self.finalize(now)?;
        self.status = LogStatus::Success;
        self.response = response;
        Ok(())
    }

    /// Finalize as failed.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        detail: Option<String>,
        now: Timestamp,
    ) -> Result<(), LogError> {
        self.finalize(now)?;
        self.status = LogStatus::Failed;
        self.error_message = Some(message.into());
        self.error_detail = detail;
        Ok(())
    }

    fn finalize(&mut self, now: Timestamp) -> Result<(), LogError> {
        if self.is_finalized() {
            return Err(LogError::AlreadyFinalized(self.id.to_string()));
        }
        self.completed_at = Some(now);
        self.duration_ms = Some(now.saturating_sub(self.created_at).max(0) as u64);
        Ok(())
    }

    /// Bump a failed log to `retrying` after an operator re-queued it.
    pub fn mark_retrying(&mut self) -> Result<(), LogError> {
        if self.status != LogStatus::Failed {
            return Err(LogError::NotRetryable {
                id: self.id.to_string(),
                status: self.status.to_string(),
            });
        }
        self.status = LogStatus::Retrying;
        self.retry_count += 1;
        Ok(())
    }
}

//! Remote CRM abstraction for crm-sync.
//!
//! This module provides a pluggable remote layer that abstracts the
//! underlying CRM API (a real HTTP client, or a mock for testing).
//!
//! # Design
//!
//! The remote trait is async and per-record:
//! - `get()` fetches the current remote snapshot
//! - `create()` / `update()` write a snapshot and return what the remote stored
//! - `archive()` soft-deletes on the remote side
//! - `list_page()` walks all records of a type with a cursor
//!
//! Every failure is a [`RemoteError`] that can be classified with
//! [`RemoteError::is_retryable`].
//!
//! # Example
//!
//! ```ignore
//! let remote = MockRemote::new();
//! let created = remote.create(&data).await?;
//! let page = remote.list_page(EntityType::Contact, 100, None).await?;
//! ```

mod mock;

pub use mock::{MockRemote, RemoteCall};

use async_trait::async_trait;
use std::fmt;
use sync_types::{EntityData, EntityType, RemoteId, RemoteRecord};
use thiserror::Error;

/// Network failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Connection reset by peer.
    ConnectionReset,
    /// Request timed out.
    TimedOut,
    /// Host name did not resolve.
    DnsFailure,
    /// Anything else.
    Other,
}

impl NetworkErrorKind {
    /// True for the classes worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionReset => "connection reset",
            Self::TimedOut => "timed out",
            Self::DnsFailure => "dns failure",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Remote API errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote answered with a non-success status.
    #[error("remote returned {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Message reported by the remote.
        message: String,
    },

    /// The request never got an answer.
    #[error("network error ({kind}): {message}")]
    Network {
        /// Failure class.
        kind: NetworkErrorKind,
        /// Detail.
        message: String,
    },

    /// The record does not exist (or is archived) on the remote.
    #[error("remote record not found: {0}")]
    NotFound(String),

    /// The response could not be understood.
    #[error("could not decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Rate-limit error, as the remote reports it.
    pub fn rate_limited() -> Self {
        Self::Status {
            code: 429,
            message: "rate limit exceeded".into(),
        }
    }

    /// Status code, when the remote answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Retries on 429, on 5xx, on connection reset/timeout/DNS failures and
    /// on messages reporting a rate limit or temporary unavailability. Other
    /// client errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { code: 429, .. } => true,
            Self::Status { code, .. } if *code >= 500 => true,
            Self::Network { kind, .. } if kind.is_transient() => true,
            Self::NotFound(_) | Self::Decode(_) => false,
            Self::Status { message, .. } | Self::Network { message, .. } => {
                let message = message.to_lowercase();
                message.contains("rate limit") || message.contains("temporarily unavailable")
            }
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records on this page.
    pub records: Vec<RemoteRecord>,
    /// Cursor for the next page, `None` on the last page.
    pub next: Option<String>,
}

/// Remote CRM operations consumed by the sync engine.
///
/// Implementations handle the wire protocol (HTTP client, mock, etc).
#[async_trait]
pub trait RemoteCrm: Send + Sync {
    /// Fetch one record.
    async fn get(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Create a record and return it with its new remote id.
    async fn create(&self, data: &EntityData) -> Result<RemoteRecord, RemoteError>;

    /// Overwrite a record's fields.
    async fn update(
        &self,
        remote_id: &RemoteId,
        data: &EntityData,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Archive (soft-delete) a record.
    async fn archive(&self, entity_type: EntityType, remote_id: &RemoteId)
        -> Result<(), RemoteError>;

    /// List records of one type, `limit` at a time, starting after `after`.
    async fn list_page(
        &self,
        entity_type: EntityType,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Page, RemoteError>;
}

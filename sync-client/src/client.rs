//! CrmClient - the remote side of crm-sync.
//!
//! This module provides [`CrmClient`], which wraps any [`RemoteCrm`] so that
//! every call is retried and rate limited.
//!
//! # Architecture
//!
//! Each logical call is wrapped by the retry executor first, and the whole
//! retrying call is submitted to the rate limiter as one unit. A call spends
//! exactly one token no matter how many retries it needs.
//!
//! ```text
//! Engine → CrmClient → RateLimiter → with_retry → RemoteCrm → Network
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sync_client::{CrmClient, MockRemote, RateLimiter, RetryPolicy};
//!
//! let remote = Arc::new(MockRemote::new());
//! let limiter = RateLimiter::new(100, Duration::from_secs(10));
//! let client = CrmClient::new(remote, limiter, RetryPolicy::default());
//!
//! let record = client.get(EntityType::Contact, &remote_id).await?;
//! ```

use crate::limiter::{RateLimitStatus, RateLimiter};
use crate::remote::{Page, RemoteCrm, RemoteError};
use crate::retry::{with_retry, RetryPolicy};
use std::sync::Arc;
use sync_types::{EntityData, EntityType, RemoteId, RemoteRecord};

fn retryable(err: &RemoteError, _attempt: u32) -> bool {
    err.is_retryable()
}

/// Rate-limited, retrying remote CRM client.
pub struct CrmClient<R: RemoteCrm + ?Sized = dyn RemoteCrm> {
    remote: Arc<R>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl<R: RemoteCrm + ?Sized> CrmClient<R> {
    /// Create a client.
    pub fn new(remote: Arc<R>, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            remote,
            limiter,
            retry,
        }
    }

    /// The wrapped remote.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// The shared rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Rate limiter status.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    /// Fetch a record by remote id.
    pub async fn get(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<RemoteRecord, RemoteError> {
        let context = format!("get_{}({})", entity_type, remote_id);
        self.limiter
            .execute(|| {
                with_retry(&self.retry, &context, retryable, || {
                    self.remote.get(entity_type, remote_id)
                })
            })
            .await
    }

    /// Create a record.
    pub async fn create(&self, data: &EntityData) -> Result<RemoteRecord, RemoteError> {
        let context = format!("create_{}", data.entity_type());
        let record = self
            .limiter
            .execute(|| with_retry(&self.retry, &context, retryable, || self.remote.create(data)))
            .await?;
        tracing::info!(
            "Created {} in remote: {}",
            data.entity_type(),
            record.remote_id
        );
        Ok(record)
    }

    /// Update a record.
    pub async fn update(
        &self,
        remote_id: &RemoteId,
        data: &EntityData,
    ) -> Result<RemoteRecord, RemoteError> {
        let context = format!("update_{}({})", data.entity_type(), remote_id);
        let record = self
            .limiter
            .execute(|| {
                with_retry(&self.retry, &context, retryable, || {
                    self.remote.update(remote_id, data)
                })
            })
            .await?;
        tracing::info!("Updated {} in remote: {}", data.entity_type(), remote_id);
        Ok(record)
    }

    /// Archive a record.
    pub async fn archive(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<(), RemoteError> {
        let context = format!("archive_{}({})", entity_type, remote_id);
        self.limiter
            .execute(|| {
                with_retry(&self.retry, &context, retryable, || {
                    self.remote.archive(entity_type, remote_id)
                })
            })
            .await?;
        tracing::info!("Archived {} in remote: {}", entity_type, remote_id);
        Ok(())
    }

    /// Fetch one page of records.
    pub async fn list_page(
        &self,
        entity_type: EntityType,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let context = format!("list_{}", entity_type);
        self.limiter
            .execute(|| {
                with_retry(&self.retry, &context, retryable, || {
                    self.remote.list_page(entity_type, limit, after)
                })
            })
            .await
    }
}

impl<R: RemoteCrm + ?Sized> std::fmt::Debug for CrmClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmClient")
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

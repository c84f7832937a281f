//! # sync-client
//!
//! Remote CRM side of crm-sync.
//!
//! This is the library the sync engine uses to talk to the remote CRM.
//!
//! ## Features
//!
//! - **Remote Abstraction**: Pluggable [`RemoteCrm`] trait (HTTP client, mock)
//! - **Error Classification**: [`RemoteError::is_retryable`] separates transient from permanent failures
//! - **Rate Limiting**: FIFO token-bucket [`RateLimiter`] shared by all callers
//! - **Retries**: [`with_retry`] with jittered exponential backoff
//! - **Composition**: [`CrmClient`] spends one token per logical call, retries included
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{CrmClient, MockRemote, RateLimiter, RetryPolicy};
//!
//! let client = CrmClient::new(
//!     Arc::new(MockRemote::new()),
//!     RateLimiter::new(100, Duration::from_secs(10)),
//!     RetryPolicy::default(),
//! );
//!
//! let created = client.create(&data).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod limiter;
pub mod remote;
pub mod retry;

pub use client::CrmClient;
pub use limiter::{RateLimitStatus, RateLimiter};
pub use remote::{MockRemote, NetworkErrorKind, Page, RemoteCall, RemoteCrm, RemoteError};
pub use retry::{with_retry, RetryPolicy};

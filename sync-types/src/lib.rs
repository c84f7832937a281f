//! # sync-types
//!
//! Data model shared by the crm-sync crates.
//!
//! - [`EntityId`], [`ConflictId`], [`LogId`], [`RemoteId`] - Identity types
//! - [`Entity`], [`EntityData`], [`SyncEnvelope`] - Records and sync metadata
//! - [`FieldValue`], [`Fields`] - Schemaless scalar field maps
//! - [`SyncLog`] - Append-only attempt log
//! - [`Conflict`] - Conflict record and resolution types
//! - [`ValueError`], [`LogError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod conflict;
mod entity;
mod error;
mod ids;
mod log;
mod time;
mod value;

pub use conflict::{
    AuditEntry, Conflict, ConflictPriority, FieldChoice, FieldChoices, ResolutionType,
    SYSTEM_ACTOR,
};
pub use entity::{
    Company, Contact, Direction, Entity, EntityData, EntityType, RemoteRecord, SyncDirection,
    SyncEnvelope, SyncStatus, CUSTOM_FIELD_PREFIX,
};
pub use error::{LogError, ValueError};
pub use ids::{ConflictId, EntityId, LogId, RemoteId};
pub use log::{LogStatus, SyncAction, SyncLog};
pub use time::{now_millis, Timestamp};
pub use value::{fields_from_json, FieldValue, Fields};

//! Conflict records.
//!
//! A [`Conflict`] captures a divergence between local and remote versions of
//! one entity. The transition logic lives in `crm-sync-core`; this module only
//! defines the data.

use crate::entity::EntityType;
use crate::ids::{ConflictId, EntityId, RemoteId};
use crate::time::Timestamp;
use crate::value::Fields;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a conflict was (or will be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    /// Not yet resolved.
    Pending,
    /// Local snapshot wins.
    KeepLocal,
    /// Remote snapshot wins.
    KeepRemote,
    /// Field-by-field merge.
    Merged,
    /// Settled by an automatic policy.
    AutoResolved,
}

impl ResolutionType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::Merged => "merged",
            Self::AutoResolved => "auto_resolved",
        }
    }

    /// True for everything but [`ResolutionType::Pending`].
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ResolutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "keep_local" => Ok(Self::KeepLocal),
            "keep_remote" => Ok(Self::KeepRemote),
            "merged" => Ok(Self::Merged),
            "auto_resolved" => Ok(Self::AutoResolved),
            other => Err(format!("unknown resolution type: {}", other)),
        }
    }
}

/// Review priority, derived from the number of conflicting fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPriority {
    /// Low priority.
    Low,
    /// One or two fields differ.
    Medium,
    /// More than two fields differ.
    High,
}

impl ConflictPriority {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Which side a merge takes for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChoice {
    /// Keep the local value.
    Local,
    /// Take the remote value.
    Remote,
}

/// Per-field merge choices keyed by field name.
pub type FieldChoices = BTreeMap<String, FieldChoice>;

/// One entry in a conflict's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Action name, e.g. `conflict_detected`.
    pub action: String,
    /// Who did it.
    pub actor: String,
    /// When.
    pub at: Timestamp,
    /// Free-form details.
    pub details: serde_json::Value,
}

/// Actor name used for entries written by the engine itself.
pub const SYSTEM_ACTOR: &str = "system";

/// A detected divergence between local and remote versions of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Local entity.
    pub entity_id: EntityId,
    /// Remote id, if the entity had one at detection time.
    pub remote_id: Option<RemoteId>,
    /// Full local snapshot.
    pub local_data: Fields,
    /// Full remote snapshot.
    pub remote_data: Fields,
    /// Comparable fields whose values differ.
    pub conflicting_fields: Vec<String>,
    /// Local last-modified time at detection.
    pub local_timestamp: Timestamp,
    /// Remote last-modified time at detection.
    pub remote_timestamp: Timestamp,
    /// When the conflict was first detected.
    pub detected_at: Timestamp,
    /// Resolution state.
    pub resolution_type: ResolutionType,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<Timestamp>,
    /// Snapshot written back by the resolution.
    pub merged_data: Option<Fields>,
    /// Review priority.
    pub priority: ConflictPriority,
    /// Append-only audit trail.
    pub audit_trail: Vec<AuditEntry>,
}

impl Conflict {
    /// True while the conflict awaits resolution.
    pub fn is_pending(&self) -> bool {
        self.resolution_type == ResolutionType::Pending
    }

    /// Append an audit entry.
    pub fn audit(
        &mut self,
        action: impl Into<String>,
        actor: impl Into<String>,
        at: Timestamp,
        details: serde_json::Value,
    ) {
        self.audit_trail.push(AuditEntry {
            action: action.into(),
            actor: actor.into(),
            at,
            details,
        });
    }
}

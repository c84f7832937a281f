//! Conflict detection and resolution.
//!
//! A conflict exists only when both sides changed since the last successful
//! sync *and* at least one comparable field now differs. If only one side
//! changed, that side wins silently and the caller writes through.
//!
//! Resolution is a one-way transition `pending -> {keep_local, keep_remote,
//! merged, auto_resolved}`. [`resolve`] enforces it and produces the snapshot
//! that the caller applies to the entity.

use serde_json::json;
use std::collections::BTreeSet;
use sync_types::{
    Conflict, ConflictId, ConflictPriority, Entity, FieldChoice, FieldChoices, Fields,
    RemoteRecord, ResolutionType, Timestamp, SYSTEM_ACTOR,
};

/// Fields compared when looking for conflicting values.
pub const COMPARABLE_FIELDS: [&str; 7] = [
    "first_name",
    "last_name",
    "email",
    "phone",
    "name",
    "domain",
    "industry",
];

/// Error type for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The conflict is already in a terminal state.
    AlreadyResolved(ConflictId),
    /// A merge was requested without a choice for every conflicting field.
    MissingFieldChoices {
        /// Conflicting fields that have no choice.
        missing: Vec<String>,
    },
    /// A merge choice names a field neither snapshot knows.
    UnknownField(String),
    /// The requested resolution type cannot be applied by a caller.
    InvalidResolution(ResolutionType),
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionError::AlreadyResolved(id) => write!(f, "conflict {} already resolved", id),
            ResolutionError::MissingFieldChoices { missing } if missing.is_empty() => {
                write!(f, "field choices are required for merged resolution")
            }
            ResolutionError::MissingFieldChoices { missing } => {
                write!(f, "missing field choices for: {}", missing.join(", "))
            }
            ResolutionError::UnknownField(field) => {
                write!(f, "field choice for unknown field: {}", field)
            }
            ResolutionError::InvalidResolution(t) => write!(f, "invalid resolution type: {}", t),
        }
    }
}

impl std::error::Error for ResolutionError {}

/// Result of a positive detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Comparable fields whose values differ.
    pub conflicting_fields: Vec<String>,
    /// Local last-modified time.
    pub local_timestamp: Timestamp,
    /// Remote last-modified time.
    pub remote_timestamp: Timestamp,
}

impl Detection {
    /// Review priority for this detection.
    pub fn priority(&self) -> ConflictPriority {
        priority_for(self.conflicting_fields.len())
    }
}

/// Detect a conflict between a local entity and its remote counterpart.
///
/// `last_synced_at` of `None` counts as 0.
pub fn detect_conflict(local: &Entity, remote: &RemoteRecord) -> Option<Detection> {
    detect(
        &local.snapshot(),
        local.envelope.last_modified_local,
        &remote.snapshot(),
        remote.last_modified,
        local.envelope.last_synced_at.unwrap_or(0),
    )
}

/// Snapshot-level detection.
pub fn detect(
    local: &Fields,
    local_modified: Timestamp,
    remote: &Fields,
    remote_modified: Timestamp,
    last_synced_at: Timestamp,
) -> Option<Detection> {
    let local_after_sync = local_modified > last_synced_at;
    let remote_after_sync = remote_modified > last_synced_at;
    if !(local_after_sync && remote_after_sync) {
        return None;
    }

    let conflicting_fields = find_conflicting_fields(local, remote);
    if conflicting_fields.is_empty() {
        return None;
    }

    Some(Detection {
        conflicting_fields,
        local_timestamp: local_modified,
        remote_timestamp: remote_modified,
    })
}

/// Comparable fields where both sides have a value and the values differ.
///
/// A field missing on either side is never conflicting.
pub fn find_conflicting_fields(local: &Fields, remote: &Fields) -> Vec<String> {
    COMPARABLE_FIELDS
        .iter()
        .filter(|field| match (local.get(**field), remote.get(**field)) {
            (Some(l), Some(r)) => l != r,
            _ => false,
        })
        .map(|field| field.to_string())
        .collect()
}

/// High when more than two fields conflict, medium otherwise.
pub fn priority_for(conflicting: usize) -> ConflictPriority {
    if conflicting > 2 {
        ConflictPriority::High
    } else {
        ConflictPriority::Medium
    }
}

/// Build a new pending conflict record.
pub fn open_conflict(
    local: &Entity,
    remote: &RemoteRecord,
    detection: &Detection,
    now: Timestamp,
) -> Conflict {
    let mut conflict = Conflict {
        id: ConflictId::new(),
        entity_type: local.entity_type(),
        entity_id: local.id,
        remote_id: local
            .remote_id
            .clone()
            .or_else(|| Some(remote.remote_id.clone())),
        local_data: local.snapshot(),
        remote_data: remote.snapshot(),
        conflicting_fields: detection.conflicting_fields.clone(),
        local_timestamp: detection.local_timestamp,
        remote_timestamp: detection.remote_timestamp,
        detected_at: now,
        resolution_type: ResolutionType::Pending,
        resolved_by: None,
        resolved_at: None,
        merged_data: None,
        priority: detection.priority(),
        audit_trail: Vec::new(),
    };
    conflict.audit(
        "conflict_detected",
        SYSTEM_ACTOR,
        now,
        json!({ "conflicting_fields": detection.conflicting_fields }),
    );
    conflict
}

/// Refresh a still-pending conflict with a newer divergence.
///
/// Keeps the record id so an entity never has two unresolved conflicts.
pub fn refresh_conflict(
    conflict: &mut Conflict,
    local: &Entity,
    remote: &RemoteRecord,
    detection: &Detection,
    now: Timestamp,
) -> Result<(), ResolutionError> {
    if !conflict.is_pending() {
        return Err(ResolutionError::AlreadyResolved(conflict.id));
    }
    conflict.local_data = local.snapshot();
    conflict.remote_data = remote.snapshot();
    conflict.conflicting_fields = detection.conflicting_fields.clone();
    conflict.local_timestamp = detection.local_timestamp;
    conflict.remote_timestamp = detection.remote_timestamp;
    conflict.priority = detection.priority();
    conflict.audit(
        "conflict_redetected",
        SYSTEM_ACTOR,
        now,
        json!({ "conflicting_fields": detection.conflicting_fields }),
    );
    Ok(())
}

/// Start from `local`; every field chosen as remote takes the remote value.
///
/// A field chosen as remote that the remote snapshot lacks is removed.
pub fn merge_fields(local: &Fields, remote: &Fields, choices: &FieldChoices) -> Fields {
    let mut merged = local.clone();
    for (field, choice) in choices {
        if *choice == FieldChoice::Remote {
            match remote.get(field) {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }
    }
    merged
}

/// A resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local snapshot wins.
    KeepLocal,
    /// Remote snapshot wins.
    KeepRemote,
    /// Field-by-field merge.
    Merged(FieldChoices),
    /// Automatic policy picked one side wholesale.
    Auto(FieldChoice),
}

impl Resolution {
    /// Build a caller request from its wire parts.
    ///
    /// Only `keep_local`, `keep_remote` and `merged` are accepted.
    pub fn from_request(
        resolution_type: ResolutionType,
        field_choices: Option<FieldChoices>,
    ) -> Result<Self, ResolutionError> {
        match resolution_type {
            ResolutionType::KeepLocal => Ok(Self::KeepLocal),
            ResolutionType::KeepRemote => Ok(Self::KeepRemote),
            ResolutionType::Merged => Ok(Self::Merged(field_choices.unwrap_or_default())),
            other => Err(ResolutionError::InvalidResolution(other)),
        }
    }

    /// Resolution type recorded on the conflict.
    pub fn resolution_type(&self) -> ResolutionType {
        match self {
            Self::KeepLocal => ResolutionType::KeepLocal,
            Self::KeepRemote => ResolutionType::KeepRemote,
            Self::Merged(_) => ResolutionType::Merged,
            Self::Auto(_) => ResolutionType::AutoResolved,
        }
    }
}

/// Apply a resolution, returning the merged snapshot.
///
/// Fails without touching the record if it is already resolved or the merge
/// choices are invalid.
pub fn resolve(
    conflict: &mut Conflict,
    resolution: &Resolution,
    resolved_by: &str,
    now: Timestamp,
) -> Result<Fields, ResolutionError> {
    if !conflict.is_pending() {
        return Err(ResolutionError::AlreadyResolved(conflict.id));
    }

    let merged = match resolution {
        Resolution::KeepLocal | Resolution::Auto(FieldChoice::Local) => conflict.local_data.clone(),
        Resolution::KeepRemote | Resolution::Auto(FieldChoice::Remote) => {
            conflict.remote_data.clone()
        }
        Resolution::Merged(choices) => {
            validate_choices(conflict, choices)?;
            merge_fields(&conflict.local_data, &conflict.remote_data, choices)
        }
    };

    let resolution_type = resolution.resolution_type();
    conflict.resolution_type = resolution_type;
    conflict.resolved_by = Some(resolved_by.to_string());
    conflict.resolved_at = Some(now);
    conflict.merged_data = Some(merged.clone());
    conflict.audit(
        "conflict_resolved",
        resolved_by,
        now,
        json!({ "resolution_type": resolution_type, "merged_data": merged }),
    );
    Ok(merged)
}

fn validate_choices(conflict: &Conflict, choices: &FieldChoices) -> Result<(), ResolutionError> {
    if choices.is_empty() {
        return Err(ResolutionError::MissingFieldChoices {
            missing: Vec::new(),
        });
    }

    let known: BTreeSet<&str> = conflict
        .local_data
        .keys()
        .chain(conflict.remote_data.keys())
        .map(String::as_str)
        .chain(COMPARABLE_FIELDS)
        .collect();
    if let Some(unknown) = choices.keys().find(|k| !known.contains(k.as_str())) {
        return Err(ResolutionError::UnknownField(unknown.clone()));
    }

    let missing: Vec<String> = conflict
        .conflicting_fields
        .iter()
        .filter(|f| !choices.contains_key(*f))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ResolutionError::MissingFieldChoices { missing });
    }
    Ok(())
}

//! Entity records and their sync envelope.
//!
//! An [`Entity`] is a contact or a company as stored locally. Its
//! [`SyncEnvelope`] tracks how it relates to the remote copy.
//!
//! Mutations come in two flavours:
//! - **content mutations** ([`Entity::edit`], [`Entity::replace_data`],
//!   [`Entity::mark_deleted`]) bump `version` and `last_modified_local`;
//! - **sync-metadata writes** ([`Entity::set_sync_status`],
//!   [`Entity::record_synced`], [`Entity::adopt_remote`]) never do, so
//!   they cannot look like user edits to conflict detection.

use crate::error::ValueError;
use crate::ids::{EntityId, RemoteId};
use crate::time::Timestamp;
use crate::value::{FieldValue, Fields};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix used for custom fields inside a snapshot.
pub const CUSTOM_FIELD_PREFIX: &str = "custom.";

/// Kind of entity being synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A person.
    Contact,
    /// An organisation.
    Company,
}

impl EntityType {
    /// Every entity type, in polling order.
    pub const ALL: [EntityType; 2] = [EntityType::Contact, EntityType::Company];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Company => "company",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "company" => Ok(Self::Company),
            other => Err(ValueError::InvalidValue {
                field: "entity_type".into(),
                reason: format!("unknown entity type '{}'", other),
            }),
        }
    }
}

/// Outcome of the last synchronization of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local and remote agree.
    Synced,
    /// Local changes not yet written through.
    Pending,
    /// Divergent edits detected; waiting for resolution.
    Conflict,
    /// Last attempt failed.
    Error,
}

impl SyncStatus {
    /// Every status.
    pub const ALL: [SyncStatus; 4] = [
        SyncStatus::Synced,
        SyncStatus::Pending,
        SyncStatus::Conflict,
        SyncStatus::Error,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a single sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local to remote CRM.
    ToRemote,
    /// Remote CRM to local.
    FromRemote,
}

impl Direction {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToRemote => "to_remote",
            Self::FromRemote => "from_remote",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the last successful sync, as recorded on the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Last written local to remote.
    ToRemote,
    /// Last written remote to local.
    FromRemote,
    /// Both directions.
    Bidirectional,
    /// Never synced.
    #[default]
    None,
}

impl From<Direction> for SyncDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::ToRemote => Self::ToRemote,
            Direction::FromRemote => Self::FromRemote,
        }
    }
}

/// Sync metadata shared by every entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Outcome of the last sync.
    pub sync_status: SyncStatus,
    /// Last local content mutation.
    pub last_modified_local: Timestamp,
    /// Remote's own last-modified time, only ever taken from remote responses.
    pub last_modified_remote: Option<Timestamp>,
    /// Last successful sync in either direction.
    pub last_synced_at: Option<Timestamp>,
    /// Direction of the last successful sync.
    pub sync_direction: SyncDirection,
    /// Incremented on each local content mutation.
    pub version: u64,
}

impl SyncEnvelope {
    /// Envelope for a record created locally.
    pub fn new_local(now: Timestamp) -> Self {
        Self {
            sync_status: SyncStatus::Pending,
            last_modified_local: now,
            last_modified_remote: None,
            last_synced_at: None,
            sync_direction: SyncDirection::None,
            version: 1,
        }
    }
}

/// Contact domain fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Email address (required).
    pub email: String,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
    /// Local company this contact belongs to.
    pub company: Option<EntityId>,
    /// Schemaless custom fields.
    #[serde(default)]
    pub custom_fields: Fields,
}

impl Contact {
    /// Contact with only an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            first_name: None,
            last_name: None,
            phone: None,
            company: None,
            custom_fields: Fields::new(),
        }
    }

    /// Set the given and family name.
    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    /// Set the phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// "First Last", trimmed.
    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string()
    }
}

/// Company domain fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    /// Company name (required).
    pub name: String,
    /// Web domain, lowercase.
    pub domain: Option<String>,
    /// Industry label.
    pub industry: Option<String>,
    /// Schemaless custom fields.
    #[serde(default)]
    pub custom_fields: Fields,
}

impl Company {
    /// Company with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            industry: None,
            custom_fields: Fields::new(),
        }
    }

    /// Set the web domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into().to_lowercase());
        self
    }

    /// Set the industry.
    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }
}

/// Domain fields of either entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityData {
    /// Contact fields.
    Contact(Contact),
    /// Company fields.
    Company(Company),
}

impl EntityData {
    /// Which entity type this data belongs to.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Contact(_) => EntityType::Contact,
            Self::Company(_) => EntityType::Company,
        }
    }

    /// Flatten the domain fields into a snapshot map.
    ///
    /// Unset optional fields are omitted so they never take part in
    /// field comparison. Custom fields are prefixed with
    /// [`CUSTOM_FIELD_PREFIX`].
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        let custom = match self {
            Self::Contact(c) => {
                put(&mut fields, "email", Some(&c.email));
                put(&mut fields, "first_name", c.first_name.as_ref());
                put(&mut fields, "last_name", c.last_name.as_ref());
                put(&mut fields, "phone", c.phone.as_ref());
                if let Some(company) = c.company {
                    fields.insert("company".into(), FieldValue::String(company.to_string()));
                }
                &c.custom_fields
            }
            Self::Company(c) => {
                put(&mut fields, "name", Some(&c.name));
                put(&mut fields, "domain", c.domain.as_ref());
                put(&mut fields, "industry", c.industry.as_ref());
                &c.custom_fields
            }
        };
        for (key, value) in custom {
            fields.insert(format!("{}{}", CUSTOM_FIELD_PREFIX, key), value.clone());
        }
        fields
    }

    /// Apply a set of field edits in place.
    ///
    /// `Null` clears optional fields and removes custom fields. Required
    /// fields (`email`, `name`) must be strings.
    pub fn apply_fields(&mut self, edits: &Fields) -> Result<(), ValueError> {
        let entity_type = self.entity_type().as_str();
        for (key, value) in edits {
            if let Some(custom_key) = key.strip_prefix(CUSTOM_FIELD_PREFIX) {
                let custom = match &mut *self {
                    Self::Contact(c) => &mut c.custom_fields,
                    Self::Company(c) => &mut c.custom_fields,
                };
                if value.is_null() {
                    custom.remove(custom_key);
                } else {
                    custom.insert(custom_key.to_string(), value.clone());
                }
                continue;
            }

            match (&mut *self, key.as_str()) {
                (Self::Contact(c), "email") => c.email = required_string(key, value)?,
                (Self::Contact(c), "first_name") => c.first_name = optional_string(key, value)?,
                (Self::Contact(c), "last_name") => c.last_name = optional_string(key, value)?,
                (Self::Contact(c), "phone") => c.phone = optional_string(key, value)?,
                (Self::Contact(c), "company") => {
                    c.company = match optional_string(key, value)? {
                        Some(s) => Some(s.parse().map_err(|_| ValueError::InvalidValue {
                            field: key.clone(),
                            reason: "not a company id".into(),
                        })?),
                        None => None,
                    }
                }
                (Self::Company(c), "name") => c.name = required_string(key, value)?,
                (Self::Company(c), "domain") => {
                    c.domain = optional_string(key, value)?.map(|d| d.to_lowercase())
                }
                (Self::Company(c), "industry") => c.industry = optional_string(key, value)?,
                _ => {
                    return Err(ValueError::UnknownField {
                        entity_type,
                        field: key.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Overwrite domain fields with a remote copy.
    ///
    /// The remote side does not carry local-only data (custom fields,
    /// contact → company links), so those are kept. An empty remote email
    /// keeps the local one. Mismatched entity types leave `self` unchanged.
    pub fn overwrite_from(&mut self, remote: &EntityData) {
        match (self, remote) {
            (Self::Contact(local), Self::Contact(remote)) => {
                if !remote.email.is_empty() {
                    local.email = remote.email.clone();
                }
                local.first_name = remote.first_name.clone();
                local.last_name = remote.last_name.clone();
                local.phone = remote.phone.clone();
            }
            (Self::Company(local), Self::Company(remote)) => {
                local.name = remote.name.clone();
                local.domain = remote.domain.clone();
                local.industry = remote.industry.clone();
            }
            _ => {}
        }
    }
}

fn put(fields: &mut Fields, key: &str, value: Option<&String>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), FieldValue::String(v.clone()));
    }
}

fn required_string(key: &str, value: &FieldValue) -> Result<String, ValueError> {
    match value {
        FieldValue::String(s) => Ok(s.trim().to_string()),
        other => Err(ValueError::TypeMismatch {
            field: key.to_string(),
            expected: "string",
            actual: other.type_name(),
        }),
    }
}

fn optional_string(key: &str, value: &FieldValue) -> Result<Option<String>, ValueError> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::String(s) => Ok(Some(s.trim().to_string())),
        other => Err(ValueError::TypeMismatch {
            field: key.to_string(),
            expected: "string or null",
            actual: other.type_name(),
        }),
    }
}

/// A remote CRM record as returned by the remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Remote identifier.
    pub remote_id: RemoteId,
    /// Domain fields as the remote sees them.
    pub data: EntityData,
    /// Remote last-modified time.
    pub last_modified: Timestamp,
}

impl RemoteRecord {
    /// Snapshot of the remote domain fields.
    pub fn snapshot(&self) -> Fields {
        self.data.to_fields()
    }
}

/// A locally stored contact or company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable local id.
    pub id: EntityId,
    /// Remote id, set after the first successful create or when the record
    /// originated remotely.
    pub remote_id: Option<RemoteId>,
    /// Domain fields.
    pub data: EntityData,
    /// Sync metadata.
    pub envelope: SyncEnvelope,
    /// Soft-delete marker.
    pub is_deleted: bool,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Entity {
    /// A new locally created entity, pending its first outbound sync.
    pub fn new_local(data: EntityData, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            remote_id: None,
            data,
            envelope: SyncEnvelope::new_local(now),
            is_deleted: false,
            created_at: now,
        }
    }

    /// A new entity seeded from a remote record.
    ///
    /// Local and remote modification times start equal and the record is
    /// already synced, so it cannot conflict until one side changes.
    pub fn from_remote(record: &RemoteRecord, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            remote_id: Some(record.remote_id.clone()),
            data: record.data.clone(),
            envelope: SyncEnvelope {
                sync_status: SyncStatus::Synced,
                last_modified_local: record.last_modified,
                last_modified_remote: Some(record.last_modified),
                last_synced_at: Some(now),
                sync_direction: SyncDirection::FromRemote,
                version: 1,
            },
            is_deleted: false,
            created_at: now,
        }
    }

    /// Entity type of this record.
    pub fn entity_type(&self) -> EntityType {
        self.data.entity_type()
    }

    /// Snapshot of the domain fields.
    pub fn snapshot(&self) -> Fields {
        self.data.to_fields()
    }

    /// Apply user edits. Content mutation.
    pub fn edit(&mut self, edits: &Fields, now: Timestamp) -> Result<(), ValueError> {
        let mut data = self.data.clone();
        data.apply_fields(edits)?;
        self.replace_data(data, now);
        Ok(())
    }

    /// Replace the domain fields. Content mutation.
    pub fn replace_data(&mut self, data: EntityData, now: Timestamp) {
        self.data = data;
        self.touch(now);
    }

    /// Soft-delete. Content mutation.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.is_deleted = true;
        self.touch(now);
    }

    fn touch(&mut self, now: Timestamp) {
        self.envelope.last_modified_local = now.max(self.envelope.last_modified_local);
        self.envelope.version += 1;
    }

    /// Set the sync status only.
    pub fn set_sync_status(&mut self, status: SyncStatus) {
        self.envelope.sync_status = status;
    }

    /// Record a successful sync.
    pub fn record_synced(
        &mut self,
        direction: Direction,
        remote_modified: Option<Timestamp>,
        now: Timestamp,
    ) {
        self.envelope.sync_status = SyncStatus::Synced;
        self.envelope.last_synced_at = Some(now);
        if remote_modified.is_some() {
            self.envelope.last_modified_remote = remote_modified;
        }
        self.envelope.sync_direction = direction.into();
    }

    /// Overwrite domain fields from a remote record and mark synced.
    ///
    /// Not a content mutation: `version` and `last_modified_local` stay.
    pub fn adopt_remote(&mut self, record: &RemoteRecord, now: Timestamp) {
        self.data.overwrite_from(&record.data);
        if self.remote_id.is_none() {
            self.remote_id = Some(record.remote_id.clone());
        }
        self.record_synced(Direction::FromRemote, Some(record.last_modified), now);
    }
}

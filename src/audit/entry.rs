//! Ledger Entry
//!
//! Defines the structure of sealed ledger entries, their canonical
//! serialization and the content hash that chains them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::crypto::KeyManager;
use crate::database::format_timestamp;
use crate::error::LedgerError;

pub const HASH_PREFIX: &str = "sha512:";

/// Structured metadata. Keys are kept sorted so canonicalization never
/// depends on insertion order.
pub type Metadata = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<u64> for MetaValue {
    fn from(value: u64) -> Self {
        MetaValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<Uuid> for MetaValue {
    fn from(value: Uuid) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl<T: Into<MetaValue>> From<Vec<T>> for MetaValue {
    fn from(values: Vec<T>) -> Self {
        MetaValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<MetaValue>> From<Option<T>> for MetaValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(MetaValue::Null)
    }
}

/// Result of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Error,
    Warning,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Error => "error",
            Outcome::Warning => "warning",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "error" => Ok(Outcome::Error),
            "warning" => Ok(Outcome::Warning),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// Action classification of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCategory {
    Login,
    Logout,
    LoginFailed,
    CredentialIssued,
    CredentialInvalidated,
    VoteCast,
    VoteRejected,
    VoteConfirmed,
    VoteQueued,
    VoteSynced,
    ElectionCreated,
    ElectionStatusChanged,
    IntegrityCheck,
    Correction,
    System,
}

impl EntryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryCategory::Login => "login",
            EntryCategory::Logout => "logout",
            EntryCategory::LoginFailed => "login_failed",
            EntryCategory::CredentialIssued => "credential_issued",
            EntryCategory::CredentialInvalidated => "credential_invalidated",
            EntryCategory::VoteCast => "vote_cast",
            EntryCategory::VoteRejected => "vote_rejected",
            EntryCategory::VoteConfirmed => "vote_confirmed",
            EntryCategory::VoteQueued => "vote_queued",
            EntryCategory::VoteSynced => "vote_synced",
            EntryCategory::ElectionCreated => "election_created",
            EntryCategory::ElectionStatusChanged => "election_status_changed",
            EntryCategory::IntegrityCheck => "integrity_check",
            EntryCategory::Correction => "correction",
            EntryCategory::System => "system",
        }
    }
}

impl FromStr for EntryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(EntryCategory::Login),
            "logout" => Ok(EntryCategory::Logout),
            "login_failed" => Ok(EntryCategory::LoginFailed),
            "credential_issued" => Ok(EntryCategory::CredentialIssued),
            "credential_invalidated" => Ok(EntryCategory::CredentialInvalidated),
            "vote_cast" => Ok(EntryCategory::VoteCast),
            "vote_rejected" => Ok(EntryCategory::VoteRejected),
            "vote_confirmed" => Ok(EntryCategory::VoteConfirmed),
            "vote_queued" => Ok(EntryCategory::VoteQueued),
            "vote_synced" => Ok(EntryCategory::VoteSynced),
            "election_created" => Ok(EntryCategory::ElectionCreated),
            "election_status_changed" => Ok(EntryCategory::ElectionStatusChanged),
            "integrity_check" => Ok(EntryCategory::IntegrityCheck),
            "correction" => Ok(EntryCategory::Correction),
            "system" => Ok(EntryCategory::System),
            _ => Err(format!("Unknown entry category: {}", s)),
        }
    }
}

impl fmt::Display for EntryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied fields of an entry, before the ledger assigns its
/// position, timestamp, hash and signature.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub category: EntryCategory,
    pub description: String,
    pub actor: Option<String>,
    pub actor_label: String,
    pub context: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub outcome: Outcome,
    pub metadata: Metadata,
    pub error_detail: Option<String>,
}

impl EntryDraft {
    pub fn new(category: EntryCategory, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
            actor: None,
            actor_label: "system".to_string(),
            context: None,
            resource_type: None,
            resource_id: None,
            outcome: Outcome::Success,
            metadata: Metadata::new(),
            error_detail: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>, label: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self.actor_label = label.into();
        self
    }

    /// Record a label without linking a principal (anonymous actions).
    pub fn actor_label(mut self, label: impl Into<String>) -> Self {
        self.actor = None;
        self.actor_label = label.into();
        self
    }

    pub fn context(mut self, context: Uuid) -> Self {
        self.context = Some(context);
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark the entry as a non-success outcome with its error detail.
    pub fn outcome(mut self, outcome: Outcome, detail: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.error_detail = if outcome == Outcome::Success {
            None
        } else {
            Some(detail.into())
        };
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.description.trim().is_empty() {
            return Err(LedgerError::InvalidEntry(
                "description must not be empty".to_string(),
            ));
        }
        if self.actor_label.trim().is_empty() {
            return Err(LedgerError::InvalidEntry(
                "actor_label must not be empty".to_string(),
            ));
        }
        if self.outcome == Outcome::Success && self.error_detail.is_some() {
            return Err(LedgerError::InvalidEntry(
                "error_detail is only allowed on non-success outcomes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sealed, hash-chained ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub category: EntryCategory,
    pub description: String,
    pub actor: Option<String>,
    pub actor_label: String,
    pub context: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub outcome: Outcome,
    pub metadata: Metadata,
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub content_hash: String,
    pub signature: String,
    pub sealed: bool,
}

/// Field order here is the canonical order; do not reorder.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: String,
    sequence: u64,
    category: &'a str,
    description: &'a str,
    actor: Option<&'a str>,
    actor_label: &'a str,
    context: Option<String>,
    resource_type: Option<&'a str>,
    resource_id: Option<&'a str>,
    outcome: &'a str,
    metadata: &'a Metadata,
    error_detail: Option<&'a str>,
    timestamp: String,
    prev_hash: &'a str,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    content_hash: &'a str,
    sequence: u64,
    timestamp: String,
}

impl LedgerEntry {
    /// Build, hash and sign an entry at the given chain position.
    pub(crate) fn seal(
        draft: EntryDraft,
        sequence: u64,
        prev_hash: String,
        timestamp: DateTime<Utc>,
        keys: &KeyManager,
    ) -> Result<Self, LedgerError> {
        draft.validate()?;

        let mut entry = Self {
            id: Uuid::new_v4(),
            sequence,
            category: draft.category,
            description: draft.description,
            actor: draft.actor,
            actor_label: draft.actor_label,
            context: draft.context,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            outcome: draft.outcome,
            metadata: draft.metadata,
            error_detail: draft.error_detail,
            timestamp,
            prev_hash,
            content_hash: String::new(),
            signature: String::new(),
            sealed: false,
        };

        entry.content_hash = entry.calculate_hash();
        entry.signature = keys.sign(&entry.signing_payload())?;
        entry.sealed = true;
        Ok(entry)
    }

    /// Canonical serialization of every field except the hash, signature
    /// and sealed flag.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = CanonicalEntry {
            id: self.id.to_string(),
            sequence: self.sequence,
            category: self.category.as_str(),
            description: &self.description,
            actor: self.actor.as_deref(),
            actor_label: &self.actor_label,
            context: self.context.map(|c| c.to_string()),
            resource_type: self.resource_type.as_deref(),
            resource_id: self.resource_id.as_deref(),
            outcome: self.outcome.as_str(),
            metadata: &self.metadata,
            error_detail: self.error_detail.as_deref(),
            timestamp: format_timestamp(&self.timestamp),
            prev_hash: &self.prev_hash,
        };
        // Strings, integers and string-keyed maps always serialize.
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    pub fn canonical_string(&self) -> String {
        String::from_utf8_lossy(&self.canonical_bytes()).into_owned()
    }

    /// Calculate the SHA-512 content hash of this entry
    pub fn calculate_hash(&self) -> String {
        let digest = Sha512::digest(self.canonical_bytes());
        format!("{}{}", HASH_PREFIX, hex::encode(digest))
    }

    /// Verify this entry's stored hash against its stored fields
    pub fn verify_hash(&self) -> bool {
        self.content_hash == self.calculate_hash()
    }

    /// Bytes covered by the entry signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let signed = SignedFields {
            content_hash: &self.content_hash,
            sequence: self.sequence,
            timestamp: format_timestamp(&self.timestamp),
        };
        serde_json::to_vec(&signed).unwrap_or_default()
    }

    pub fn verify_signature(&self, keys: &KeyManager) -> bool {
        keys.verify(&self.signing_payload(), &self.signature)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} [{}] by {}: {}",
            self.sequence,
            self.category,
            self.outcome.as_str(),
            self.actor_label,
            self.description
        )
    }
}

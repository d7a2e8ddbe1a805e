//! Offline Vote Queue
//!
//! Durable staging for ballots submitted while the client could not reach
//! the voting service. At most one unsynced entry may exist per credential,
//! and resynchronizing an entry settles it exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder};
use crate::crypto::aead::decode_ballot;
use crate::database::{self, is_unique_violation, Database};
use crate::error::{ErrorClass, LedgerError};
use crate::voting::caster::{derive_vote_token, AnonymousVoteCaster, CastVote, CastVoteRequest};
use crate::voting::credentials;

/// A ballot captured on a disconnected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedBallot {
    pub credential_id: Uuid,
    pub election_id: Uuid,
    pub encrypted_payload: String,
    pub nonce: String,
    pub client_signature: String,
    pub client_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub credential_id: Uuid,
    pub election_id: Uuid,
    pub encrypted_payload: String,
    pub nonce: String,
    pub client_signature: String,
    pub client_timestamp: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub synced: bool,
    pub sync_succeeded: Option<bool>,
    /// Vote id on success, rejection reason on failure.
    pub sync_result: Option<String>,
    pub vote_token: Option<Uuid>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn cast_request(&self) -> CastVoteRequest {
        CastVoteRequest {
            credential_id: self.credential_id,
            election_id: self.election_id,
            encrypted_payload: self.encrypted_payload.clone(),
            nonce: self.nonce.clone(),
            client_signature: self.client_signature.clone(),
        }
    }
}

/// Settled outcome of a queued ballot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncResult {
    Cast(CastVote),
    Rejected { reason: String },
}

/// Result of one entry in a `resync_pending` pass.
#[derive(Debug)]
pub struct SyncOutcome {
    pub entry_id: Uuid,
    pub result: Result<SyncResult, LedgerError>,
}

pub struct OfflineVoteQueue {
    db: Database,
    caster: Arc<AnonymousVoteCaster>,
    recorder: AuditRecorder,
}

impl OfflineVoteQueue {
    pub fn new(db: Database, caster: Arc<AnonymousVoteCaster>, recorder: AuditRecorder) -> Self {
        Self { db, caster, recorder }
    }

    /// Stage a ballot. Fails with `AlreadyQueuedError` while an earlier
    /// ballot for the same credential is still unsynced.
    pub async fn enqueue(&self, ballot: QueuedBallot) -> Result<QueueEntry, LedgerError> {
        self.caster.ensure_election_open(ballot.election_id).await?;
        decode_ballot(&ballot.encrypted_payload, &ballot.nonce)?;

        match credentials::fetch(&self.db, ballot.credential_id).await? {
            Some(credential) if credential.election_id == ballot.election_id => {}
            _ => return Err(LedgerError::InvalidCredentialError),
        }

        let entry = QueueEntry {
            id: Uuid::new_v4(),
            credential_id: ballot.credential_id,
            election_id: ballot.election_id,
            encrypted_payload: ballot.encrypted_payload,
            nonce: ballot.nonce,
            client_signature: ballot.client_signature,
            client_timestamp: ballot.client_timestamp,
            queued_at: database::now(),
            synced: false,
            sync_succeeded: None,
            sync_result: None,
            vote_token: None,
            synced_at: None,
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO offline_votes
            (id, credential_id, election_id, encrypted_payload, nonce, client_signature,
             client_timestamp, queued_at, synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.credential_id.to_string())
        .bind(entry.election_id.to_string())
        .bind(&entry.encrypted_payload)
        .bind(&entry.nonce)
        .bind(&entry.client_signature)
        .bind(database::format_timestamp(&entry.client_timestamp))
        .bind(database::format_timestamp(&entry.queued_at))
        .execute(self.db.pool());

        match self.db.deadline("enqueue offline vote", insert).await? {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(LedgerError::AlreadyQueuedError),
            Err(e) => {
                return Err(LedgerError::DatabaseError(format!(
                    "enqueue offline vote failed: {}",
                    e
                )))
            }
        }

        info!("Queued offline vote {} for election {}", entry.id, entry.election_id);
        self.recorder
            .record_best_effort(AuditEvent::VoteQueued {
                election_id: entry.election_id,
                queue_entry_id: entry.id,
            })
            .await;

        Ok(entry)
    }

    /// Settle a queued ballot. Repeated calls return the stored result.
    pub async fn resync(&self, entry_id: Uuid) -> Result<SyncResult, LedgerError> {
        let entry = self
            .get(entry_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("offline vote".to_string()))?;

        if entry.synced {
            debug!("Offline vote {} already synced, replaying result", entry.id);
            return self.replay(&entry).await;
        }

        let result = match self.existing_cast(&entry).await? {
            Some(vote) => SyncResult::Cast(vote),
            None => match self.caster.cast_vote(&entry.cast_request()).await {
                Ok(vote) => SyncResult::Cast(vote),
                Err(e) if matches!(e.class(), ErrorClass::Validation | ErrorClass::Conflict) => {
                    // A concurrent resync of this entry may have cast this
                    // very ballot after our first lookup.
                    match self.existing_cast(&entry).await? {
                        Some(vote) => SyncResult::Cast(vote),
                        None => SyncResult::Rejected {
                            reason: e.to_string(),
                        },
                    }
                }
                Err(e) => {
                    warn!("Offline vote {} left pending: {}", entry.id, e);
                    return Err(e);
                }
            },
        };

        if !self.mark_synced(&entry, &result).await? {
            // Another resync settled it first.
            let current = self
                .get(entry_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound("offline vote".to_string()))?;
            return self.replay(&current).await;
        }

        self.recorder
            .record_best_effort(AuditEvent::VoteSynced {
                election_id: entry.election_id,
                queue_entry_id: entry.id,
                result: match &result {
                    SyncResult::Cast(vote) => Ok(vote.id),
                    SyncResult::Rejected { reason } => Err(reason.clone()),
                },
            })
            .await;

        Ok(result)
    }

    /// A vote already committed for this exact ballot, e.g. when an earlier
    /// resync cast it but did not get to mark the entry synced.
    async fn existing_cast(&self, entry: &QueueEntry) -> Result<Option<CastVote>, LedgerError> {
        let Some(credential) = credentials::fetch(&self.db, entry.credential_id).await? else {
            return Ok(None);
        };
        let token = derive_vote_token(credential.id, credential.election_id, &credential.voter_id);
        let existing = self.caster.find_vote(token, entry.election_id).await?;
        Ok(existing.filter(|vote| {
            vote.encrypted_payload == entry.encrypted_payload && vote.nonce == entry.nonce
        }))
    }

    async fn mark_synced(&self, entry: &QueueEntry, result: &SyncResult) -> Result<bool, LedgerError> {
        let (succeeded, message, vote_token) = match result {
            SyncResult::Cast(vote) => (true, vote.id.to_string(), Some(vote.vote_token.to_string())),
            SyncResult::Rejected { reason } => (false, reason.clone(), None),
        };

        let updated = self
            .db
            .timed(
                "mark offline vote synced",
                sqlx::query(
                    "UPDATE offline_votes SET synced = 1, sync_succeeded = ?, sync_result = ?, \
                     vote_token = ?, synced_at = ? WHERE id = ? AND synced = 0",
                )
                .bind(succeeded)
                .bind(message)
                .bind(vote_token)
                .bind(database::format_timestamp(&database::now()))
                .bind(entry.id.to_string())
                .execute(self.db.pool()),
            )
            .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn replay(&self, entry: &QueueEntry) -> Result<SyncResult, LedgerError> {
        if entry.sync_succeeded != Some(true) {
            return Ok(SyncResult::Rejected {
                reason: entry.sync_result.clone().unwrap_or_default(),
            });
        }
        let token = entry
            .vote_token
            .ok_or_else(|| LedgerError::DatabaseError("synced vote has no token".to_string()))?;
        self.caster
            .find_vote(token, entry.election_id)
            .await?
            .map(SyncResult::Cast)
            .ok_or_else(|| LedgerError::NotFound("cast vote".to_string()))
    }

    /// Unsynced entries, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueueEntry>, LedgerError> {
        let rows = self
            .db
            .timed(
                "list pending offline votes",
                sqlx::query("SELECT * FROM offline_votes WHERE synced = 0 ORDER BY queued_at ASC, rowid ASC")
                    .fetch_all(self.db.pool()),
            )
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Resync every pending entry once. Entries that hit infrastructure
    /// errors stay pending for the next pass.
    pub async fn resync_pending(&self) -> Result<Vec<SyncOutcome>, LedgerError> {
        let pending = self.pending().await?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for entry in pending {
            let result = self.resync(entry.id).await;
            outcomes.push(SyncOutcome {
                entry_id: entry.id,
                result,
            });
        }

        let settled = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(
            "Offline resync pass: {} settled, {} left pending",
            settled,
            outcomes.len() - settled
        );
        Ok(outcomes)
    }

    pub async fn get(&self, entry_id: Uuid) -> Result<Option<QueueEntry>, LedgerError> {
        let row = self
            .db
            .timed(
                "fetch offline vote",
                sqlx::query("SELECT * FROM offline_votes WHERE id = ?")
                    .bind(entry_id.to_string())
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry, LedgerError> {
    let id: String = row.try_get("id")?;
    let credential_id: String = row.try_get("credential_id")?;
    let election_id: String = row.try_get("election_id")?;
    let client_timestamp: String = row.try_get("client_timestamp")?;
    let queued_at: String = row.try_get("queued_at")?;
    let vote_token: Option<String> = row.try_get("vote_token")?;
    let synced_at: Option<String> = row.try_get("synced_at")?;

    Ok(QueueEntry {
        id: database::parse_uuid(&id)?,
        credential_id: database::parse_uuid(&credential_id)?,
        election_id: database::parse_uuid(&election_id)?,
        encrypted_payload: row.try_get("encrypted_payload")?,
        nonce: row.try_get("nonce")?,
        client_signature: row.try_get("client_signature")?,
        client_timestamp: database::parse_timestamp(&client_timestamp)?,
        queued_at: database::parse_timestamp(&queued_at)?,
        synced: row.try_get("synced")?,
        sync_succeeded: row.try_get("sync_succeeded")?,
        sync_result: row.try_get("sync_result")?,
        vote_token: vote_token.as_deref().map(database::parse_uuid).transpose()?,
        synced_at: synced_at.as_deref().map(database::parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_result_serialization() {
        let rejected = SyncResult::Rejected {
            reason: "A vote has already been recorded for this ballot".to_string(),
        };
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["result"], "rejected");
        let back: SyncResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, rejected);
    }
}

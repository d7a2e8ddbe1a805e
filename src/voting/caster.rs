//! Anonymous Vote Caster
//!
//! Casts votes under a deterministic, one-way vote token so that the stored
//! record cannot be traced back to a voter without the credential, while a
//! second cast with the same credential collides on the token.
//!
//! A successful cast inserts the vote, consumes the credential and appends
//! the audit entry in one transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder, Outcome};
use crate::crypto::aead::{decode_ballot, open_ballot};
use crate::crypto::{client_ballot_message, BallotSignatures};
use crate::database::{self, is_unique_violation, Database};
use crate::error::{ErrorClass, LedgerError};
use crate::voting::credentials::{self, BallotCredential, CredentialStatus};
use crate::voting::elections::{ensure_open, ElectionDirectory};

/// Namespace for vote token derivation. Shared by every deployment.
pub const VOTE_TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x8c3f_5a21_6d4e_4b07_9f12_a6e0_53d8_c7b4);

/// `UUIDv5(namespace, hex(SHA-256(credential_id || election_id || voter_id)))`
pub fn derive_vote_token(credential_id: Uuid, election_id: Uuid, voter_id: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(credential_id.to_string().as_bytes());
    hasher.update(election_id.to_string().as_bytes());
    hasher.update(voter_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Uuid::new_v5(&VOTE_TOKEN_NAMESPACE, digest.as_bytes())
}

/// One-way hash of a credential id kept for audit correlation.
pub fn credential_hash(credential_id: Uuid) -> String {
    hex::encode(Sha256::digest(credential_id.to_string().as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Cast,
    Verified,
    Invalidated,
}

impl VoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Cast => "cast",
            VoteStatus::Verified => "verified",
            VoteStatus::Invalidated => "invalidated",
        }
    }
}

impl FromStr for VoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cast" => Ok(VoteStatus::Cast),
            "verified" => Ok(VoteStatus::Verified),
            "invalidated" => Ok(VoteStatus::Invalidated),
            _ => Err(format!("Unknown vote status: {}", s)),
        }
    }
}

/// Anonymized vote record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVote {
    pub id: Uuid,
    pub vote_token: Uuid,
    pub election_id: Uuid,
    pub encrypted_payload: String,
    pub nonce: String,
    pub signature: String,
    pub credential_hash: String,
    pub status: VoteStatus,
    pub cast_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct VoteSigningPayload<'a> {
    vote_token: String,
    encrypted_payload: &'a str,
    election_id: String,
    nonce: &'a str,
}

impl CastVote {
    /// Bytes covered by the server signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        vote_signing_payload(self.vote_token, &self.encrypted_payload, self.election_id, &self.nonce)
    }
}

fn vote_signing_payload(
    vote_token: Uuid,
    encrypted_payload: &str,
    election_id: Uuid,
    nonce: &str,
) -> Vec<u8> {
    let payload = VoteSigningPayload {
        vote_token: vote_token.to_string(),
        encrypted_payload,
        election_id: election_id.to_string(),
        nonce,
    };
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// A ballot submission as received from a voter device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVoteRequest {
    pub credential_id: Uuid,
    pub election_id: Uuid,
    pub encrypted_payload: String,
    pub nonce: String,
    /// DER-hex secp256k1 signature over the client ballot message.
    pub client_signature: String,
}

/// Per-credential async locks. Entries are pruned once no caster holds them.
#[derive(Default)]
struct CredentialLocks {
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CredentialLocks {
    fn handle(&self, credential_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(credential_id).or_default().clone()
    }

    fn prune(&self, credential_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(&credential_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&credential_id);
        }
    }
}

pub struct AnonymousVoteCaster {
    db: Database,
    recorder: AuditRecorder,
    elections: Arc<dyn ElectionDirectory>,
    signatures: BallotSignatures,
    locks: CredentialLocks,
}

impl AnonymousVoteCaster {
    pub fn new(db: Database, recorder: AuditRecorder, elections: Arc<dyn ElectionDirectory>) -> Self {
        Self {
            db,
            recorder,
            elections,
            signatures: BallotSignatures::new(),
            locks: CredentialLocks::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn ensure_election_open(&self, election_id: Uuid) -> Result<(), LedgerError> {
        ensure_open(self.elections.as_ref(), election_id).await
    }

    /// Cast a vote. Every outcome, success or failure, leaves one audit
    /// entry; failure entries carry only a redacted reason.
    pub async fn cast_vote(&self, request: &CastVoteRequest) -> Result<CastVote, LedgerError> {
        match self.try_cast(request).await {
            Ok(vote) => Ok(vote),
            Err(e) => {
                warn!("Vote rejected in election {}: {}", request.election_id, e.code());
                self.record_rejection(request.election_id, &e).await;
                Err(e)
            }
        }
    }

    async fn try_cast(&self, request: &CastVoteRequest) -> Result<CastVote, LedgerError> {
        self.ensure_election_open(request.election_id).await?;

        let credential = self.checked_credential(request).await?;
        let vote_token = derive_vote_token(credential.id, credential.election_id, &credential.voter_id);

        if credential.status == CredentialStatus::Used
            || self.find_vote(vote_token, request.election_id).await?.is_some()
        {
            return Err(LedgerError::DuplicateVoteError);
        }

        decode_ballot(&request.encrypted_payload, &request.nonce)?;

        let lock = self.locks.handle(credential.id);
        let result = {
            let _credential_guard = lock.lock().await;
            self.commit_vote(request, &credential, vote_token).await
        };
        drop(lock);
        self.locks.prune(credential.id);

        let vote = result?;
        info!("Vote cast in election {}", vote.election_id);
        Ok(vote)
    }

    /// Credential must exist, belong to this election, not be revoked, and
    /// the submission must be signed by its registered device key.
    async fn checked_credential(&self, request: &CastVoteRequest) -> Result<BallotCredential, LedgerError> {
        let credential = credentials::fetch(&self.db, request.credential_id)
            .await?
            .ok_or(LedgerError::InvalidCredentialError)?;

        if credential.election_id != request.election_id
            || credential.status == CredentialStatus::Invalid
        {
            return Err(LedgerError::InvalidCredentialError);
        }

        let message = client_ballot_message(
            credential.id,
            request.election_id,
            &request.encrypted_payload,
            &request.nonce,
        );
        if !self
            .signatures
            .verify(&message, &request.client_signature, &credential.public_key)
        {
            return Err(LedgerError::InvalidCredentialError);
        }

        Ok(credential)
    }

    async fn commit_vote(
        &self,
        request: &CastVoteRequest,
        credential: &BallotCredential,
        vote_token: Uuid,
    ) -> Result<CastVote, LedgerError> {
        let signature = self.recorder.ledger().keys().sign(&vote_signing_payload(
            vote_token,
            &request.encrypted_payload,
            request.election_id,
            &request.nonce,
        ))?;

        let vote = CastVote {
            id: Uuid::new_v4(),
            vote_token,
            election_id: request.election_id,
            encrypted_payload: request.encrypted_payload.clone(),
            nonce: request.nonce.clone(),
            signature,
            credential_hash: credential_hash(credential.id),
            status: VoteStatus::Cast,
            cast_at: database::now(),
        };

        let guard = self.recorder.ledger().lock_tail().await;
        let mut tx = self.db.begin_immediate().await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO cast_votes
            (id, vote_token, election_id, encrypted_payload, nonce, signature, credential_hash, status, cast_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'cast', ?)
            "#,
        )
        .bind(vote.id.to_string())
        .bind(vote.vote_token.to_string())
        .bind(vote.election_id.to_string())
        .bind(&vote.encrypted_payload)
        .bind(&vote.nonce)
        .bind(&vote.signature)
        .bind(&vote.credential_hash)
        .bind(database::format_timestamp(&vote.cast_at))
        .execute(&mut *tx);

        match self.db.deadline("insert vote", insert).await? {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(LedgerError::DuplicateVoteError),
            Err(e) => return Err(LedgerError::DatabaseError(format!("insert vote failed: {}", e))),
        }

        if !credentials::mark_used(&self.db, &mut tx, credential).await? {
            drop(tx);
            drop(guard);
            return Err(self.lost_credential_race(credential.id).await);
        }

        self.recorder
            .record_in(
                &guard,
                &mut tx,
                AuditEvent::VoteCast {
                    election_id: vote.election_id,
                    vote_token: vote.vote_token,
                },
            )
            .await?;

        self.db
            .timed("commit vote", tx.commit())
            .await?;

        Ok(vote)
    }

    /// The credential changed between the read and the compare-and-swap.
    async fn lost_credential_race(&self, credential_id: Uuid) -> LedgerError {
        match credentials::fetch(&self.db, credential_id).await {
            Ok(Some(current)) if current.status == CredentialStatus::Used => {
                LedgerError::DuplicateVoteError
            }
            Ok(_) => LedgerError::InvalidCredentialError,
            Err(e) => e,
        }
    }

    async fn record_rejection(&self, election_id: Uuid, err: &LedgerError) {
        let (outcome, detail) = match err.class() {
            ErrorClass::Validation | ErrorClass::Conflict => (Outcome::Failure, err.to_string()),
            ErrorClass::Infrastructure | ErrorClass::Key => {
                (Outcome::Error, "internal error while casting vote".to_string())
            }
        };
        self.recorder
            .record_best_effort(AuditEvent::VoteRejected {
                election_id,
                outcome,
                reason_code: err.code().to_string(),
                detail,
            })
            .await;
    }

    /// Check the server signature over the stored vote fields.
    pub fn verify_signature(&self, vote: &CastVote) -> bool {
        self.recorder
            .ledger()
            .keys()
            .verify(&vote.signing_payload(), &vote.signature)
    }

    /// Authenticated decryption with a key supplied by the caller.
    pub fn decrypt(&self, vote: &CastVote, key: &[u8]) -> Result<Vec<u8>, LedgerError> {
        open_ballot(key, vote.election_id, &vote.encrypted_payload, &vote.nonce)
    }

    /// Re-verify a cast vote and settle its status. Already settled votes
    /// are returned unchanged.
    pub async fn confirm(&self, vote_id: Uuid) -> Result<CastVote, LedgerError> {
        let mut vote = self
            .get_vote(vote_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("cast vote".to_string()))?;
        if vote.status != VoteStatus::Cast {
            return Ok(vote);
        }

        let signature_valid = self.verify_signature(&vote);
        let next = if signature_valid {
            VoteStatus::Verified
        } else {
            VoteStatus::Invalidated
        };

        let updated = self
            .db
            .timed(
                "confirm vote",
                sqlx::query("UPDATE cast_votes SET status = ? WHERE id = ? AND status = 'cast'")
                    .bind(next.as_str())
                    .bind(vote_id.to_string())
                    .execute(self.db.pool()),
            )
            .await?;

        if updated.rows_affected() == 0 {
            // Settled concurrently; report what is stored.
            return self
                .get_vote(vote_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound("cast vote".to_string()));
        }

        if !signature_valid {
            warn!("Vote signature failed re-verification in election {}", vote.election_id);
        }
        self.recorder
            .record_best_effort(AuditEvent::VoteConfirmed {
                election_id: vote.election_id,
                vote_id,
                signature_valid,
            })
            .await;

        vote.status = next;
        Ok(vote)
    }

    pub async fn find_vote(&self, vote_token: Uuid, election_id: Uuid) -> Result<Option<CastVote>, LedgerError> {
        let row = self
            .db
            .timed(
                "find vote",
                sqlx::query("SELECT * FROM cast_votes WHERE vote_token = ? AND election_id = ?")
                    .bind(vote_token.to_string())
                    .bind(election_id.to_string())
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        row.as_ref().map(vote_from_row).transpose()
    }

    pub async fn get_vote(&self, vote_id: Uuid) -> Result<Option<CastVote>, LedgerError> {
        let row = self
            .db
            .timed(
                "fetch vote",
                sqlx::query("SELECT * FROM cast_votes WHERE id = ?")
                    .bind(vote_id.to_string())
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        debug!("Fetched vote {}", vote_id);
        row.as_ref().map(vote_from_row).transpose()
    }
}

fn vote_from_row(row: &SqliteRow) -> Result<CastVote, LedgerError> {
    let id: String = row.try_get("id")?;
    let vote_token: String = row.try_get("vote_token")?;
    let election_id: String = row.try_get("election_id")?;
    let status: String = row.try_get("status")?;
    let cast_at: String = row.try_get("cast_at")?;

    Ok(CastVote {
        id: database::parse_uuid(&id)?,
        vote_token: database::parse_uuid(&vote_token)?,
        election_id: database::parse_uuid(&election_id)?,
        encrypted_payload: row.try_get("encrypted_payload")?,
        nonce: row.try_get("nonce")?,
        signature: row.try_get("signature")?,
        credential_hash: row.try_get("credential_hash")?,
        status: status.parse().map_err(LedgerError::DatabaseError)?,
        cast_at: database::parse_timestamp(&cast_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_token_is_deterministic() {
        let credential = Uuid::new_v4();
        let election = Uuid::new_v4();

        let token = derive_vote_token(credential, election, "voter-1");
        assert_eq!(token, derive_vote_token(credential, election, "voter-1"));
        assert_eq!(token.get_version_num(), 5);

        assert_ne!(token, derive_vote_token(Uuid::new_v4(), election, "voter-1"));
        assert_ne!(token, derive_vote_token(credential, Uuid::new_v4(), "voter-1"));
        assert_ne!(token, derive_vote_token(credential, election, "voter-2"));
    }

    #[test]
    fn test_vote_token_does_not_embed_inputs() {
        let credential = Uuid::new_v4();
        let token = derive_vote_token(credential, Uuid::new_v4(), "voter-1").to_string();
        assert!(!token.contains(&credential.to_string()[..8]));
        assert_ne!(credential_hash(credential), credential.to_string());
        assert_eq!(credential_hash(credential).len(), 64);
    }

    #[test]
    fn test_signing_payload_covers_every_signed_field() {
        let vote = CastVote {
            id: Uuid::new_v4(),
            vote_token: Uuid::new_v4(),
            election_id: Uuid::new_v4(),
            encrypted_payload: "cGF5bG9hZA==".to_string(),
            nonce: "bm9uY2U=".to_string(),
            signature: String::new(),
            credential_hash: String::new(),
            status: VoteStatus::Cast,
            cast_at: database::now(),
        };

        let mut other = vote.clone();
        other.nonce = "b3RoZXI=".to_string();
        assert_ne!(vote.signing_payload(), other.signing_payload());

        let mut other = vote.clone();
        other.election_id = Uuid::new_v4();
        assert_ne!(vote.signing_payload(), other.signing_payload());

        // Status is not signed; confirmation may change it.
        let mut other = vote.clone();
        other.status = VoteStatus::Verified;
        assert_eq!(vote.signing_payload(), other.signing_payload());
    }

    #[test]
    fn test_credential_locks_are_pruned() {
        let locks = CredentialLocks::default();
        let id = Uuid::new_v4();
        let handle = locks.handle(id);
        locks.prune(id);
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
        drop(handle);
        locks.prune(id);
        assert!(locks.locks.lock().unwrap().is_empty());
    }
}

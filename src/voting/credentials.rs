//! Ballot credentials
//!
//! One-time capabilities binding a voter to an election. A credential moves
//! issued -> used exactly once (or issued -> invalid); the `version` column
//! makes the transition an optimistic compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder};
use crate::crypto::signatures::parse_public_key;
use crate::database::{self, is_unique_violation, Database};
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Issued,
    Used,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Issued => "issued",
            CredentialStatus::Used => "used",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issued" => Ok(CredentialStatus::Issued),
            "used" => Ok(CredentialStatus::Used),
            "invalid" => Ok(CredentialStatus::Invalid),
            _ => Err(format!("Unknown credential status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotCredential {
    pub id: Uuid,
    pub election_id: Uuid,
    pub voter_id: String,
    /// Voter device's secp256k1 public key, hex encoded.
    pub public_key: String,
    pub status: CredentialStatus,
    pub version: i64,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

pub struct CredentialStore {
    db: Database,
    recorder: AuditRecorder,
}

impl CredentialStore {
    pub fn new(db: Database, recorder: AuditRecorder) -> Self {
        Self { db, recorder }
    }

    /// Issue a credential for a voter in an election. Each voter gets at most
    /// one credential per election.
    pub async fn issue(
        &self,
        election_id: Uuid,
        voter_id: &str,
        public_key: &str,
    ) -> Result<BallotCredential, LedgerError> {
        if voter_id.trim().is_empty() {
            return Err(LedgerError::InvalidEntry("voter_id must not be empty".to_string()));
        }
        parse_public_key(public_key).map_err(LedgerError::CryptoError)?;

        let credential = BallotCredential {
            id: Uuid::new_v4(),
            election_id,
            voter_id: voter_id.to_string(),
            public_key: public_key.to_string(),
            status: CredentialStatus::Issued,
            version: 0,
            issued_at: database::now(),
            used_at: None,
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO ballot_credentials
            (id, election_id, voter_id, public_key, status, version, issued_at)
            VALUES (?, ?, ?, ?, 'issued', 0, ?)
            "#,
        )
        .bind(credential.id.to_string())
        .bind(election_id.to_string())
        .bind(voter_id)
        .bind(public_key)
        .bind(database::format_timestamp(&credential.issued_at))
        .execute(self.db.pool());

        match self.db.deadline("issue credential", insert).await? {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(LedgerError::CredentialAlreadyIssued),
            Err(e) => return Err(LedgerError::DatabaseError(format!("issue credential failed: {}", e))),
        }

        info!("Issued ballot credential for election {}", election_id);
        self.recorder
            .record_best_effort(AuditEvent::CredentialIssued {
                election_id,
                voter_id: voter_id.to_string(),
            })
            .await;

        Ok(credential)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<BallotCredential>, LedgerError> {
        fetch(&self.db, id).await
    }

    /// Revoke an unused credential.
    pub async fn invalidate(&self, id: Uuid, actor_label: &str) -> Result<BallotCredential, LedgerError> {
        let result = self
            .db
            .timed(
                "invalidate credential",
                sqlx::query(
                    "UPDATE ballot_credentials SET status = 'invalid', version = version + 1 \
                     WHERE id = ? AND status = 'issued'",
                )
                .bind(id.to_string())
                .execute(self.db.pool()),
            )
            .await?;

        let credential = self
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("ballot credential".to_string()))?;

        if result.rows_affected() == 0 {
            warn!("Refused to invalidate a credential that is not in issued state");
            return Err(LedgerError::InvalidCredentialError);
        }

        self.recorder
            .record_best_effort(AuditEvent::CredentialInvalidated {
                election_id: credential.election_id,
                actor_label: actor_label.to_string(),
            })
            .await;

        Ok(credential)
    }
}

pub(crate) async fn fetch(db: &Database, id: Uuid) -> Result<Option<BallotCredential>, LedgerError> {
    let row = db
        .timed(
            "fetch credential",
            sqlx::query("SELECT * FROM ballot_credentials WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(db.pool()),
        )
        .await?;
    row.as_ref().map(credential_from_row).transpose()
}

/// Compare-and-swap issued -> used inside the caller's transaction.
/// Returns false when another writer got there first.
pub(crate) async fn mark_used(
    db: &Database,
    conn: &mut SqliteConnection,
    credential: &BallotCredential,
) -> Result<bool, LedgerError> {
    let result = db
        .timed(
            "mark credential used",
            sqlx::query(
                "UPDATE ballot_credentials SET status = 'used', version = version + 1, used_at = ? \
                 WHERE id = ? AND status = 'issued' AND version = ?",
            )
            .bind(database::format_timestamp(&database::now()))
            .bind(credential.id.to_string())
            .bind(credential.version)
            .execute(&mut *conn),
        )
        .await?;
    Ok(result.rows_affected() == 1)
}

fn credential_from_row(row: &SqliteRow) -> Result<BallotCredential, LedgerError> {
    let id: String = row.try_get("id")?;
    let election_id: String = row.try_get("election_id")?;
    let status: String = row.try_get("status")?;
    let issued_at: String = row.try_get("issued_at")?;
    let used_at: Option<String> = row.try_get("used_at")?;

    Ok(BallotCredential {
        id: database::parse_uuid(&id)?,
        election_id: database::parse_uuid(&election_id)?,
        voter_id: row.try_get("voter_id")?,
        public_key: row.try_get("public_key")?,
        status: status.parse().map_err(LedgerError::DatabaseError)?,
        version: row.try_get("version")?,
        issued_at: database::parse_timestamp(&issued_at)?,
        used_at: used_at.as_deref().map(database::parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChainedLedger;
    use crate::crypto::{BallotSignatures, KeyManager};
    use std::sync::{Arc, OnceLock};

    fn keys() -> Arc<KeyManager> {
        static KEYS: OnceLock<Arc<KeyManager>> = OnceLock::new();
        KEYS.get_or_init(|| Arc::new(KeyManager::generate(2048).unwrap()))
            .clone()
    }

    async fn store() -> (CredentialStore, Arc<ChainedLedger>) {
        let db = Database::new_in_memory().await.unwrap();
        let ledger = Arc::new(ChainedLedger::new(db.clone(), keys()));
        (CredentialStore::new(db, AuditRecorder::new(ledger.clone())), ledger)
    }

    fn device_key() -> String {
        let signatures = BallotSignatures::new();
        let (secret_key, _) = signatures.generate_keypair();
        signatures.public_key_hex(&secret_key)
    }

    #[tokio::test]
    async fn test_issue_and_get() {
        let (store, ledger) = store().await;
        let election = Uuid::new_v4();
        let issued = store.issue(election, "voter-1", &device_key()).await.unwrap();

        assert_eq!(issued.status, CredentialStatus::Issued);
        assert_eq!(store.get(issued.id).await.unwrap(), Some(issued));
        assert_eq!(ledger.len().await.unwrap(), 1);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_credential_per_voter_and_election() {
        let (store, _) = store().await;
        let election = Uuid::new_v4();
        store.issue(election, "voter-1", &device_key()).await.unwrap();

        assert!(matches!(
            store.issue(election, "voter-1", &device_key()).await,
            Err(LedgerError::CredentialAlreadyIssued)
        ));
        assert!(store.issue(Uuid::new_v4(), "voter-1", &device_key()).await.is_ok());
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_public_key() {
        let (store, _) = store().await;
        assert!(matches!(
            store.issue(Uuid::new_v4(), "voter-1", "nothex").await,
            Err(LedgerError::CryptoError(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_only_from_issued() {
        let (store, _) = store().await;
        let issued = store
            .issue(Uuid::new_v4(), "voter-1", &device_key())
            .await
            .unwrap();

        let invalid = store.invalidate(issued.id, "admin@example.org").await.unwrap();
        assert_eq!(invalid.status, CredentialStatus::Invalid);
        assert_eq!(invalid.version, 1);

        assert!(matches!(
            store.invalidate(issued.id, "admin@example.org").await,
            Err(LedgerError::InvalidCredentialError)
        ));
        assert!(matches!(
            store.invalidate(Uuid::new_v4(), "admin@example.org").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_used_is_compare_and_swap() {
        let (store, _) = store().await;
        let issued = store
            .issue(Uuid::new_v4(), "voter-1", &device_key())
            .await
            .unwrap();

        let mut conn = store.db.pool().acquire().await.unwrap();
        assert!(mark_used(&store.db, &mut *conn, &issued).await.unwrap());
        // Same stale snapshot loses the second time.
        assert!(!mark_used(&store.db, &mut *conn, &issued).await.unwrap());
        drop(conn);

        let used = store.get(issued.id).await.unwrap().unwrap();
        assert_eq!(used.status, CredentialStatus::Used);
        assert!(used.used_at.is_some());
    }
}

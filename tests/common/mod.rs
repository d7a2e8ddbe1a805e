#![allow(dead_code)]

use secp256k1::SecretKey;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;
use vote_ledger::crypto::aead::{generate_key, seal_ballot, KEY_LEN};
use vote_ledger::crypto::{client_ballot_message, BallotSignatures, KeyManager};
use vote_ledger::database::Database;
use vote_ledger::voting::{BallotCredential, CastVoteRequest, QueuedBallot, StaticElectionDirectory};
use vote_ledger::LedgerServices;

/// Signing key shared by every test in a binary; RSA generation is slow.
pub fn test_keys() -> Arc<KeyManager> {
    static KEYS: OnceLock<Arc<KeyManager>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(KeyManager::generate(2048).expect("Failed to generate test key")))
        .clone()
}

/// Ballot encryption key held by the "tally ceremony" in tests.
pub fn ballot_key() -> [u8; KEY_LEN] {
    static KEY: OnceLock<[u8; KEY_LEN]> = OnceLock::new();
    *KEY.get_or_init(generate_key)
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

pub struct TestEnv {
    pub services: LedgerServices,
    pub elections: Arc<StaticElectionDirectory>,
}

pub async fn setup_services() -> TestEnv {
    setup_services_with_batch(500).await
}

pub async fn setup_services_with_batch(batch_size: u32) -> TestEnv {
    let elections = Arc::new(StaticElectionDirectory::new());
    let services = LedgerServices::assemble(setup_test_db().await, test_keys(), elections.clone(), batch_size);
    TestEnv { services, elections }
}

impl TestEnv {
    /// Create an open election.
    pub fn open_election(&self) -> Uuid {
        let election = Uuid::new_v4();
        self.elections.open(election);
        election
    }

    pub async fn issue_voter(&self, election_id: Uuid, voter_id: &str) -> TestVoter {
        let signatures = BallotSignatures::new();
        let (secret_key, _) = signatures.generate_keypair();
        let credential = self
            .services
            .credentials
            .issue(election_id, voter_id, &signatures.public_key_hex(&secret_key))
            .await
            .expect("Failed to issue credential");
        TestVoter {
            credential,
            secret_key,
        }
    }
}

/// A voter device: its credential and the key it signs ballots with.
pub struct TestVoter {
    pub credential: BallotCredential,
    pub secret_key: SecretKey,
}

impl TestVoter {
    /// Encrypt and sign a ballot the way a voter device would.
    pub fn ballot(&self, choice: &str) -> CastVoteRequest {
        let election_id = self.credential.election_id;
        let sealed = seal_ballot(&ballot_key(), election_id, choice.as_bytes()).expect("Failed to seal ballot");
        let message = client_ballot_message(
            self.credential.id,
            election_id,
            &sealed.encrypted_payload,
            &sealed.nonce,
        );
        CastVoteRequest {
            credential_id: self.credential.id,
            election_id,
            encrypted_payload: sealed.encrypted_payload,
            nonce: sealed.nonce,
            client_signature: BallotSignatures::new().sign(&message, &self.secret_key),
        }
    }

    pub fn offline_ballot(&self, choice: &str) -> QueuedBallot {
        let request = self.ballot(choice);
        QueuedBallot {
            credential_id: request.credential_id,
            election_id: request.election_id,
            encrypted_payload: request.encrypted_payload,
            nonce: request.nonce,
            client_signature: request.client_signature,
            client_timestamp: vote_ledger::database::now(),
        }
    }
}

/// Remove the sealing triggers so a test can simulate direct tampering.
pub async fn drop_sealing_triggers(db: &Database) {
    sqlx::raw_sql(
        "DROP TRIGGER IF EXISTS ledger_entries_sealed_no_update; \
         DROP TRIGGER IF EXISTS ledger_entries_no_delete;",
    )
    .execute(db.pool())
    .await
    .expect("Failed to drop sealing triggers");
}

pub async fn tamper(db: &Database, sql: &str) {
    sqlx::query(sql)
        .execute(db.pool())
        .await
        .expect("Tampering statement failed");
}

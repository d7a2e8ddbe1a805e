mod common;

use chrono::Duration;
use common::*;
use std::sync::Arc;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use vote_ledger::audit::{merkle, ChainedLedger, EntryCategory, EntryDraft, IntegrityVerifier};
use vote_ledger::crypto::KeyManager;
use vote_ledger::database::Database;

async fn populated(count: usize, batch_size: u32) -> (Arc<ChainedLedger>, IntegrityVerifier) {
    let ledger = Arc::new(ChainedLedger::new(setup_test_db().await, test_keys()).with_batch_size(batch_size));
    for i in 0..count {
        ledger
            .append(EntryDraft::new(EntryCategory::System, format!("event {}", i)))
            .await
            .unwrap();
    }
    let verifier = IntegrityVerifier::new(ledger.clone());
    (ledger, verifier)
}

#[tokio::test]
async fn test_full_verify_over_many_pages() {
    let (_, verifier) = populated(25, 4).await;
    let report = verifier.full_verify(None).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total, 25);
    assert_eq!(report.verified, 25);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_full_verify_on_empty_ledger() {
    let (_, verifier) = populated(0, 10).await;
    let report = verifier.full_verify(None).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total, 0);
}

#[tokio::test]
async fn test_cancelled_full_verify() {
    let (_, verifier) = populated(3, 1).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = verifier.full_verify(Some(&cancel)).await.unwrap();
    assert!(report.cancelled);
    assert!(!report.valid);
    assert!(report.total < 3);
}

#[tokio::test]
async fn test_quick_verify_only_checks_recent_entries() {
    let (ledger, verifier) = populated(3, 10).await;

    // Backdate entry 1 outside the window. This also tampers with it.
    drop_sealing_triggers(ledger.database()).await;
    tamper(
        ledger.database(),
        "UPDATE ledger_entries SET timestamp = '2020-01-01T00:00:00.000000Z' WHERE sequence = 1",
    )
    .await;

    let quick = verifier.quick_verify(Duration::minutes(60)).await.unwrap();
    assert!(quick.valid);
    assert_eq!(quick.total, 2);
    assert_eq!(quick.from_sequence, 2);

    let full = verifier.full_verify(None).await.unwrap();
    assert!(!full.valid);
    assert_eq!(full.hash_mismatches, vec![1]);
}

#[tokio::test]
async fn test_quick_verify_with_nothing_recent() {
    let (ledger, verifier) = populated(2, 10).await;
    drop_sealing_triggers(ledger.database()).await;
    tamper(
        ledger.database(),
        "UPDATE ledger_entries SET timestamp = '2020-01-01T00:00:00.000000Z'",
    )
    .await;

    let report = verifier.quick_verify(Duration::minutes(5)).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total, 0);
}

#[tokio::test]
async fn test_quick_verify_with_unbounded_window() {
    let (ledger, verifier) = populated(3, 10).await;
    drop_sealing_triggers(ledger.database()).await;
    tamper(
        ledger.database(),
        "UPDATE ledger_entries SET description = 'abstain' WHERE sequence = 1",
    )
    .await;

    let report = verifier
        .quick_verify(Duration::days(365 * 1_000_000))
        .await
        .unwrap();
    assert_eq!(report.total, 3);
    assert!(!report.valid);
    assert_eq!(report.hash_mismatches, vec![1]);
}

#[tokio::test]
async fn test_checkpoint_proves_inclusion() {
    let (ledger, verifier) = populated(7, 10).await;

    let checkpoint = verifier.checkpoint(1, 7).await.unwrap();
    assert_eq!(checkpoint.entry_count, 7);
    assert_eq!(checkpoint.from_sequence, 1);
    assert_eq!(checkpoint.to_sequence, 7);
    assert!(verifier
        .verify_checkpoint(1, 7, &checkpoint.merkle_root)
        .await
        .unwrap());

    let entries = ledger.entries(1, 7).await.unwrap();
    let proof = checkpoint.prove(&entries, 5).unwrap();
    assert_eq!(proof.leaf_hash, entries[4].content_hash);
    assert!(proof.verify());

    // New entries do not change a published checkpoint of an earlier range.
    ledger
        .append(EntryDraft::new(EntryCategory::System, "later"))
        .await
        .unwrap();
    assert_eq!(verifier.checkpoint(1, 7).await.unwrap(), checkpoint);
    assert_ne!(
        verifier.checkpoint(1, 8).await.unwrap().merkle_root,
        checkpoint.merkle_root
    );
}

#[tokio::test]
async fn test_checkpoint_detects_rewritten_history() {
    let (ledger, verifier) = populated(4, 10).await;
    let published = verifier.checkpoint(1, 4).await.unwrap();

    drop_sealing_triggers(ledger.database()).await;
    tamper(
        ledger.database(),
        "UPDATE ledger_entries SET content_hash = 'sha512:rewritten' WHERE sequence = 3",
    )
    .await;

    assert!(!verifier
        .verify_checkpoint(1, 4, &published.merkle_root)
        .await
        .unwrap());
    let entries = ledger.entries(1, 4).await.unwrap();
    assert!(published.prove(&entries, 3).is_err());
    assert!(merkle::checkpoint(&entries).is_ok());
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let dir = tempdir().unwrap();
    let private_path = dir.path().join("keys/ledger_private.pem");
    let public_path = dir.path().join("keys/ledger_public.pem");
    let database_url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let timeout = std::time::Duration::from_secs(5);

    {
        let keys = KeyManager::load_or_generate(&private_path, &public_path, 2048).unwrap();
        let db = Database::new(&database_url, 2, timeout).await.unwrap();
        db.run_migrations().await.unwrap();
        let ledger = ChainedLedger::new(db.clone(), Arc::new(keys));
        for description in ["login", "vote", "logout"] {
            ledger
                .append(EntryDraft::new(EntryCategory::System, description))
                .await
                .unwrap();
        }
        db.close().await;
    }

    let keys = KeyManager::load_or_generate(&private_path, &public_path, 2048).unwrap();
    let db = Database::new(&database_url, 2, timeout).await.unwrap();
    db.run_migrations().await.unwrap();
    let ledger = Arc::new(ChainedLedger::new(db, Arc::new(keys)));

    let entry = ledger
        .append(EntryDraft::new(EntryCategory::System, "after restart"))
        .await
        .unwrap();
    assert_eq!(entry.sequence, 4);

    let report = IntegrityVerifier::new(ledger.clone()).full_verify(None).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total, 4);

    // An auditor holding only the public key reaches the same verdict.
    let public_only = Arc::new(KeyManager::load_verifier(&public_path).unwrap());
    let audit_view = Arc::new(ChainedLedger::new(ledger.database().clone(), public_only));
    let report = IntegrityVerifier::new(audit_view.clone()).full_verify(None).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total, 4);
    assert!(audit_view
        .append(EntryDraft::new(EntryCategory::System, "not allowed"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_foreign_key_fails_every_signature() {
    let (ledger, _) = populated(3, 10).await;
    let other_keys = Arc::new(KeyManager::generate(2048).unwrap());
    let impostor = Arc::new(ChainedLedger::new(ledger.database().clone(), other_keys));

    let report = IntegrityVerifier::new(impostor).full_verify(None).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.signature_failures, vec![1, 2, 3]);
    assert!(report.hash_mismatches.is_empty());
    assert!(report.chain_breaks.is_empty());
}

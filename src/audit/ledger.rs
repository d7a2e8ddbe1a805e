//! Chained Ledger
//!
//! Append-only, tamper-evident log stored in SQLite. All appends go through
//! a single async mutex so the chain has exactly one tail at any instant.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::entry::{EntryDraft, LedgerEntry};
use crate::audit::verify::{EntryCheck, IntegrityReport};
use crate::crypto::KeyManager;
use crate::database::{self, is_unique_violation, Database};
use crate::error::LedgerError;

const ENTRY_COLUMNS: &str = "id, sequence, category, description, actor, actor_label, context, \
     resource_type, resource_id, outcome, metadata, error_detail, timestamp, prev_hash, \
     content_hash, signature, sealed";

const DEFAULT_BATCH_SIZE: u32 = 500;

pub struct ChainedLedger {
    db: Database,
    keys: Arc<KeyManager>,
    append_lock: Mutex<()>,
    batch_size: u32,
}

/// Exclusive hold on the ledger tail.
///
/// While a guard is alive no other caller can append, so a caller may append
/// inside its own transaction and commit the entry together with other rows.
/// Dropping the guard releases the lock on every path, including errors.
pub struct AppendGuard<'a> {
    ledger: &'a ChainedLedger,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> AppendGuard<'a> {
    /// Append an entry using the caller's transaction. The entry becomes
    /// visible only when that transaction commits.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        draft: EntryDraft,
    ) -> Result<LedgerEntry, LedgerError> {
        self.ledger.append_locked(&mut **tx, draft).await
    }
}

impl ChainedLedger {
    pub fn new(db: Database, keys: Arc<KeyManager>) -> Self {
        Self {
            db,
            keys,
            append_lock: Mutex::new(()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Number of entries fetched per page while walking the chain.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Acquire the append lock.
    pub async fn lock_tail(&self) -> AppendGuard<'_> {
        AppendGuard {
            ledger: self,
            _lock: self.append_lock.lock().await,
        }
    }

    /// Append a new sealed entry at the tail of the chain.
    pub async fn append(&self, draft: EntryDraft) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_tail().await;
        let mut tx = self
            .db
            .begin_immediate()
            .await
            .map_err(|e| LedgerError::AppendError(e.to_string()))?;

        let entry = guard.append(&mut tx, draft).await?;

        self.db
            .deadline("commit ledger entry", tx.commit())
            .await
            .map_err(|e| LedgerError::AppendError(e.to_string()))?
            .map_err(|e| LedgerError::AppendError(format!("Commit failed: {}", e)))?;

        info!("Appended ledger entry {}", entry.summary());
        Ok(entry)
    }

    async fn append_locked(
        &self,
        conn: &mut SqliteConnection,
        draft: EntryDraft,
    ) -> Result<LedgerEntry, LedgerError> {
        draft.validate()?;

        let tail: Option<(i64, String)> = self
            .db
            .deadline(
                "read ledger tail",
                sqlx::query_as(
                    "SELECT sequence, content_hash FROM ledger_entries ORDER BY sequence DESC LIMIT 1",
                )
                .fetch_optional(&mut *conn),
            )
            .await
            .map_err(|e| LedgerError::AppendError(e.to_string()))?
            .map_err(|e| LedgerError::AppendError(format!("Failed to read tail: {}", e)))?;

        let (sequence, prev_hash) = match tail {
            Some((tail_sequence, tail_hash)) => (tail_sequence as u64 + 1, tail_hash),
            None => (1, String::new()),
        };

        let entry = LedgerEntry::seal(draft, sequence, prev_hash, database::now(), &self.keys)?;
        let metadata = serde_json::to_string(&entry.metadata)?;

        let insert = sqlx::query(
            r#"
            INSERT INTO ledger_entries
            (id, sequence, category, description, actor, actor_label, context, resource_type,
             resource_id, outcome, metadata, error_detail, timestamp, prev_hash, content_hash,
             signature, sealed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.sequence as i64)
        .bind(entry.category.as_str())
        .bind(&entry.description)
        .bind(&entry.actor)
        .bind(&entry.actor_label)
        .bind(entry.context.map(|c| c.to_string()))
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(entry.outcome.as_str())
        .bind(metadata)
        .bind(&entry.error_detail)
        .bind(database::format_timestamp(&entry.timestamp))
        .bind(&entry.prev_hash)
        .bind(&entry.content_hash)
        .bind(&entry.signature)
        .execute(&mut *conn);

        match self.db.deadline("insert ledger entry", insert).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if is_unique_violation(&e) => {
                warn!("Sequence {} was taken by another writer", entry.sequence);
                return Err(LedgerError::AppendError(format!(
                    "Sequence {} already exists",
                    entry.sequence
                )));
            }
            Ok(Err(e)) => {
                return Err(LedgerError::AppendError(format!("Insert failed: {}", e)));
            }
            Err(e) => return Err(LedgerError::AppendError(e.to_string())),
        }

        debug!("Sealed ledger entry {} ({})", entry.sequence, entry.content_hash);
        Ok(entry)
    }

    /// Point lookup by position.
    pub async fn get(&self, sequence: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let query = format!("SELECT {} FROM ledger_entries WHERE sequence = ?", ENTRY_COLUMNS);
        let row = self
            .db
            .timed(
                "fetch ledger entry",
                sqlx::query(&query)
                    .bind(sequence as i64)
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Point lookup by content hash.
    pub async fn get_by_hash(&self, content_hash: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let query = format!(
            "SELECT {} FROM ledger_entries WHERE content_hash = ?",
            ENTRY_COLUMNS
        );
        let row = self
            .db
            .timed(
                "fetch ledger entry by hash",
                sqlx::query(&query)
                    .bind(content_hash)
                    .fetch_optional(self.db.pool()),
            )
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn tail(&self) -> Result<Option<LedgerEntry>, LedgerError> {
        let query = format!(
            "SELECT {} FROM ledger_entries ORDER BY sequence DESC LIMIT 1",
            ENTRY_COLUMNS
        );
        let row = self
            .db
            .timed(
                "fetch ledger tail",
                sqlx::query(&query).fetch_optional(self.db.pool()),
            )
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn len(&self) -> Result<u64, LedgerError> {
        let count: i64 = self
            .db
            .timed(
                "count ledger entries",
                sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries").fetch_one(self.db.pool()),
            )
            .await?;
        Ok(count as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len().await? == 0)
    }

    /// Entries with `from <= sequence <= to`, in sequence order.
    pub async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.page(from, to, u32::MAX).await
    }

    async fn page(&self, from: u64, to: u64, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let query = format!(
            "SELECT {} FROM ledger_entries WHERE sequence >= ? AND sequence <= ? \
             ORDER BY sequence ASC LIMIT ?",
            ENTRY_COLUMNS
        );
        let rows = self
            .db
            .timed(
                "fetch ledger page",
                sqlx::query(&query)
                    .bind(clamp_i64(from))
                    .bind(clamp_i64(to))
                    .bind(i64::from(limit))
                    .fetch_all(self.db.pool()),
            )
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Lowest sequence whose timestamp is at or after `since`.
    pub async fn first_sequence_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Option<u64>, LedgerError> {
        let sequence: Option<i64> = self
            .db
            .timed(
                "find first entry in window",
                sqlx::query_scalar("SELECT MIN(sequence) FROM ledger_entries WHERE timestamp >= ?")
                    .bind(database::format_timestamp(&since))
                    .fetch_one(self.db.pool()),
            )
            .await?;
        Ok(sequence.map(|s| s as u64))
    }

    /// Check one entry: its content hash, its link to the entry at
    /// `sequence - 1`, and its signature.
    pub async fn verify_entry(&self, entry: &LedgerEntry) -> Result<EntryCheck, LedgerError> {
        let predecessor = if entry.sequence > 1 {
            self.get(entry.sequence - 1).await?
        } else {
            None
        };
        Ok(self.check_entry(entry, predecessor.as_ref()))
    }

    /// Pure verification of an entry against a known predecessor.
    pub fn check_entry(&self, entry: &LedgerEntry, predecessor: Option<&LedgerEntry>) -> EntryCheck {
        let hash_ok = entry.verify_hash();
        let chain_ok = if entry.sequence == 1 {
            entry.prev_hash.is_empty()
        } else {
            predecessor.is_some_and(|prev| {
                prev.sequence + 1 == entry.sequence && prev.content_hash == entry.prev_hash
            })
        };
        let signature_ok = entry.verify_signature(&self.keys);

        EntryCheck {
            sequence: entry.sequence,
            hash_ok,
            chain_ok,
            signature_ok,
        }
    }

    pub async fn verify_all(&self) -> Result<IntegrityReport, LedgerError> {
        self.verify_range(1, u64::MAX).await
    }

    pub async fn verify_range(&self, from: u64, to: u64) -> Result<IntegrityReport, LedgerError> {
        self.walk(from, to, None).await
    }

    /// Walk `from..=to` in sequence order, checking every entry. Never stops
    /// at the first failure; stops early only when `cancel` fires.
    pub async fn walk(
        &self,
        from: u64,
        to: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<IntegrityReport, LedgerError> {
        let from = from.max(1);
        let mut report = IntegrityReport::new(from, to);

        let mut predecessor = if from > 1 { self.get(from - 1).await? } else { None };
        let mut next = from;

        while next <= to {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                warn!("Ledger verification cancelled at sequence {}", next);
                report.cancelled = true;
                break;
            }

            let page = self.page(next, to, self.batch_size).await?;
            if page.is_empty() {
                break;
            }

            for entry in &page {
                if entry.sequence != next {
                    // Rows between `next` and this one are missing.
                    debug!("Gap before sequence {} (expected {})", entry.sequence, next);
                    predecessor = None;
                }
                let check = self.check_entry(entry, predecessor.as_ref());
                report.record(&check);
                next = entry.sequence.saturating_add(1);
                predecessor = Some(entry.clone());
            }

            if next == 0 || page.len() < self.batch_size as usize {
                break;
            }
            tokio::task::yield_now().await;
        }

        report.finish();
        if report.valid {
            debug!("Verified {} ledger entries", report.total);
        } else {
            warn!(
                "Ledger verification found {} failures across {} entries",
                report.failed.len(),
                report.total
            );
        }
        Ok(report)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let category: String = row.try_get("category")?;
    let outcome: String = row.try_get("outcome")?;
    let context: Option<String> = row.try_get("context")?;
    let metadata: String = row.try_get("metadata")?;
    let timestamp: String = row.try_get("timestamp")?;
    let id: String = row.try_get("id")?;

    Ok(LedgerEntry {
        id: database::parse_uuid(&id)?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        category: category.parse().map_err(LedgerError::DatabaseError)?,
        description: row.try_get("description")?,
        actor: row.try_get("actor")?,
        actor_label: row.try_get("actor_label")?,
        context: context.as_deref().map(database::parse_uuid).transpose()?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        outcome: outcome.parse().map_err(LedgerError::DatabaseError)?,
        metadata: serde_json::from_str(&metadata)?,
        error_detail: row.try_get("error_detail")?,
        timestamp: database::parse_timestamp(&timestamp)?,
        prev_hash: row.try_get("prev_hash")?,
        content_hash: row.try_get("content_hash")?,
        signature: row.try_get("signature")?,
        sealed: row.try_get::<i64, _>("sealed")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{EntryCategory, Outcome};
    use std::sync::OnceLock;

    fn keys() -> Arc<KeyManager> {
        static KEYS: OnceLock<Arc<KeyManager>> = OnceLock::new();
        KEYS.get_or_init(|| Arc::new(KeyManager::generate(2048).unwrap()))
            .clone()
    }

    async fn ledger() -> ChainedLedger {
        let db = Database::new_in_memory().await.unwrap();
        ChainedLedger::new(db, keys())
    }

    #[tokio::test]
    async fn test_first_entry_has_empty_prev_hash() {
        let ledger = ledger().await;
        let entry = ledger
            .append(EntryDraft::new(EntryCategory::System, "genesis"))
            .await
            .unwrap();

        assert_eq!(entry.sequence, 1);
        assert!(entry.prev_hash.is_empty());
        assert!(entry.sealed);
    }

    #[tokio::test]
    async fn test_entries_link_to_predecessor() {
        let ledger = ledger().await;
        let mut appended = Vec::new();
        for description in ["login", "vote", "logout"] {
            appended.push(
                ledger
                    .append(EntryDraft::new(EntryCategory::System, description))
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(
            appended.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for pair in appended.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].content_hash);
        }
    }

    #[tokio::test]
    async fn test_stored_entry_round_trips() {
        let ledger = ledger().await;
        let appended = ledger
            .append(
                EntryDraft::new(EntryCategory::LoginFailed, "login")
                    .actor("user-1", "bob@example.org")
                    .meta("attempts", 3i64)
                    .outcome(Outcome::Failure, "bad password"),
            )
            .await
            .unwrap();

        let stored = ledger.get(1).await.unwrap().unwrap();
        assert_eq!(stored, appended);
        assert!(stored.verify_hash());
        assert_eq!(
            ledger.get_by_hash(&appended.content_hash).await.unwrap(),
            Some(appended)
        );
        assert!(ledger.get(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_draft_is_not_appended() {
        let ledger = ledger().await;
        let result = ledger.append(EntryDraft::new(EntryCategory::System, "")).await;
        assert!(matches!(result, Err(LedgerError::InvalidEntry(_))));
        assert_eq!(ledger.len().await.unwrap(), 0);

        // The lock was released on the error path.
        assert!(ledger
            .append(EntryDraft::new(EntryCategory::System, "after error"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_sealed_rows_reject_updates_and_deletes() {
        let ledger = ledger().await;
        ledger
            .append(EntryDraft::new(EntryCategory::System, "immutable"))
            .await
            .unwrap();

        let update = sqlx::query("UPDATE ledger_entries SET description = 'changed' WHERE sequence = 1")
            .execute(ledger.database().pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM ledger_entries WHERE sequence = 1")
            .execute(ledger.database().pool())
            .await;
        assert!(delete.is_err());

        let stored = ledger.get(1).await.unwrap().unwrap();
        assert_eq!(stored.description, "immutable");
    }

    #[tokio::test]
    async fn test_walk_spans_multiple_pages() {
        let db = Database::new_in_memory().await.unwrap();
        let ledger = ChainedLedger::new(db, keys()).with_batch_size(2);
        for i in 0..5 {
            ledger
                .append(EntryDraft::new(EntryCategory::System, format!("event {}", i)))
                .await
                .unwrap();
        }

        let report = ledger.verify_all().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total, 5);
        assert_eq!(report.verified, 5);

        let partial = ledger.verify_range(2, 4).await.unwrap();
        assert!(partial.valid);
        assert_eq!(partial.total, 3);
    }

    #[tokio::test]
    async fn test_cancelled_walk_is_reported() {
        let ledger = ledger().await;
        ledger
            .append(EntryDraft::new(EntryCategory::System, "one"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let report = ledger.walk(1, u64::MAX, Some(&token)).await.unwrap();
        assert!(report.cancelled);
        assert!(!report.valid);
        assert_eq!(report.total, 0);
    }
}

//! Audit Event Recorder
//!
//! Turns domain events into ledger entries. Holds no state of its own
//! beyond a counter of audit writes that could not be persisted.

use sqlx::{Sqlite, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::audit::entry::{EntryCategory, EntryDraft, LedgerEntry, Outcome};
use crate::audit::ledger::{AppendGuard, ChainedLedger};
use crate::error::LedgerError;
use crate::voting::elections::ElectionStatus;

/// Label recorded for vote-path entries, which never name a principal.
pub const ANONYMOUS_LABEL: &str = "anonymous";

/// Domain events that produce ledger entries
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Login {
        actor: String,
        actor_label: String,
        source_ip: Option<String>,
    },
    Logout {
        actor: String,
        actor_label: String,
    },
    LoginFailed {
        actor_label: String,
        reason: String,
        source_ip: Option<String>,
    },
    CredentialIssued {
        election_id: Uuid,
        voter_id: String,
    },
    CredentialInvalidated {
        election_id: Uuid,
        actor_label: String,
    },
    VoteCast {
        election_id: Uuid,
        vote_token: Uuid,
    },
    /// A rejected or failed vote. `detail` must already be redacted.
    VoteRejected {
        election_id: Uuid,
        outcome: Outcome,
        reason_code: String,
        detail: String,
    },
    VoteConfirmed {
        election_id: Uuid,
        vote_id: Uuid,
        signature_valid: bool,
    },
    VoteQueued {
        election_id: Uuid,
        queue_entry_id: Uuid,
    },
    VoteSynced {
        election_id: Uuid,
        queue_entry_id: Uuid,
        result: Result<Uuid, String>,
    },
    ElectionStatusChanged {
        election_id: Uuid,
        actor: String,
        actor_label: String,
        from: ElectionStatus,
        to: ElectionStatus,
    },
    Custom(EntryDraft),
}

impl AuditEvent {
    pub fn into_draft(self) -> EntryDraft {
        match self {
            AuditEvent::Login {
                actor,
                actor_label,
                source_ip,
            } => EntryDraft::new(EntryCategory::Login, "User logged in")
                .actor(actor.clone(), actor_label)
                .resource("user", actor)
                .meta("source_ip", source_ip),
            AuditEvent::Logout { actor, actor_label } => {
                EntryDraft::new(EntryCategory::Logout, "User logged out")
                    .actor(actor.clone(), actor_label)
                    .resource("user", actor)
            }
            AuditEvent::LoginFailed {
                actor_label,
                reason,
                source_ip,
            } => EntryDraft::new(EntryCategory::LoginFailed, "Login attempt failed")
                .actor_label(actor_label)
                .meta("source_ip", source_ip)
                .outcome(Outcome::Failure, reason),
            AuditEvent::CredentialIssued {
                election_id,
                voter_id,
            } => EntryDraft::new(EntryCategory::CredentialIssued, "Ballot credential issued")
                .actor_label("system")
                .context(election_id)
                .resource("voter", voter_id),
            AuditEvent::CredentialInvalidated {
                election_id,
                actor_label,
            } => EntryDraft::new(
                EntryCategory::CredentialInvalidated,
                "Ballot credential invalidated",
            )
            .actor_label(actor_label)
            .context(election_id),
            AuditEvent::VoteCast {
                election_id,
                vote_token,
            } => EntryDraft::new(EntryCategory::VoteCast, "Vote cast")
                .actor_label(ANONYMOUS_LABEL)
                .context(election_id)
                .resource("cast_vote", vote_token.to_string())
                .meta("vote_token", vote_token),
            AuditEvent::VoteRejected {
                election_id,
                outcome,
                reason_code,
                detail,
            } => EntryDraft::new(EntryCategory::VoteRejected, "Vote rejected")
                .actor_label(ANONYMOUS_LABEL)
                .context(election_id)
                .meta("reason_code", reason_code)
                .outcome(outcome, detail),
            AuditEvent::VoteConfirmed {
                election_id,
                vote_id,
                signature_valid,
            } => {
                let draft = EntryDraft::new(EntryCategory::VoteConfirmed, "Vote confirmation")
                    .context(election_id)
                    .resource("cast_vote", vote_id.to_string())
                    .meta("signature_valid", signature_valid);
                if signature_valid {
                    draft
                } else {
                    draft.outcome(Outcome::Warning, "vote signature failed re-verification")
                }
            }
            AuditEvent::VoteQueued {
                election_id,
                queue_entry_id,
            } => EntryDraft::new(EntryCategory::VoteQueued, "Offline vote queued")
                .actor_label(ANONYMOUS_LABEL)
                .context(election_id)
                .resource("offline_vote", queue_entry_id.to_string()),
            AuditEvent::VoteSynced {
                election_id,
                queue_entry_id,
                result,
            } => {
                let draft = EntryDraft::new(EntryCategory::VoteSynced, "Offline vote synchronized")
                    .actor_label(ANONYMOUS_LABEL)
                    .context(election_id)
                    .resource("offline_vote", queue_entry_id.to_string());
                match result {
                    Ok(vote_id) => draft.meta("vote_id", vote_id),
                    Err(reason) => draft.outcome(Outcome::Failure, reason),
                }
            }
            AuditEvent::ElectionStatusChanged {
                election_id,
                actor,
                actor_label,
                from,
                to,
            } => EntryDraft::new(
                EntryCategory::ElectionStatusChanged,
                format!("Election status changed from {} to {}", from, to),
            )
            .actor(actor, actor_label)
            .context(election_id)
            .resource("election", election_id.to_string())
            .meta("from", from.as_str())
            .meta("to", to.as_str()),
            AuditEvent::Custom(draft) => draft,
        }
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    ledger: Arc<ChainedLedger>,
    failed_writes: Arc<AtomicU64>,
}

impl AuditRecorder {
    pub fn new(ledger: Arc<ChainedLedger>) -> Self {
        Self {
            ledger,
            failed_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ledger(&self) -> &Arc<ChainedLedger> {
        &self.ledger
    }

    /// Append an event, returning the error to the caller (audit-or-abort).
    pub async fn record(&self, event: AuditEvent) -> Result<LedgerEntry, LedgerError> {
        self.ledger.append(event.into_draft()).await
    }

    /// Append an event without letting an audit failure abort the caller.
    /// Failures are logged and counted, never dropped silently.
    pub async fn record_best_effort(&self, event: AuditEvent) -> Option<LedgerEntry> {
        let draft = event.into_draft();
        let category = draft.category;
        match self.ledger.append(draft).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!("Failed to record {} audit entry: {}", category, e);
                None
            }
        }
    }

    /// Append inside the caller's transaction so the entry commits or rolls
    /// back together with the business rows.
    pub async fn record_in(
        &self,
        guard: &AppendGuard<'_>,
        tx: &mut Transaction<'_, Sqlite>,
        event: AuditEvent,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = guard.append(tx, event.into_draft()).await?;
        debug!("Staged ledger entry {} in caller transaction", entry.sequence);
        Ok(entry)
    }

    /// Record a correction of an earlier entry. The original is never
    /// modified; the new entry references it by sequence and hash.
    pub async fn record_correction(
        &self,
        original: &LedgerEntry,
        actor: impl Into<String>,
        actor_label: impl Into<String>,
        detail: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let draft = EntryDraft::new(EntryCategory::Correction, detail)
            .actor(actor, actor_label)
            .resource("ledger_entry", original.sequence.to_string())
            .meta("original_sequence", original.sequence)
            .meta("original_hash", original.content_hash.clone());
        let draft = match original.context {
            Some(context) => draft.context(context),
            None => draft,
        };
        self.ledger.append(draft).await
    }

    /// Number of best-effort audit writes that failed since startup.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

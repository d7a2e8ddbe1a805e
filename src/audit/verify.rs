//! Ledger Verification
//!
//! Read-only chain audits for operators. Reports collect every failure
//! rather than stopping at the first one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::ledger::ChainedLedger;
use crate::audit::merkle::{self, LedgerCheckpoint};
use crate::error::LedgerError;

/// Why a single entry failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HashMismatch,
    ChainBreak,
    SignatureInvalid,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::HashMismatch => "hash-mismatch",
            FailureReason::ChainBreak => "chain-break",
            FailureReason::SignatureInvalid => "signature-invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub sequence: u64,
    pub reason: FailureReason,
}

/// Outcome of the three per-entry checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCheck {
    pub sequence: u64,
    pub hash_ok: bool,
    pub chain_ok: bool,
    pub signature_ok: bool,
}

impl EntryCheck {
    pub fn is_valid(&self) -> bool {
        self.hash_ok && self.chain_ok && self.signature_ok
    }

    pub fn failures(&self) -> Vec<FailureReason> {
        let mut reasons = Vec::new();
        if !self.hash_ok {
            reasons.push(FailureReason::HashMismatch);
        }
        if !self.chain_ok {
            reasons.push(FailureReason::ChainBreak);
        }
        if !self.signature_ok {
            reasons.push(FailureReason::SignatureInvalid);
        }
        reasons
    }
}

/// Structured result of a chain walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub total: u64,
    pub verified: u64,
    pub failed: Vec<EntryFailure>,
    pub chain_breaks: Vec<u64>,
    pub signature_failures: Vec<u64>,
    pub hash_mismatches: Vec<u64>,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IntegrityReport {
    pub fn new(from_sequence: u64, to_sequence: u64) -> Self {
        Self {
            valid: true,
            total: 0,
            verified: 0,
            failed: Vec::new(),
            chain_breaks: Vec::new(),
            signature_failures: Vec::new(),
            hash_mismatches: Vec::new(),
            from_sequence,
            to_sequence,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Report for a walk over an empty range.
    pub fn empty() -> Self {
        let mut report = Self::new(0, 0);
        report.finish();
        report
    }

    pub fn record(&mut self, check: &EntryCheck) {
        self.total += 1;
        if check.is_valid() {
            self.verified += 1;
            return;
        }

        for reason in check.failures() {
            match reason {
                FailureReason::HashMismatch => self.hash_mismatches.push(check.sequence),
                FailureReason::ChainBreak => self.chain_breaks.push(check.sequence),
                FailureReason::SignatureInvalid => self.signature_failures.push(check.sequence),
            }
            self.failed.push(EntryFailure {
                sequence: check.sequence,
                reason,
            });
        }
    }

    pub fn finish(&mut self) {
        self.valid = self.failed.is_empty() && !self.cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> String {
        if self.cancelled {
            format!(
                "Verification cancelled after {} entries ({} verified, {} failures)",
                self.total,
                self.verified,
                self.failed.len()
            )
        } else if self.valid {
            format!("Ledger is valid ({} entries verified)", self.verified)
        } else {
            format!(
                "Ledger is INVALID: {} of {} entries failed ({} chain breaks, {} signature failures, {} hash mismatches)",
                self.total - self.verified,
                self.total,
                self.chain_breaks.len(),
                self.signature_failures.len(),
                self.hash_mismatches.len()
            )
        }
    }
}

/// Operator-facing verification entry points.
pub struct IntegrityVerifier {
    ledger: Arc<ChainedLedger>,
}

impl IntegrityVerifier {
    pub fn new(ledger: Arc<ChainedLedger>) -> Self {
        Self { ledger }
    }

    /// Verify only entries written within `window` of now. The first entry
    /// in the window is still checked against its predecessor. A window
    /// reaching past the representable time range covers the whole ledger.
    pub async fn quick_verify(&self, window: Duration) -> Result<IntegrityReport, LedgerError> {
        let Some(since) = Utc::now().checked_sub_signed(window) else {
            info!("Quick verification window covers the whole ledger");
            return self.full_verify(None).await;
        };
        let Some(from) = self.ledger.first_sequence_since(since).await? else {
            info!("No ledger entries in the last {} minutes", window.num_minutes());
            return Ok(IntegrityReport::empty());
        };

        let report = self.ledger.walk(from, u64::MAX, None).await?;
        log_report("Quick", &report);
        Ok(report)
    }

    /// Walk the whole ledger. Cancelling `cancel` stops the walk between
    /// pages; the partial report is returned with `cancelled` set.
    pub async fn full_verify(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<IntegrityReport, LedgerError> {
        let report = self.ledger.walk(1, u64::MAX, cancel).await?;
        log_report("Full", &report);
        Ok(report)
    }

    pub async fn verify_range(&self, from: u64, to: u64) -> Result<IntegrityReport, LedgerError> {
        let report = self.ledger.verify_range(from, to).await?;
        log_report("Range", &report);
        Ok(report)
    }

    /// Merkle checkpoint over `from..=to`.
    pub async fn checkpoint(&self, from: u64, to: u64) -> Result<LedgerCheckpoint, LedgerError> {
        let entries = self.ledger.entries(from, to).await?;
        merkle::checkpoint(&entries)
    }

    /// Recompute the checkpoint for a range and compare to a published root.
    pub async fn verify_checkpoint(
        &self,
        from: u64,
        to: u64,
        claimed_root: &str,
    ) -> Result<bool, LedgerError> {
        let checkpoint = self.checkpoint(from, to).await?;
        Ok(checkpoint.merkle_root == claimed_root)
    }
}

fn log_report(kind: &str, report: &IntegrityReport) {
    if report.valid {
        info!("{} verification: {}", kind, report.summary());
    } else {
        warn!("{} verification: {}", kind, report.summary());
    }
}

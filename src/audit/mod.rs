//! Audit Ledger
//!
//! Tamper-evident ledger of audited actions: SHA-512 hash chain, RSA-PSS
//! signed entries, integrity verification and Merkle checkpoints.

pub mod entry;
pub mod ledger;
pub mod merkle;
pub mod recorder;
pub mod verify;

pub use entry::{EntryCategory, EntryDraft, LedgerEntry, MetaValue, Metadata, Outcome};
pub use ledger::{AppendGuard, ChainedLedger};
pub use merkle::{LedgerCheckpoint, MerkleProof};
pub use recorder::{AuditEvent, AuditRecorder};
pub use verify::{EntryCheck, EntryFailure, FailureReason, IntegrityReport, IntegrityVerifier};

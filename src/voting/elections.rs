//! Election status lookup.
//!
//! Election scheduling lives in another service; voting only needs to know
//! whether an election currently accepts ballots.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Draft,
    Scheduled,
    Open,
    Closed,
    Cancelled,
}

impl ElectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionStatus::Draft => "draft",
            ElectionStatus::Scheduled => "scheduled",
            ElectionStatus::Open => "open",
            ElectionStatus::Closed => "closed",
            ElectionStatus::Cancelled => "cancelled",
        }
    }

    pub fn accepts_votes(&self) -> bool {
        *self == ElectionStatus::Open
    }
}

impl fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of election status
#[async_trait]
pub trait ElectionDirectory: Send + Sync {
    /// `None` when the election is unknown.
    async fn election_status(&self, election_id: Uuid) -> Result<Option<ElectionStatus>, LedgerError>;
}

/// Reject unless the election exists and is open.
pub async fn ensure_open(
    directory: &dyn ElectionDirectory,
    election_id: Uuid,
) -> Result<(), LedgerError> {
    match directory.election_status(election_id).await? {
        Some(status) if status.accepts_votes() => Ok(()),
        _ => Err(LedgerError::ElectionNotOpen),
    }
}

/// In-process directory, for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct StaticElectionDirectory {
    elections: RwLock<HashMap<Uuid, ElectionStatus>>,
}

impl StaticElectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an election's status, returning the previous one.
    pub fn set_status(&self, election_id: Uuid, status: ElectionStatus) -> Option<ElectionStatus> {
        match self.elections.write() {
            Ok(mut elections) => elections.insert(election_id, status),
            Err(poisoned) => poisoned.into_inner().insert(election_id, status),
        }
    }

    pub fn open(&self, election_id: Uuid) {
        self.set_status(election_id, ElectionStatus::Open);
    }
}

#[async_trait]
impl ElectionDirectory for StaticElectionDirectory {
    async fn election_status(&self, election_id: Uuid) -> Result<Option<ElectionStatus>, LedgerError> {
        let status = match self.elections.read() {
            Ok(elections) => elections.get(&election_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(&election_id).copied(),
        };
        Ok(status)
    }
}

//! Merkle Checkpoints
//!
//! Merkle roots over the content hashes of a ledger range, so a published
//! root can later prove that an entry was covered. Leaves and interior
//! nodes are hashed under distinct prefixes, and an unpaired last node is
//! promoted to the next level unchanged.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::debug;

use crate::audit::entry::{LedgerEntry, HASH_PREFIX};
use crate::error::LedgerError;

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

fn tagged_hash(tag: u8, parts: &[&str]) -> String {
    let mut hasher = Sha512::new();
    hasher.update([tag]);
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

fn leaf_node(leaf: &str) -> String {
    tagged_hash(LEAF_TAG, &[leaf])
}

fn combine(left: &str, right: &str) -> String {
    tagged_hash(NODE_TAG, &[left, right])
}

/// All levels of the tree, leaf nodes first, root last.
fn build_levels(leaves: &[String]) -> Vec<Vec<String>> {
    let mut levels = vec![leaves.iter().map(|leaf| leaf_node(leaf)).collect::<Vec<_>>()];
    while levels.last().is_some_and(|level| level.len() > 1) {
        let current = &levels[levels.len() - 1];
        let next: Vec<String> = current
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => combine(left, right),
                _ => pair[0].clone(),
            })
            .collect();
        levels.push(next);
    }
    levels
}

/// Merkle root over leaf hashes, in order.
pub fn merkle_root(leaves: &[String]) -> Result<String, LedgerError> {
    if leaves.is_empty() {
        return Err(LedgerError::InvalidEntry(
            "Cannot build Merkle tree from empty entries".to_string(),
        ));
    }
    let levels = build_levels(leaves);
    levels
        .last()
        .and_then(|root| root.first())
        .cloned()
        .ok_or_else(|| LedgerError::InvalidEntry("Empty Merkle tree".to_string()))
}

/// Which side the sibling sits on when climbing the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: String,
    pub steps: Vec<ProofStep>,
    pub root_hash: String,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        let computed = self
            .steps
            .iter()
            .fold(leaf_node(&self.leaf_hash), |current, step| match step.side {
                Side::Left => combine(&step.hash, &current),
                Side::Right => combine(&current, &step.hash),
            });
        computed == self.root_hash
    }

    pub fn size(&self) -> usize {
        self.steps.len()
    }
}

pub fn generate_proof(leaves: &[String], index: usize) -> Result<MerkleProof, LedgerError> {
    if index >= leaves.len() {
        return Err(LedgerError::InvalidEntry(format!(
            "Leaf index {} out of range ({} leaves)",
            index,
            leaves.len()
        )));
    }

    let levels = build_levels(leaves);
    let mut steps = Vec::with_capacity(levels.len().saturating_sub(1));
    let mut position = index;

    for level in &levels[..levels.len() - 1] {
        if position % 2 == 1 {
            steps.push(ProofStep {
                hash: level[position - 1].clone(),
                side: Side::Left,
            });
        } else if let Some(sibling) = level.get(position + 1) {
            steps.push(ProofStep {
                hash: sibling.clone(),
                side: Side::Right,
            });
        }
        // An unpaired last node is promoted without a step.
        position /= 2;
    }

    Ok(MerkleProof {
        leaf_hash: leaves[index].clone(),
        steps,
        root_hash: merkle_root(leaves)?,
    })
}

/// Published summary of a ledger range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCheckpoint {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub entry_count: usize,
    pub first_entry_hash: String,
    pub last_entry_hash: String,
    pub merkle_root: String,
}

impl LedgerCheckpoint {
    pub fn summary(&self) -> String {
        format!(
            "Entries {}..={} ({} entries), root: {}",
            self.from_sequence, self.to_sequence, self.entry_count, self.merkle_root
        )
    }

    /// Proof that `entry` is covered by this checkpoint.
    pub fn prove(&self, entries: &[LedgerEntry], sequence: u64) -> Result<MerkleProof, LedgerError> {
        let index = entries
            .iter()
            .position(|e| e.sequence == sequence)
            .ok_or_else(|| LedgerError::NotFound(format!("ledger entry {}", sequence)))?;
        let proof = generate_proof(&leaf_hashes(entries), index)?;
        if proof.root_hash != self.merkle_root {
            return Err(LedgerError::InvalidEntry(
                "Entries do not match this checkpoint".to_string(),
            ));
        }
        Ok(proof)
    }
}

fn leaf_hashes(entries: &[LedgerEntry]) -> Vec<String> {
    entries.iter().map(|e| e.content_hash.clone()).collect()
}

pub fn checkpoint(entries: &[LedgerEntry]) -> Result<LedgerCheckpoint, LedgerError> {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Err(LedgerError::InvalidEntry(
            "Cannot checkpoint an empty range".to_string(),
        ));
    };

    let merkle_root = merkle_root(&leaf_hashes(entries))?;
    debug!("Checkpoint over {} entries: {}", entries.len(), merkle_root);

    Ok(LedgerCheckpoint {
        from_sequence: first.sequence,
        to_sequence: last.sequence,
        entry_count: entries.len(),
        first_entry_hash: first.content_hash.clone(),
        last_entry_hash: last.content_hash.clone(),
        merkle_root,
    })
}

//! Vote payload encryption
//!
//! AES-256-GCM with a 96-bit nonce. The election id is bound as associated
//! data, so a ciphertext cannot be replayed into another election.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::error::LedgerError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Ciphertext and nonce, both base64 encoded as they travel and are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBallot {
    pub encrypted_payload: String,
    pub nonce: String,
}

/// Decoded, length-checked form of a submitted payload.
pub struct DecodedBallot {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Check that a payload and nonce are decodable without decrypting them.
pub fn decode_ballot(encrypted_payload: &str, nonce: &str) -> Result<DecodedBallot, LedgerError> {
    let ciphertext = STANDARD
        .decode(encrypted_payload)
        .map_err(|_| LedgerError::MalformedVoteError("payload is not valid base64".to_string()))?;
    if ciphertext.len() < TAG_LEN {
        return Err(LedgerError::MalformedVoteError(
            "payload is shorter than an authentication tag".to_string(),
        ));
    }

    let nonce_bytes = STANDARD
        .decode(nonce)
        .map_err(|_| LedgerError::MalformedVoteError("nonce is not valid base64".to_string()))?;
    let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|_| {
        LedgerError::MalformedVoteError(format!("nonce must be {} bytes", NONCE_LEN))
    })?;

    Ok(DecodedBallot { ciphertext, nonce })
}

/// Encrypt a ballot for an election with a fresh random nonce.
pub fn seal_ballot(
    key: &[u8],
    election_id: Uuid,
    plaintext: &[u8],
) -> Result<SealedBallot, LedgerError> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aad = election_id.as_bytes();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| LedgerError::CryptoError("Ballot encryption failed".to_string()))?;

    Ok(SealedBallot {
        encrypted_payload: STANDARD.encode(ciphertext),
        nonce: STANDARD.encode(nonce),
    })
}

/// Authenticated decryption. Any tag mismatch, wrong key or wrong election
/// surfaces as `DecryptionError`.
pub fn open_ballot(
    key: &[u8],
    election_id: Uuid,
    encrypted_payload: &str,
    nonce: &str,
) -> Result<Vec<u8>, LedgerError> {
    let cipher = cipher_for(key)?;
    let decoded = decode_ballot(encrypted_payload, nonce).map_err(|_| LedgerError::DecryptionError)?;

    cipher
        .decrypt(
            Nonce::from_slice(&decoded.nonce),
            Payload {
                msg: &decoded.ciphertext,
                aad: election_id.as_bytes(),
            },
        )
        .map_err(|_| LedgerError::DecryptionError)
}

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, LedgerError> {
    if key.len() != KEY_LEN {
        return Err(LedgerError::CryptoError(format!(
            "Ballot key must be {} bytes, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| LedgerError::CryptoError("Invalid ballot key".to_string()))
}

//! Client ballot signatures
//!
//! Voter devices hold a secp256k1 key registered with their ballot
//! credential and sign every submission with ECDSA over SHA-256.

use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Canonical message a client signs when submitting a ballot.
#[derive(Serialize)]
struct ClientBallotMessage<'a> {
    credential_id: String,
    election_id: String,
    encrypted_payload: &'a str,
    nonce: &'a str,
}

pub fn client_ballot_message(
    credential_id: Uuid,
    election_id: Uuid,
    encrypted_payload: &str,
    nonce: &str,
) -> Vec<u8> {
    let message = ClientBallotMessage {
        credential_id: credential_id.to_string(),
        election_id: election_id.to_string(),
        encrypted_payload,
        nonce,
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_vec(&message).unwrap_or_default()
}

pub struct BallotSignatures {
    secp: Secp256k1<All>,
}

impl BallotSignatures {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Produce a DER-hex signature, as a voter device would.
    pub fn sign(&self, message: &[u8], secret_key: &SecretKey) -> String {
        let digest = Message::from_digest(Sha256::digest(message).into());
        let signature = self.secp.sign_ecdsa(&digest, secret_key);
        hex::encode(&*signature.serialize_der())
    }

    /// Verify a DER-hex signature against a hex-encoded public key.
    /// Undecodable keys or signatures verify as `false`.
    pub fn verify(&self, message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
        let Ok(public_key) = parse_public_key(public_key_hex) else {
            return false;
        };
        let Ok(signature_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut signature) = Signature::from_der(&signature_bytes) else {
            return false;
        };
        signature.normalize_s();

        let digest = Message::from_digest(Sha256::digest(message).into());
        self.secp
            .verify_ecdsa(&digest, &signature, &public_key)
            .is_ok()
    }

    pub fn generate_keypair(&self) -> (SecretKey, PublicKey) {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        (secret_key, public_key)
    }

    pub fn public_key_hex(&self, secret_key: &SecretKey) -> String {
        hex::encode(PublicKey::from_secret_key(&self.secp, secret_key).serialize())
    }
}

impl Default for BallotSignatures {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse and validate a hex-encoded compressed or uncompressed public key.
pub fn parse_public_key(public_key_hex: &str) -> Result<PublicKey, String> {
    let bytes = hex::decode(public_key_hex).map_err(|e| format!("Invalid public key hex: {}", e))?;
    PublicKey::from_slice(&bytes).map_err(|e| format!("Invalid public key: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signatures = BallotSignatures::new();
        let (secret_key, _) = signatures.generate_keypair();
        let public_key = signatures.public_key_hex(&secret_key);

        let message = client_ballot_message(Uuid::new_v4(), Uuid::new_v4(), "cGF5bG9hZA==", "bm9uY2U=");
        let signature = signatures.sign(&message, &secret_key);

        assert!(signatures.verify(&message, &signature, &public_key));
        assert!(!signatures.verify(b"tampered", &signature, &public_key));
    }

    #[test]
    fn test_wrong_key_and_garbage() {
        let signatures = BallotSignatures::new();
        let (secret_key, _) = signatures.generate_keypair();
        let (other_key, _) = signatures.generate_keypair();
        let message = b"ballot";
        let signature = signatures.sign(message, &secret_key);

        assert!(!signatures.verify(message, &signature, &signatures.public_key_hex(&other_key)));
        assert!(!signatures.verify(message, "zz", &signatures.public_key_hex(&secret_key)));
        assert!(!signatures.verify(message, &signature, "not-a-key"));
        assert!(parse_public_key("02abcdef").is_err());
    }

    #[test]
    fn test_client_message_is_stable() {
        let credential = Uuid::new_v4();
        let election = Uuid::new_v4();
        assert_eq!(
            client_ballot_message(credential, election, "a", "b"),
            client_ballot_message(credential, election, "a", "b")
        );
        assert_ne!(
            client_ballot_message(credential, election, "a", "b"),
            client_ballot_message(credential, election, "a", "c")
        );
    }
}

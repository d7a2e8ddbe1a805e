//! Cryptographic primitives: the ledger signing key, voter-device ballot
//! signatures and vote payload encryption.

pub mod aead;
pub mod key_management;
pub mod signatures;

pub use aead::{open_ballot, seal_ballot, SealedBallot};
pub use key_management::KeyManager;
pub use signatures::{client_ballot_message, BallotSignatures};

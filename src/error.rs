use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEntry(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Storage operation timed out: {0}")]
    StorageTimeout(String),

    #[error("Failed to load signing key: {0}")]
    KeyLoadError(String),

    #[error("Signing key pair mismatch: {0}")]
    KeyMismatchError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Ledger append failed: {0}")]
    AppendError(String),

    #[error("Invalid ledger entry: {0}")]
    InvalidEntry(String),

    // Vote-path messages are deliberately fixed strings: they must not say
    // which credential, voter or token triggered the rejection.
    #[error("Ballot credential rejected")]
    InvalidCredentialError,

    #[error("A vote has already been recorded for this ballot")]
    DuplicateVoteError,

    #[error("Malformed vote: {0}")]
    MalformedVoteError(String),

    #[error("Election is not open for voting")]
    ElectionNotOpen,

    #[error("A ballot credential has already been issued to this voter")]
    CredentialAlreadyIssued,

    #[error("An offline vote is already queued for this ballot")]
    AlreadyQueuedError,

    #[error("Vote payload could not be decrypted")]
    DecryptionError,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller-fixable input problem; do not retry.
    Validation,
    /// The operation conflicts with existing state; do not retry.
    Conflict,
    /// Transient storage or persistence failure; retry with backoff.
    Infrastructure,
    /// Signing material is missing or unusable; fatal at startup.
    Key,
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidCredentialError
            | Self::MalformedVoteError(_)
            | Self::ElectionNotOpen
            | Self::InvalidEntry(_)
            | Self::DecryptionError
            | Self::NotFound(_)
            | Self::ConfigError(_) => ErrorClass::Validation,
            Self::DuplicateVoteError
            | Self::AlreadyQueuedError
            | Self::CredentialAlreadyIssued => ErrorClass::Conflict,
            Self::DatabaseError(_) | Self::StorageTimeout(_) | Self::AppendError(_) => {
                ErrorClass::Infrastructure
            }
            Self::KeyLoadError(_) | Self::KeyMismatchError(_) | Self::CryptoError(_) => {
                ErrorClass::Key
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// Short machine-readable code recorded in audit metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config",
            Self::DatabaseError(_) => "database",
            Self::StorageTimeout(_) => "storage_timeout",
            Self::KeyLoadError(_) => "key_load",
            Self::KeyMismatchError(_) => "key_mismatch",
            Self::CryptoError(_) => "crypto",
            Self::AppendError(_) => "append",
            Self::InvalidEntry(_) => "invalid_entry",
            Self::InvalidCredentialError => "invalid_credential",
            Self::DuplicateVoteError => "duplicate_vote",
            Self::MalformedVoteError(_) => "malformed_vote",
            Self::ElectionNotOpen => "election_not_open",
            Self::CredentialAlreadyIssued => "credential_already_issued",
            Self::AlreadyQueuedError => "already_queued",
            Self::DecryptionError => "decryption",
            Self::NotFound(_) => "not_found",
        }
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(LedgerError::DuplicateVoteError.class(), ErrorClass::Conflict);
        assert_eq!(LedgerError::AlreadyQueuedError.class(), ErrorClass::Conflict);
        assert_eq!(
            LedgerError::MalformedVoteError("nonce".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            LedgerError::KeyMismatchError("x".into()).class(),
            ErrorClass::Key
        );
        assert!(LedgerError::StorageTimeout("append".into()).is_retryable());
        assert!(LedgerError::AppendError("disk full".into()).is_retryable());
        assert!(!LedgerError::InvalidCredentialError.is_retryable());
    }

    #[test]
    fn test_vote_errors_do_not_leak_identifiers() {
        let duplicate = LedgerError::DuplicateVoteError.to_string();
        let invalid = LedgerError::InvalidCredentialError.to_string();
        assert!(!duplicate.contains("credential"));
        assert!(!invalid.contains('-'));
        assert_eq!(LedgerError::DuplicateVoteError.code(), "duplicate_vote");
    }
}

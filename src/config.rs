//! Ledger configuration
//!
//! Layered as built-in defaults, an optional TOML file, then `VOTE_LEDGER_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::LedgerError;

/// Smallest RSA modulus accepted for the ledger signing key.
pub const MIN_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub storage_timeout_secs: u64,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub key_bits: usize,
    pub quick_verify_window_minutes: i64,
    pub verify_batch_size: u32,
    pub log_filter: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://vote_ledger.db".to_string(),
            max_connections: 5,
            storage_timeout_secs: 10,
            private_key_path: PathBuf::from("keys/ledger_private.pem"),
            public_key_path: PathBuf::from("keys/ledger_public.pem"),
            key_bits: 4096,
            quick_verify_window_minutes: 60,
            verify_batch_size: 500,
            log_filter: "vote_ledger=info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration, optionally reading a TOML file first.
    pub fn load(path: Option<&Path>) -> Result<Self, LedgerError> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("database_url", defaults.database_url.clone())?
            .set_default("max_connections", defaults.max_connections as i64)?
            .set_default("storage_timeout_secs", defaults.storage_timeout_secs as i64)?
            .set_default(
                "private_key_path",
                defaults.private_key_path.to_string_lossy().to_string(),
            )?
            .set_default(
                "public_key_path",
                defaults.public_key_path.to_string_lossy().to_string(),
            )?
            .set_default("key_bits", defaults.key_bits as i64)?
            .set_default(
                "quick_verify_window_minutes",
                defaults.quick_verify_window_minutes,
            )?
            .set_default("verify_batch_size", defaults.verify_batch_size as i64)?
            .set_default("log_filter", defaults.log_filter.clone())?;

        if let Some(path) = path {
            if !path.exists() {
                return Err(LedgerError::ConfigError(format!(
                    "Configuration file not found: {:?}",
                    path
                )));
            }
            info!("Loading ledger configuration from: {:?}", path);
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("VOTE_LEDGER").try_parsing(true))
            .build()?;

        let config: LedgerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "database_url must not be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(LedgerError::ConfigError(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.storage_timeout_secs == 0 {
            return Err(LedgerError::ConfigError(
                "storage_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.key_bits < MIN_KEY_BITS {
            return Err(LedgerError::ConfigError(format!(
                "key_bits ({}) is below the minimum of {}",
                self.key_bits, MIN_KEY_BITS
            )));
        }

        if self.quick_verify_window_minutes <= 0 {
            return Err(LedgerError::ConfigError(
                "quick_verify_window_minutes must be positive".to_string(),
            ));
        }

        if self.verify_batch_size == 0 {
            return Err(LedgerError::ConfigError(
                "verify_batch_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn quick_verify_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.quick_verify_window_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_bits, 4096);
        assert_eq!(config.storage_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_small_keys() {
        let config = LedgerConfig {
            key_bits: 1024,
            ..LedgerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LedgerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "database_url = \"sqlite://custom.db\"").unwrap();
        writeln!(file, "verify_batch_size = 50").unwrap();

        let config = LedgerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database_url, "sqlite://custom.db");
        assert_eq!(config.verify_batch_size, 50);
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = LedgerConfig::load(Some(Path::new("/nonexistent/ledger.toml")));
        assert!(matches!(result, Err(LedgerError::ConfigError(_))));
    }
}

//! Process-wide wiring of the ledger components.
//!
//! Constructed once at startup and handed to whatever serves requests;
//! every component shares the same database, signing key and ledger.

use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditRecorder, ChainedLedger, IntegrityVerifier};
use crate::config::LedgerConfig;
use crate::crypto::KeyManager;
use crate::database::Database;
use crate::error::LedgerError;
use crate::voting::{AnonymousVoteCaster, CredentialStore, ElectionDirectory, OfflineVoteQueue};

pub struct LedgerServices {
    pub database: Database,
    pub keys: Arc<KeyManager>,
    pub ledger: Arc<ChainedLedger>,
    pub recorder: AuditRecorder,
    pub credentials: CredentialStore,
    pub caster: Arc<AnonymousVoteCaster>,
    pub offline_queue: Arc<OfflineVoteQueue>,
    pub verifier: IntegrityVerifier,
}

impl LedgerServices {
    /// Connect storage, load (or create) the signing key and build every
    /// component. Fails if signing material is unusable.
    pub async fn open(
        config: &LedgerConfig,
        elections: Arc<dyn ElectionDirectory>,
    ) -> Result<Self, LedgerError> {
        let keys = KeyManager::load_or_generate(
            &config.private_key_path,
            &config.public_key_path,
            config.key_bits,
        )?;
        let database = Database::connect(config).await?;
        database.run_migrations().await?;

        let services = Self::assemble(database, Arc::new(keys), elections, config.verify_batch_size);
        info!("Vote ledger services ready");
        Ok(services)
    }

    /// Build from already constructed storage and key material.
    pub fn assemble(
        database: Database,
        keys: Arc<KeyManager>,
        elections: Arc<dyn ElectionDirectory>,
        verify_batch_size: u32,
    ) -> Self {
        let ledger = Arc::new(
            ChainedLedger::new(database.clone(), keys.clone()).with_batch_size(verify_batch_size),
        );
        let recorder = AuditRecorder::new(ledger.clone());
        let credentials = CredentialStore::new(database.clone(), recorder.clone());
        let caster = Arc::new(AnonymousVoteCaster::new(
            database.clone(),
            recorder.clone(),
            elections,
        ));
        let offline_queue = Arc::new(OfflineVoteQueue::new(
            database.clone(),
            caster.clone(),
            recorder.clone(),
        ));
        let verifier = IntegrityVerifier::new(ledger.clone());

        Self {
            database,
            keys,
            ledger,
            recorder,
            credentials,
            caster,
            offline_queue,
            verifier,
        }
    }

    pub async fn shutdown(&self) {
        self.database.close().await;
    }
}

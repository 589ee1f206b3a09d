//! Checkpoint persistence service for discovery.
//!
//! `CheckpointService` saves the checkpoint of a discovery run and restores it on the next
//! start so an interrupted scan resumes where it stopped. Storage details live behind the
//! `CheckpointRepository` trait.

use crate::wallet::WalletError;
use crate::wallet::discovery::repositories::{CheckpointRepository, FileCheckpointRepository};
use crate::wallet::discovery::{DiscoveryCheckpoint, DiscoveryReport, DiscoveryScanner};

use std::path::PathBuf;
use tracing::{info, warn};

/// Service for managing checkpoint persistence.
pub struct CheckpointService {
    checkpoint_repo: Box<dyn CheckpointRepository + Send + Sync>,
}

impl CheckpointService {
    /// Create a service storing checkpoints as JSON files under `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        Self::with_repository(Box::new(FileCheckpointRepository::new(data_dir)))
    }

    pub fn with_repository(checkpoint_repo: Box<dyn CheckpointRepository + Send + Sync>) -> Self {
        Self { checkpoint_repo }
    }

    pub async fn save_checkpoint(&self, checkpoint: &DiscoveryCheckpoint) -> Result<(), WalletError> {
        self.checkpoint_repo.save(checkpoint).await
    }

    pub async fn load_checkpoint(
        &self,
        wallet_id: &str,
    ) -> Result<Option<DiscoveryCheckpoint>, WalletError> {
        self.checkpoint_repo.load(wallet_id).await
    }

    pub async fn clear_checkpoint(&self, wallet_id: &str) -> Result<(), WalletError> {
        self.checkpoint_repo.clear(wallet_id).await
    }

    /// Run discovery, resuming from the stored checkpoint of this wallet when it records an
    /// unfinished scan, and store the new checkpoint afterwards.
    ///
    /// A checkpoint of a finished scan is not resumed: the ledger may have seen new activity
    /// since, so the wallet is scanned again from account 0.
    pub async fn discover_resumable(
        &self,
        scanner: &mut DiscoveryScanner,
    ) -> Result<DiscoveryReport, WalletError> {
        let wallet_id = scanner.tree().wallet_id();

        let report = match self.load_checkpoint(&wallet_id).await? {
            Some(checkpoint) if !checkpoint.is_complete() => scanner.resume(&checkpoint).await?,
            Some(_) => {
                info!("Checkpoint for {} is complete, rescanning from account 0", wallet_id);
                scanner.discover().await
            }
            None => {
                info!("No checkpoint found for {}, starting from account 0", wallet_id);
                scanner.discover().await
            }
        };

        if report.accounts.is_empty() {
            warn!("No account scanned for {}, stored checkpoint left unchanged", wallet_id);
        } else {
            self.save_checkpoint(&scanner.checkpoint(&report)).await?;
        }
        Ok(report)
    }
}

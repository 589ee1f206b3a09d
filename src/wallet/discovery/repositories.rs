use crate::wallet::WalletError;
use crate::wallet::discovery::DiscoveryCheckpoint;

use std::path::PathBuf;
use tracing::{info, warn};

/// Repository for discovery checkpoint persistence
#[async_trait::async_trait]
pub trait CheckpointRepository {
	async fn save(&self, checkpoint: &DiscoveryCheckpoint) -> Result<(), WalletError>;
	async fn load(&self, wallet_id: &str) -> Result<Option<DiscoveryCheckpoint>, WalletError>;
	async fn clear(&self, wallet_id: &str) -> Result<(), WalletError>;
}

/// File-based implementation of CheckpointRepository
pub struct FileCheckpointRepository {
	data_dir: PathBuf,
}

impl FileCheckpointRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_checkpoint_filename(&self, wallet_id: &str) -> PathBuf {
		self.data_dir
			.join(format!("discovery_checkpoint_{}.json", wallet_id))
	}

	fn get_metadata_filename(&self, wallet_id: &str) -> PathBuf {
		self.data_dir
			.join(format!("discovery_checkpoint_{}.meta.json", wallet_id))
	}
}

#[async_trait::async_trait]
impl CheckpointRepository for FileCheckpointRepository {
	async fn save(&self, checkpoint: &DiscoveryCheckpoint) -> Result<(), WalletError> {
		tokio::fs::create_dir_all(&self.data_dir).await.map_err(|e| {
			WalletError::PersistenceError(format!("Failed to create data directory: {}", e))
		})?;

		// Create metadata
		let metadata = serde_json::json!({
			"timestamp": chrono::Utc::now().to_rfc3339(),
			"accounts": checkpoint.account_count(),
			"used_accounts": checkpoint.used_accounts(),
			"complete": checkpoint.is_complete(),
		});

		let metadata_filename = self.get_metadata_filename(&checkpoint.wallet_id);
		tokio::fs::write(&metadata_filename, serde_json::to_string_pretty(&metadata)?)
			.await
			.map_err(|e| {
				WalletError::PersistenceError(format!("Failed to write checkpoint metadata: {}", e))
			})?;

		let content = serde_json::to_string_pretty(checkpoint)?;
		let filename = self.get_checkpoint_filename(&checkpoint.wallet_id);
		tokio::fs::write(&filename, content).await.map_err(|e| {
			WalletError::PersistenceError(format!("Failed to write checkpoint file: {}", e))
		})?;

		info!(
			"Saved discovery checkpoint to {:?} ({} chains)",
			filename,
			checkpoint.states.len()
		);
		Ok(())
	}

	async fn load(&self, wallet_id: &str) -> Result<Option<DiscoveryCheckpoint>, WalletError> {
		let filename = self.get_checkpoint_filename(wallet_id);

		let content = match tokio::fs::read_to_string(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => {
				return Err(WalletError::PersistenceError(format!(
					"Failed to read checkpoint file: {}",
					e
				)));
			}
		};

		let checkpoint: DiscoveryCheckpoint = serde_json::from_str(&content).map_err(|e| {
			WalletError::CheckpointError(format!("Failed to parse checkpoint file: {}", e))
		})?;

		if checkpoint.wallet_id != wallet_id {
			return Err(WalletError::CheckpointError(format!(
				"Checkpoint file {:?} belongs to wallet {}",
				filename, checkpoint.wallet_id
			)));
		}

		info!(
			"Loaded discovery checkpoint from {:?} created at {}",
			filename, checkpoint.created_at
		);
		Ok(Some(checkpoint))
	}

	async fn clear(&self, wallet_id: &str) -> Result<(), WalletError> {
		for path in [
			self.get_checkpoint_filename(wallet_id),
			self.get_metadata_filename(wallet_id),
		] {
			match tokio::fs::remove_file(&path).await {
				Ok(()) => info!("Removed {:?}", path),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => warn!("Failed to remove {:?}: {}", path, e),
			}
		}
		Ok(())
	}
}

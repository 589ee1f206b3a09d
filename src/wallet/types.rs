use crate::config::ConfigError;
use crate::keys::{ChainId, DerivationError};
use crate::provider::ProviderError;
use crate::wallet::discovery::DiscoveryState;

/// Reason a chain scan stopped before exhausting its gap
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
	#[error(transparent)]
	Provider(#[from] ProviderError),

	#[error(transparent)]
	Derivation(#[from] DerivationError),

	#[error("Discovery cancelled")]
	Cancelled,
}

/// A failed chain scan together with the state it reached.
///
/// `state` covers every batch processed before the failure; its `next_probe_index` is the
/// start of the batch that failed, so a resumed scan repeats only that batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Discovery of account {} {} chain stopped at index {}: {source}", .state.account, .state.chain, .state.next_probe_index)]
pub struct DiscoveryError {
	pub state: DiscoveryState,
	pub source: ScanFailure,
}

impl DiscoveryError {
	pub fn account(&self) -> u32 {
		self.state.account
	}

	pub fn chain(&self) -> ChainId {
		self.state.chain
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self.source, ScanFailure::Cancelled)
	}
}

/// Error types for wallet discovery sessions
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
	#[error("Configuration error: {0}")]
	ConfigError(#[from] ConfigError),

	#[error("Derivation error: {0}")]
	DerivationError(#[from] DerivationError),

	#[error("Provider error: {0}")]
	ProviderError(#[from] ProviderError),

	#[error("Discovery error: {0}")]
	DiscoveryError(#[from] DiscoveryError),

	#[error("Checkpoint error: {0}")]
	CheckpointError(String),

	#[error("Persistence error: {0}")]
	PersistenceError(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
}

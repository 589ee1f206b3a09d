use crate::keys::{ChainKey, DerivationError, derive_addresses};
use crate::provider::{ProviderError, TransactionDataProvider};
use crate::wallet::discovery::events::chain_label;
use crate::wallet::discovery::DiscoveryState;
use crate::wallet::{DiscoveryError, ScanFailure};

use tokio::sync::watch;
use tracing::debug;

/// Batch parameters of a chain scan
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
	pub discovery_increment: u32,
	pub gap_limit: u32,
}

/// Scan one chain until its trailing unused run reaches the gap limit.
///
/// Batches are strictly sequential. Cancellation is honoured between batches only, so
/// the returned state always covers whole batches.
pub async fn scan_chain(
	provider: &dyn TransactionDataProvider,
	chain_key: &ChainKey,
	mut state: DiscoveryState,
	params: ScanParams,
	cancel: &watch::Receiver<bool>,
) -> Result<DiscoveryState, DiscoveryError> {
	let label = chain_label(state.account, state.chain);

	while !state.reaches_gap(params.gap_limit) {
		if *cancel.borrow() {
			debug!("Scan of {} cancelled at index {}", label, state.next_probe_index);
			return Err(DiscoveryError {
				state,
				source: ScanFailure::Cancelled,
			});
		}

		let start = state.next_probe_index;
		let highest = match probe_batch(provider, chain_key, start, params.discovery_increment).await {
			Ok(highest) => highest,
			Err(source) => return Err(DiscoveryError { state, source }),
		};

		let end = start + params.discovery_increment;
		state.record_batch(end, highest, params.gap_limit);
		debug!(
			"Scanned {} [{}, {}): highest used {:?}, unused run {}",
			label,
			start,
			end,
			state.highest_used_index,
			state.unused_run()
		);
	}

	state.exhausted = true;
	Ok(state)
}

/// Query one batch `[start, start + increment)` and return the highest used index in it.
async fn probe_batch(
	provider: &dyn TransactionDataProvider,
	chain_key: &ChainKey,
	start: u32,
	increment: u32,
) -> Result<Option<u32>, ScanFailure> {
	let end = start
		.checked_add(increment)
		.ok_or(DerivationError::IndexOutOfRange {
			level: "address",
			index: start,
		})?;
	let batch = derive_addresses(chain_key, start..end)?;
	let addresses: Vec<_> = batch.iter().map(|(_, address)| address.clone()).collect();

	let histories = provider.get_transactions(&addresses).await?;

	let mut highest = None;
	for (index, address) in &batch {
		let history = histories.get(address).ok_or_else(|| {
			ProviderError::Data(format!(
				"{} returned no entry for address {} (index {})",
				provider.name(),
				address,
				index
			))
		})?;
		if !history.is_empty() {
			highest = Some(*index);
		}
	}

	Ok(highest)
}

use hd_wallet_discovery::config::{DiscoveryConfig, ProviderConfig};
use hd_wallet_discovery::keys::MasterKey;
use hd_wallet_discovery::provider::{EsploraClient, RetryingProvider, TransactionDataProvider};
use hd_wallet_discovery::utils::{format_btc_amount, format_btc_unsigned};
use hd_wallet_discovery::wallet::discovery::events::LoggingEventHandler;
use hd_wallet_discovery::wallet::discovery::state_persistence::CheckpointService;
use hd_wallet_discovery::wallet::{BalanceAggregator, DiscoveryScanner, WalletError};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// RUST_LOG overrides the default info level
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Discovery failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), WalletError> {
	info!("Starting wallet discovery");

	let discovery_config = DiscoveryConfig::from_env()?;
	let provider_config = ProviderConfig::from_env()?;
	let network = discovery_config.account_type.network();

	let master = match std::env::var("WALLET_MNEMONIC") {
		Ok(words) => {
			let passphrase = std::env::var("WALLET_PASSPHRASE").unwrap_or_default();
			MasterKey::from_mnemonic(&words, &passphrase, network)?
		}
		Err(_) => {
			warn!("WALLET_MNEMONIC not set, discovering a freshly generated wallet");
			MasterKey::generate(network)?
		}
	};

	let client = EsploraClient::new(&provider_config.esplora_url, provider_config.timeout)?;
	let provider: Arc<dyn TransactionDataProvider> =
		Arc::new(RetryingProvider::new(client, provider_config.max_retry_elapsed));

	let mut scanner = DiscoveryScanner::new(master, provider.clone(), discovery_config.clone())?;
	scanner.register_handler(Box::new(LoggingEventHandler));
	info!("Discovering wallet {}", scanner.tree().wallet_id());

	let data_dir = std::env::var("DISCOVERY_DATA_DIR").unwrap_or_else(|_| ".".to_string());
	let persistence = CheckpointService::new(PathBuf::from(data_dir));
	let report = persistence.discover_resumable(&mut scanner).await?;

	for failure in &report.failures {
		warn!("{}; rerun to resume from the saved checkpoint", failure);
	}

	let aggregator = BalanceAggregator::new(provider, discovery_config.balance_query_mode);
	let balance = aggregator.aggregate(&report).await?;

	for account in &balance.accounts {
		info!(
			"Account {}: {} BTC confirmed, {} BTC unconfirmed over {} addresses",
			account.account,
			format_btc_unsigned(account.balance.confirmed),
			format_btc_amount(account.balance.unconfirmed),
			account.address_count
		);
	}
	info!("Total: {}", balance);

	Ok(())
}

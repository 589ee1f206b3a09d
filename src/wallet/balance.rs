//!
//! Balance aggregation over discovered addresses.
//!
//! Only the addresses a discovery run proved used are queried: indices
//! `0..=highest_used_index` of every chain with a used address. Funds sitting on an
//! address past that bound are not counted, even if the ledger reports them.

use crate::keys::{ChainId, DerivationError, derive_addresses};
use crate::provider::{
	Balance, HdAccountQuery, LedgerTransaction, MAX_IN_FLIGHT_REQUESTS, ProviderError,
	TransactionDataProvider, Utxo,
};
use crate::utils::{format_btc_amount, format_btc_unsigned};
use crate::wallet::discovery::DiscoveryReport;

use bitcoin::Address;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// How balances are fetched from the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceQueryMode {
	/// One `get_balance` call per address, issued concurrently
	PerAddress,
	/// A single `get_balance_hd` call covering every used account
	#[default]
	Hd,
}

impl FromStr for BalanceQueryMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"per_address" | "per-address" => Ok(BalanceQueryMode::PerAddress),
			"hd" => Ok(BalanceQueryMode::Hd),
			other => Err(format!("expected per_address or hd, got {}", other)),
		}
	}
}

/// Balance of one used address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBalance {
	pub account: u32,
	pub chain: ChainId,
	pub index: u32,
	pub address: Address,
	pub balance: Balance,
}

/// Totals of one used account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
	pub account: u32,
	pub balance: Balance,
	pub address_count: usize,
}

/// Aggregated balances of a wallet
#[derive(Debug, Clone, Default)]
pub struct WalletBalance {
	pub addresses: Vec<AddressBalance>,
	pub accounts: Vec<AccountBalance>,
	pub total: Balance,
	/// Whether some chains did not finish discovery, so their range may be short
	pub partial: bool,
	pub incomplete_chains: Vec<(u32, ChainId)>,
}

impl WalletBalance {
	pub fn account(&self, account: u32) -> Option<&AccountBalance> {
		self.accounts.iter().find(|a| a.account == account)
	}
}

impl fmt::Display for WalletBalance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} BTC confirmed, {} BTC unconfirmed across {} accounts",
			format_btc_unsigned(self.total.confirmed),
			format_btc_amount(self.total.unconfirmed),
			self.accounts.len()
		)?;
		if self.partial {
			write!(f, " (partial: {} chains incomplete)", self.incomplete_chains.len())?;
		}
		Ok(())
	}
}

/// Sums balances of discovered addresses
pub struct BalanceAggregator {
	provider: Arc<dyn TransactionDataProvider>,
	mode: BalanceQueryMode,
}

impl BalanceAggregator {
	pub fn new(provider: Arc<dyn TransactionDataProvider>, mode: BalanceQueryMode) -> Self {
		Self { provider, mode }
	}

	pub fn mode(&self) -> BalanceQueryMode {
		self.mode
	}

	/// Per-address, per-account and wallet totals of every used address in `report`.
	pub async fn aggregate(&self, report: &DiscoveryReport) -> Result<WalletBalance, ProviderError> {
		let slots = used_slots(report)?;
		info!(
			"Aggregating balances of {} addresses using {:?} queries",
			slots.len(),
			self.mode
		);

		let balances: Vec<Balance> = match self.mode {
			BalanceQueryMode::PerAddress => {
				stream::iter(slots.iter().map(|slot| self.provider.get_balance(&slot.3)))
					.buffered(MAX_IN_FLIGHT_REQUESTS)
					.try_collect()
					.await?
			}
			BalanceQueryMode::Hd => {
				let by_address = self.provider.get_balance_hd(&hd_queries(report)).await?;
				slots
					.iter()
					.map(|slot| {
						by_address.get(&slot.3).copied().unwrap_or_else(|| {
							warn!("{} reported no balance for {}", self.provider.name(), slot.3);
							Balance::default()
						})
					})
					.collect()
			}
		};

		let addresses: Vec<AddressBalance> = slots
			.into_iter()
			.zip(balances)
			.map(|((account, chain, index, address), balance)| AddressBalance {
				account,
				chain,
				index,
				address,
				balance,
			})
			.collect();

		let accounts = report
			.used_accounts()
			.map(|discovered| {
				let owned: Vec<&AddressBalance> = addresses
					.iter()
					.filter(|a| a.account == discovered.index())
					.collect();
				AccountBalance {
					account: discovered.index(),
					balance: owned.iter().map(|a| a.balance).sum(),
					address_count: owned.len(),
				}
			})
			.collect::<Vec<_>>();

		let total = accounts.iter().map(|a| a.balance).sum();
		let incomplete_chains: Vec<(u32, ChainId)> = report
			.failures
			.iter()
			.map(|f| (f.account(), f.chain()))
			.collect();

		let wallet = WalletBalance {
			addresses,
			accounts,
			total,
			partial: !incomplete_chains.is_empty(),
			incomplete_chains,
		};
		info!("Wallet balance: {}", wallet);
		Ok(wallet)
	}

	/// Unspent outputs of every used address, fetched in one HD call.
	pub async fn unspent_outputs(
		&self,
		report: &DiscoveryReport,
	) -> Result<HashMap<Address, Vec<Utxo>>, ProviderError> {
		self.provider.get_utxo_hd(&hd_queries(report)).await
	}

	/// Transaction histories of every used address, fetched in one HD call.
	pub async fn transaction_history(
		&self,
		report: &DiscoveryReport,
	) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
		self.provider.get_transactions_hd(&hd_queries(report)).await
	}
}

/// HD queries bounded by the highest used index of each chain of each used account.
pub fn hd_queries(report: &DiscoveryReport) -> Vec<HdAccountQuery> {
	report
		.used_accounts()
		.map(|discovered| HdAccountQuery {
			payout_key: discovered.keys.payout_key.clone(),
			change_key: discovered.keys.change_key.clone(),
			last_payout_index: discovered.payout.highest_used_index,
			last_change_index: discovered.change.highest_used_index,
		})
		.collect()
}

fn used_slots(report: &DiscoveryReport) -> Result<Vec<(u32, ChainId, u32, Address)>, DerivationError> {
	let mut slots = Vec::new();
	for discovered in report.used_accounts() {
		for chain in ChainId::ALL {
			let Some(range) = discovered.chain(chain).used_range() else {
				continue;
			};
			let key = discovered.keys.chain(chain);
			for (index, address) in derive_addresses(key, *range.start()..range.end() + 1)? {
				slots.push((discovered.index(), chain, index, address));
			}
		}
	}
	Ok(slots)
}

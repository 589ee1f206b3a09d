//!
//! Esplora REST client for live ledger queries.
//!
//! This module provides an async client for the Esplora HTTP API (as served by
//! blockstream.info, mempool.space or a local electrs). Address statistics, histories and
//! unspent outputs are fetched per address; batch requests fan out concurrently, with at most
//! `MAX_IN_FLIGHT_REQUESTS` of them in flight.

use super::types::*;
use super::{MAX_IN_FLIGHT_REQUESTS, TransactionDataProvider};

use bitcoin::Address;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Esplora address statistics for one side (chain or mempool)
#[derive(Debug, Deserialize)]
struct AddressStats {
	funded_txo_sum: u64,
	spent_txo_sum: u64,
	#[allow(dead_code)]
	tx_count: u64,
}

/// Response of `GET /address/{address}`
#[derive(Debug, Deserialize)]
struct AddressResponse {
	chain_stats: AddressStats,
	mempool_stats: AddressStats,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
	confirmed: bool,
	block_height: Option<u64>,
}

/// Entry of `GET /address/{address}/txs`
#[derive(Debug, Deserialize)]
struct TxResponse {
	txid: String,
	status: TxStatus,
	fee: Option<u64>,
}

/// Entry of `GET /address/{address}/utxo`
#[derive(Debug, Deserialize)]
struct UtxoResponse {
	txid: String,
	vout: u32,
	value: u64,
	status: TxStatus,
}

/// Statuses worth retrying: server errors, rate limiting and request timeouts.
fn is_transient(status: StatusCode) -> bool {
	status.is_server_error()
		|| status == StatusCode::TOO_MANY_REQUESTS
		|| status == StatusCode::REQUEST_TIMEOUT
}

/// Esplora HTTP client
#[derive(Clone)]
pub struct EsploraClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The API base URL, without trailing slash.
	base_url: String,
}

impl EsploraClient {
	/// Create a new Esplora client.
	///
	/// # Arguments
	/// * `base_url` - The API root, e.g. `https://blockstream.info/api`.
	/// * `timeout` - Per-request timeout; expiry surfaces as a connection error.
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
		let http_client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| ProviderError::Connection(format!("Failed to create HTTP client: {}", e)))?;

		let base_url = base_url.into().trim_end_matches('/').to_string();
		info!("Created Esplora client for {}", base_url);

		Ok(Self {
			http_client,
			base_url,
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
		let url = format!("{}{}", self.base_url, path);
		debug!("GET {}", url);

		let response = self.http_client.get(&url).send().await?;
		let status = response.status();
		if is_transient(status) {
			return Err(ProviderError::Connection(format!("HTTP {} from {}", status, url)));
		}
		if !status.is_success() {
			return Err(ProviderError::Data(format!("HTTP {} from {}", status, url)));
		}

		let body = response.text().await?;
		Ok(serde_json::from_str(&body)?)
	}

	async fn address_transactions(
		&self,
		address: &Address,
	) -> Result<(Address, Vec<LedgerTransaction>), ProviderError> {
		let txs: Vec<TxResponse> = self.get_json(&format!("/address/{}/txs", address)).await?;
		let txs = txs
			.into_iter()
			.map(|tx| LedgerTransaction {
				txid: tx.txid,
				confirmed: tx.status.confirmed,
				block_height: tx.status.block_height,
				fee: tx.fee,
			})
			.collect();
		Ok((address.clone(), txs))
	}
}

#[async_trait::async_trait]
impl TransactionDataProvider for EsploraClient {
	async fn get_balance(&self, address: &Address) -> Result<Balance, ProviderError> {
		let stats: AddressResponse = self.get_json(&format!("/address/{}", address)).await?;

		let confirmed = stats
			.chain_stats
			.funded_txo_sum
			.checked_sub(stats.chain_stats.spent_txo_sum)
			.ok_or_else(|| {
				ProviderError::Data(format!("Address {} spent more than it received", address))
			})?;
		let unconfirmed = i64::try_from(
			i128::from(stats.mempool_stats.funded_txo_sum) - i128::from(stats.mempool_stats.spent_txo_sum),
		)
		.map_err(|_| ProviderError::Data(format!("Mempool balance of {} out of range", address)))?;

		Ok(Balance::new(confirmed, unconfirmed))
	}

	async fn get_transactions(
		&self,
		addresses: &[Address],
	) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
		stream::iter(addresses.iter().map(|address| self.address_transactions(address)).collect::<Vec<_>>())
			.buffered(MAX_IN_FLIGHT_REQUESTS)
			.try_collect()
			.await
	}

	async fn get_utxo(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
		let utxos: Vec<UtxoResponse> = self.get_json(&format!("/address/{}/utxo", address)).await?;
		Ok(utxos
			.into_iter()
			.map(|u| Utxo {
				txid: u.txid,
				vout: u.vout,
				value: u.value,
				confirmed: u.status.confirmed,
				block_height: u.status.block_height,
			})
			.collect())
	}

	async fn send_transaction(&self, raw: &[u8]) -> Result<String, ProviderError> {
		let url = format!("{}/tx", self.base_url);
		let response = self
			.http_client
			.post(&url)
			.header("Content-Type", "text/plain")
			.body(hex::encode(raw))
			.send()
			.await?;

		let status = response.status();
		let body = response.text().await?;
		if is_transient(status) {
			return Err(ProviderError::Connection(format!("HTTP {}: {}", status, body)));
		}
		if !status.is_success() {
			return Err(ProviderError::Rejected(body));
		}

		let txid = body.trim().to_string();
		info!("Broadcast transaction {}", txid);
		Ok(txid)
	}

	fn name(&self) -> &'static str {
		"EsploraClient"
	}
}

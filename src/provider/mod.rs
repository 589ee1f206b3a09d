//! Transaction data providers
//!
//! This module defines the capability interface the discovery engine uses to ask a ledger
//! about addresses, together with its implementations:
//!
//! - `client`: Esplora REST client talking to a live ledger backend.
//! - `retry`: caller-side backoff policy wrapping any provider.
//! - `scripted`: deterministic fake replaying pre-recorded responses in call order.

/// Esplora REST client
mod client;
/// Exponential backoff decorator
mod retry;
/// Scripted fake provider
pub mod scripted;
/// Type definitions for provider data
mod types;

pub use client::EsploraClient;
pub use retry::RetryingProvider;
pub use scripted::ScriptedProvider;
pub use types::*;

use bitcoin::Address;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;

/// Upper bound on per-address requests a provider keeps in flight at once
pub const MAX_IN_FLIGHT_REQUESTS: usize = 8;

/// Query capability over an external ledger.
///
/// All methods are read-only except `send_transaction`. `get_transactions` must return an
/// entry, possibly empty, for every requested address: an empty sequence is the only
/// evidence that an address is unused, so a missing entry is a data error.
///
/// The HD variants default to fanning out over the per-address methods; backends with
/// native batch endpoints override them.
#[async_trait::async_trait]
pub trait TransactionDataProvider: Send + Sync {
    /// Confirmed and unconfirmed balance of one address
    async fn get_balance(&self, address: &Address) -> Result<Balance, ProviderError>;

    /// Transaction history of each requested address
    async fn get_transactions(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError>;

    /// Unspent outputs of one address
    async fn get_utxo(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError>;

    /// Broadcast a serialized transaction, returning its id
    async fn send_transaction(&self, raw: &[u8]) -> Result<String, ProviderError>;

    /// Balances of the known-used addresses of each queried account
    async fn get_balance_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Balance>, ProviderError> {
        let addresses = hd_addresses(accounts)?;
        let balances: Vec<Balance> = stream::iter(addresses.iter().map(|address| self.get_balance(address)).collect::<Vec<_>>())
            .buffered(MAX_IN_FLIGHT_REQUESTS)
            .try_collect()
            .await?;
        Ok(addresses.into_iter().zip(balances).collect())
    }

    /// Transaction histories of the known-used addresses, one request per chain
    async fn get_transactions_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        let mut result = HashMap::new();
        for query in accounts {
            for (_, addresses) in query.chain_addresses()? {
                if addresses.is_empty() {
                    continue;
                }
                result.extend(self.get_transactions(&addresses).await?);
            }
        }
        Ok(result)
    }

    /// Unspent outputs of the known-used addresses of each queried account
    async fn get_utxo_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Vec<Utxo>>, ProviderError> {
        let addresses = hd_addresses(accounts)?;
        let utxos: Vec<Vec<Utxo>> = stream::iter(addresses.iter().map(|address| self.get_utxo(address)).collect::<Vec<_>>())
            .buffered(MAX_IN_FLIGHT_REQUESTS)
            .try_collect()
            .await?;
        Ok(addresses.into_iter().zip(utxos).collect())
    }

    /// Whether calls for different (account, chain) pairs may be in flight at once.
    /// Providers returning `false` have all their calls serialized by the scanner.
    fn supports_concurrent_calls(&self) -> bool {
        true
    }

    /// Get the name of this provider for logging
    fn name(&self) -> &'static str;
}

fn hd_addresses(accounts: &[HdAccountQuery]) -> Result<Vec<Address>, ProviderError> {
    let mut addresses = Vec::new();
    for query in accounts {
        for (_, chain) in query.chain_addresses()? {
            addresses.extend(chain);
        }
    }
    Ok(addresses)
}

//! Types exchanged with transaction data providers

use crate::keys::{ChainId, ChainKey, DerivationError, derive_addresses};

use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Confirmed and unconfirmed amounts held by an address, in satoshis.
///
/// The unconfirmed part is signed: a mempool spend of confirmed coins makes it negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: i64,
}

impl Balance {
    pub fn new(confirmed: u64, unconfirmed: i64) -> Self {
        Self {
            confirmed,
            unconfirmed,
        }
    }

    /// Confirmed plus unconfirmed amount.
    pub fn total(&self) -> i128 {
        i128::from(self.confirmed) + i128::from(self.unconfirmed)
    }

    pub fn is_zero(&self) -> bool {
        self.confirmed == 0 && self.unconfirmed == 0
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.confirmed += rhs.confirmed;
        self.unconfirmed += rhs.unconfirmed;
    }
}

impl std::iter::Sum for Balance {
    fn sum<I: Iterator<Item = Balance>>(iter: I) -> Self {
        iter.fold(Balance::default(), |mut acc, b| {
            acc += b;
            acc
        })
    }
}

/// A transaction touching an address, as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// The transaction id, hex encoded.
    pub txid: String,
    /// Whether the transaction is included in a block.
    pub confirmed: bool,
    /// Height of the including block, if confirmed.
    pub block_height: Option<u64>,
    /// Fee paid, when the backend reports it.
    pub fee: Option<u64>,
}

/// An unspent output owned by an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    /// Output value in satoshis.
    pub value: u64,
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

/// Per-HD-account query for the batched provider methods.
///
/// Only addresses up to `last_payout_index` / `last_change_index` (inclusive) are part of
/// the query; a `None` bound means the chain has no known used address.
#[derive(Debug, Clone)]
pub struct HdAccountQuery {
    pub payout_key: ChainKey,
    pub change_key: ChainKey,
    pub last_payout_index: Option<u32>,
    pub last_change_index: Option<u32>,
}

impl HdAccountQuery {
    pub fn account(&self) -> u32 {
        self.payout_key.account
    }

    /// Addresses covered by this query, grouped per chain.
    pub fn chain_addresses(&self) -> Result<Vec<(ChainId, Vec<Address>)>, DerivationError> {
        let mut chains = Vec::with_capacity(2);
        for (key, last) in [
            (&self.payout_key, self.last_payout_index),
            (&self.change_key, self.last_change_index),
        ] {
            let addresses = match last {
                Some(last) => derive_addresses(key, 0..last.saturating_add(1))?
                    .into_iter()
                    .map(|(_, address)| address)
                    .collect(),
                None => Vec::new(),
            };
            chains.push((key.chain, addresses));
        }
        Ok(chains)
    }
}

/// Error types for provider operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider connection error: {0}")]
    Connection(String),

    #[error("Provider data error: {0}")]
    Data(String),

    #[error("Scripted provider exhausted: call {calls} to {method} has no scripted response")]
    ScriptExhausted { method: &'static str, calls: usize },

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProviderError::Connection(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ProviderError::Data(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_client_error() => ProviderError::Data(e.to_string()),
            _ => ProviderError::Connection(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Data(e.to_string())
    }
}

impl From<DerivationError> for ProviderError {
    fn from(e: DerivationError) -> Self {
        ProviderError::Data(format!("Cannot derive queried addresses: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{AccountType, MasterKey, derive_account};
    use bitcoin::Network;

    #[test]
    fn test_balance_sum() {
        let total: Balance = [Balance::new(100_000, 0), Balance::new(0, 10_000), Balance::new(5, -5)]
            .into_iter()
            .sum();
        assert_eq!(total, Balance::new(100_005, 9_995));
        assert_eq!(total.total(), 110_000);
        assert!(Balance::default().is_zero());
    }

    #[test]
    fn test_hd_query_bounds() {
        let master = MasterKey::from_seed(Network::Bitcoin, &[1u8; 32]).unwrap();
        let keys = derive_account(&master, &AccountType::bip44_mainnet(), 0).unwrap();
        let query = HdAccountQuery {
            payout_key: keys.payout_key.clone(),
            change_key: keys.change_key.clone(),
            last_payout_index: Some(2),
            last_change_index: None,
        };

        let chains = query.chain_addresses().unwrap();
        assert_eq!(chains[0].0, ChainId::Payout);
        assert_eq!(chains[0].1.len(), 3);
        assert_eq!(chains[1].0, ChainId::Change);
        assert!(chains[1].1.is_empty());
    }

    #[test]
    fn test_only_connection_errors_retry() {
        assert!(ProviderError::Connection("timeout".into()).is_retriable());
        assert!(!ProviderError::Data("bad json".into()).is_retriable());
        assert!(
            !ProviderError::ScriptExhausted {
                method: "get_transactions",
                calls: 3
            }
            .is_retriable()
        );
    }
}

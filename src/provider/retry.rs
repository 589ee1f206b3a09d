//!
//! Caller-side retry policy for transaction data providers.
//!
//! The discovery engine itself never retries: a failed batch is reported with resumable
//! state. Applications that want transparent retries wrap their provider in
//! `RetryingProvider`, which retries connection errors with exponential backoff and passes
//! every other error through untouched.

use super::types::*;
use super::TransactionDataProvider;

use backoff::{ExponentialBackoff, future::retry};
use bitcoin::Address;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Provider decorator retrying transient failures
pub struct RetryingProvider<P> {
    inner: P,
    max_elapsed: Duration,
    initial_interval: Duration,
}

impl<P: TransactionDataProvider> RetryingProvider<P> {
    /// Wrap `inner`, giving up on a call once `max_elapsed` has passed.
    pub fn new(inner: P, max_elapsed: Duration) -> Self {
        Self {
            inner,
            max_elapsed,
            initial_interval: Duration::from_millis(500),
        }
    }

    pub fn with_initial_interval(mut self, initial_interval: Duration) -> Self {
        self.initial_interval = initial_interval;
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, call: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        retry(self.policy(), || {
            let attempt = call();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_retriable() {
                        warn!("{} on {} failed, retrying: {}", method, self.inner.name(), e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl<P: TransactionDataProvider> TransactionDataProvider for RetryingProvider<P> {
    async fn get_balance(&self, address: &Address) -> Result<Balance, ProviderError> {
        self.with_retry("get_balance", || self.inner.get_balance(address))
            .await
    }

    async fn get_transactions(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        self.with_retry("get_transactions", || self.inner.get_transactions(addresses))
            .await
    }

    async fn get_utxo(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
        self.with_retry("get_utxo", || self.inner.get_utxo(address))
            .await
    }

    // Broadcasting is not idempotent from the caller's point of view, so it is never retried.
    async fn send_transaction(&self, raw: &[u8]) -> Result<String, ProviderError> {
        self.inner.send_transaction(raw).await
    }

    async fn get_balance_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Balance>, ProviderError> {
        self.with_retry("get_balance_hd", || self.inner.get_balance_hd(accounts))
            .await
    }

    async fn get_transactions_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        self.with_retry("get_transactions_hd", || {
            self.inner.get_transactions_hd(accounts)
        })
        .await
    }

    async fn get_utxo_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Vec<Utxo>>, ProviderError> {
        self.with_retry("get_utxo_hd", || self.inner.get_utxo_hd(accounts))
            .await
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.inner.supports_concurrent_calls()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{AccountType, MasterKey};
    use crate::provider::scripted::ScriptedResponse;
    use crate::provider::ScriptedProvider;
    use bitcoin::Network;

    fn scripted() -> ScriptedProvider {
        let master = MasterKey::from_seed(Network::Bitcoin, &[5u8; 32]).unwrap();
        ScriptedProvider::new(AccountType::bip44_mainnet(), master).unwrap()
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let provider = scripted();
        provider.push_response(ScriptedResponse::Error(ProviderError::Connection(
            "reset by peer".into(),
        )));
        provider.push_response(ScriptedResponse::Unused);

        let retrying = RetryingProvider::new(provider, Duration::from_secs(5))
            .with_initial_interval(Duration::from_millis(1));
        let address = retrying.inner().address(0, crate::keys::ChainId::Payout, 0).unwrap();
        let result = retrying.get_transactions(&[address.clone()]).await.unwrap();

        assert_eq!(result.get(&address), Some(&Vec::new()));
        assert_eq!(retrying.inner().call_count("get_transactions"), 2);
    }

    #[tokio::test]
    async fn test_data_errors_are_not_retried() {
        let provider = scripted();
        provider.push_response(ScriptedResponse::Error(ProviderError::Data("garbage".into())));
        provider.push_response(ScriptedResponse::Unused);

        let retrying = RetryingProvider::new(provider, Duration::from_secs(5))
            .with_initial_interval(Duration::from_millis(1));
        let address = retrying.inner().address(0, crate::keys::ChainId::Payout, 0).unwrap();
        let err = retrying.get_transactions(&[address]).await.unwrap_err();

        assert_eq!(err, ProviderError::Data("garbage".into()));
        assert_eq!(retrying.inner().call_count("get_transactions"), 1);
    }
}

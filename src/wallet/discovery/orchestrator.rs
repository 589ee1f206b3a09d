//! Discovery orchestrator: walks accounts and chains of an HD wallet.
//!
//! This module defines the `DiscoveryScanner`, which coordinates the components involved in
//! finding the used part of a wallet: it derives account keys, runs the gap-limit scan over
//! each chain, applies the account continuation policy, dispatches events to registered
//! handlers and tracks progress.
//!
//! Account policy:
//! - accounts `0..min_accounts` are always scanned (account 0 at least)
//! - account `k + 1` is scanned only if account `k` was found used
//! - scanning never goes past `max_accounts`
//!
//! The two chains of an account are scanned concurrently when the provider allows it,
//! otherwise payout before change. Accounts are always sequential.

use crate::config::DiscoveryConfig;
use crate::keys::{AccountKeys, ChainId, KeyDerivationTree, MasterKey};
use crate::provider::TransactionDataProvider;
use crate::wallet::WalletError;
use crate::wallet::discovery::{
    DiscoveryCheckpoint, DiscoveryState,
    events::{DiscoveryEvent, DiscoveryEventHandler, EventDispatcher},
    progress_tracker::{DiscoveryProgressTracker, DiscoveryStats},
    scanner::{ScanParams, scan_chain},
};
use crate::wallet::{DiscoveryError, ScanFailure};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why a discovery run stopped walking accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An account past the bootstrap range had no used address
    UnusedAccount,
    /// The configured account cap was reached
    MaxAccounts,
    /// The run was cancelled
    Cancelled,
    /// Account keys could not be derived
    DerivationFailed,
}

/// Discovery result of one account
#[derive(Debug, Clone)]
pub struct AccountDiscovery {
    pub keys: AccountKeys,
    pub payout: DiscoveryState,
    pub change: DiscoveryState,
}

impl AccountDiscovery {
    pub fn index(&self) -> u32 {
        self.keys.index
    }

    /// An account is used iff either of its chains has a used address.
    pub fn is_used(&self) -> bool {
        self.payout.is_used() || self.change.is_used()
    }

    pub fn chain(&self, chain: ChainId) -> &DiscoveryState {
        match chain {
            ChainId::Payout => &self.payout,
            ChainId::Change => &self.change,
        }
    }
}

/// Outcome of a discovery run.
///
/// Failures do not abort the run: each failed chain keeps its partial state in `accounts`
/// and is listed in `failures`.
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub accounts: Vec<AccountDiscovery>,
    pub failures: Vec<DiscoveryError>,
    pub stop_reason: StopReason,
    pub stats: DiscoveryStats,
}

impl DiscoveryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn used_accounts(&self) -> impl Iterator<Item = &AccountDiscovery> {
        self.accounts.iter().filter(|a| a.is_used())
    }

    pub fn highest_used_account(&self) -> Option<u32> {
        self.used_accounts().map(|a| a.index()).max()
    }

    pub fn account(&self, index: u32) -> Option<&AccountDiscovery> {
        self.accounts.iter().find(|a| a.index() == index)
    }

    pub fn states(&self) -> impl Iterator<Item = &DiscoveryState> {
        self.accounts.iter().flat_map(|a| [&a.payout, &a.change])
    }
}

/// Handle cancelling the discovery runs of a scanner from another task.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Stop the current run at the next batch boundary. Has no effect while no run is
    /// in progress.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Address and account discovery engine.
pub struct DiscoveryScanner {
    tree: KeyDerivationTree,
    provider: Arc<dyn TransactionDataProvider>,
    config: DiscoveryConfig,
    event_dispatcher: EventDispatcher,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    last_checkpoint: Option<DiscoveryCheckpoint>,
}

impl DiscoveryScanner {
    pub fn new(
        master: MasterKey,
        provider: Arc<dyn TransactionDataProvider>,
        config: DiscoveryConfig,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        info!(
            "Created discovery scanner for {} using {}",
            config.account_type,
            provider.name()
        );

        Ok(Self {
            tree: KeyDerivationTree::new(master, config.account_type.clone()),
            provider,
            config,
            event_dispatcher: EventDispatcher::new(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            last_checkpoint: None,
        })
    }

    pub fn tree(&self) -> &KeyDerivationTree {
        &self.tree
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn TransactionDataProvider> {
        self.provider.clone()
    }

    pub fn register_handler(&mut self, handler: Box<dyn DiscoveryEventHandler>) {
        self.event_dispatcher.register_handler(handler);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Checkpoint of the most recent run, if any.
    pub fn last_checkpoint(&self) -> Option<&DiscoveryCheckpoint> {
        self.last_checkpoint.as_ref()
    }

    /// Swap the master key. Derived keys and the held checkpoint belong to the old key and
    /// are dropped.
    pub fn replace_master_key(&mut self, master: MasterKey) {
        self.tree = KeyDerivationTree::new(master, self.config.account_type.clone());
        self.last_checkpoint = None;
        info!("Master key replaced, discovery state reset");
    }

    /// Discover used accounts and addresses from scratch.
    pub async fn discover(&mut self) -> DiscoveryReport {
        self.run(HashMap::new()).await
    }

    /// Continue a previous run. Chains that finished in the checkpoint are not queried
    /// again; unfinished chains restart at their `next_probe_index`.
    pub async fn resume(
        &mut self,
        checkpoint: &DiscoveryCheckpoint,
    ) -> Result<DiscoveryReport, WalletError> {
        let wallet_id = self.tree.wallet_id();
        if checkpoint.wallet_id != wallet_id {
            return Err(WalletError::CheckpointError(format!(
                "Checkpoint belongs to wallet {}, not {}",
                checkpoint.wallet_id, wallet_id
            )));
        }

        info!(
            "Resuming discovery from checkpoint of {} ({} accounts recorded)",
            checkpoint.created_at,
            checkpoint.account_count()
        );
        let prior = checkpoint
            .states
            .iter()
            .map(|s| ((s.account, s.chain), s.clone()))
            .collect();
        Ok(self.run(prior).await)
    }

    /// Snapshot a report into a checkpoint for this scanner's wallet.
    pub fn checkpoint(&self, report: &DiscoveryReport) -> DiscoveryCheckpoint {
        DiscoveryCheckpoint {
            wallet_id: self.tree.wallet_id(),
            profile: self.config.account_type.name().to_string(),
            gap_limit: self.config.gap_limit,
            discovery_increment: self.config.discovery_increment,
            states: report.states().cloned().collect(),
            created_at: Utc::now(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn run(&mut self, mut prior: HashMap<(u32, ChainId), DiscoveryState>) -> DiscoveryReport {
        let params = ScanParams {
            discovery_increment: self.config.discovery_increment,
            gap_limit: self.config.gap_limit,
        };
        let min_accounts = self.config.min_accounts.max(1);
        // A cancellation only applies to the run it interrupts.
        self.cancel_tx.send_replace(false);
        let mut tracker = DiscoveryProgressTracker::new();
        let mut accounts = Vec::new();
        let mut failures = Vec::new();

        info!(
            "Starting discovery: increment {}, gap limit {}, accounts {}..{}",
            params.discovery_increment, params.gap_limit, min_accounts, self.config.max_accounts
        );

        let mut account = 0u32;
        let stop_reason = loop {
            if account >= self.config.max_accounts {
                break StopReason::MaxAccounts;
            }
            if self.is_cancelled() {
                break StopReason::Cancelled;
            }

            self.event_dispatcher
                .dispatch(&DiscoveryEvent::AccountStarted { account })
                .await;

            let keys = match self.tree.derive_account(account) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Cannot derive account {}: {}", account, e);
                    for chain in ChainId::ALL {
                        failures.push(DiscoveryError {
                            state: DiscoveryState::new(account, chain),
                            source: ScanFailure::Derivation(e.clone()),
                        });
                    }
                    break StopReason::DerivationFailed;
                }
            };

            let payout_before = prior
                .remove(&(account, ChainId::Payout))
                .unwrap_or_else(|| DiscoveryState::new(account, ChainId::Payout));
            let change_before = prior
                .remove(&(account, ChainId::Change))
                .unwrap_or_else(|| DiscoveryState::new(account, ChainId::Change));

            let (payout, change) = self
                .scan_account(&keys, payout_before.clone(), change_before.clone(), params)
                .await;

            let mut cancelled = false;
            let mut finished = Vec::with_capacity(2);
            for (before, result) in [(payout_before, payout), (change_before, change)] {
                let (after, event) = match result {
                    Ok(state) => {
                        tracker.record_chain(&before, &state, false);
                        let event = DiscoveryEvent::ChainCompleted {
                            state: state.clone(),
                        };
                        (state, event)
                    }
                    Err(e) => {
                        tracker.record_chain(&before, &e.state, true);
                        cancelled |= e.is_cancelled();
                        let event = DiscoveryEvent::ChainFailed {
                            state: e.state.clone(),
                            error: e.source.to_string(),
                        };
                        let state = e.state.clone();
                        failures.push(e);
                        (state, event)
                    }
                };
                self.event_dispatcher.dispatch(&event).await;
                finished.push(after);
            }

            let change = finished.pop().unwrap_or_else(|| DiscoveryState::new(account, ChainId::Change));
            let payout = finished.pop().unwrap_or_else(|| DiscoveryState::new(account, ChainId::Payout));
            let discovered = AccountDiscovery {
                keys,
                payout,
                change,
            };
            let used = discovered.is_used();
            tracker.record_account(used);
            tracker.log_progress(false);
            accounts.push(discovered);

            self.event_dispatcher
                .dispatch(&DiscoveryEvent::AccountFinished { account, used })
                .await;

            if cancelled {
                break StopReason::Cancelled;
            }

            account += 1;
            if !used && account >= min_accounts {
                break StopReason::UnusedAccount;
            }
        };

        self.cancel_tx.send_replace(false);

        tracker.log_progress(true);
        if let Err(e) = tracker.validate_completion() {
            warn!("Discovery incomplete: {}", e);
        }

        let stats = tracker.get_stats();
        self.event_dispatcher
            .dispatch(&DiscoveryEvent::DiscoveryCompleted {
                accounts_scanned: stats.accounts_scanned,
                stop_reason,
            })
            .await;
        info!("{}", stats.summary());

        let report = DiscoveryReport {
            accounts,
            failures,
            stop_reason,
            stats,
        };
        if report.accounts.is_empty() {
            warn!("Discovery stopped before scanning any account, keeping previous checkpoint");
        } else {
            self.last_checkpoint = Some(self.checkpoint(&report));
        }
        report
    }

    async fn scan_account(
        &self,
        keys: &AccountKeys,
        payout: DiscoveryState,
        change: DiscoveryState,
        params: ScanParams,
    ) -> (
        Result<DiscoveryState, DiscoveryError>,
        Result<DiscoveryState, DiscoveryError>,
    ) {
        let provider = self.provider.as_ref();
        let payout_scan = scan_chain(provider, &keys.payout_key, payout, params, &self.cancel_rx);
        let change_scan = scan_chain(provider, &keys.change_key, change, params, &self.cancel_rx);

        if provider.supports_concurrent_calls() {
            futures::future::join(payout_scan, change_scan).await
        } else {
            let payout = payout_scan.await;
            let change = change_scan.await;
            (payout, change)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::AccountType;
    use crate::provider::scripted::{ChainUsage, ScriptedResponse};
    use crate::provider::{
        Balance, LedgerTransaction, ProviderError, ScriptedProvider, Utxo,
    };
    use bitcoin::{Address, Network};
    use std::sync::Mutex;

    fn master() -> MasterKey {
        MasterKey::from_seed(Network::Bitcoin, &[42u8; 32]).unwrap()
    }

    fn config(discovery_increment: u32, gap_limit: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            discovery_increment,
            gap_limit,
            ..DiscoveryConfig::default()
        }
    }

    fn scripted() -> ScriptedProvider {
        ScriptedProvider::new(AccountType::bip44_mainnet(), master()).unwrap()
    }

    fn scanner(provider: Arc<ScriptedProvider>, config: DiscoveryConfig) -> DiscoveryScanner {
        DiscoveryScanner::new(master(), provider, config).unwrap()
    }

    #[tokio::test]
    async fn test_single_account_light_usage() {
        let mut provider = scripted();
        provider.set_num_used_accounts(1);
        provider.set_num_used_addresses(0, 3, ChainId::Payout);
        provider.set_num_used_addresses(0, 1, ChainId::Change);
        let scripted_calls = provider.script_hd_discovery(20, 20);
        let provider = Arc::new(provider);

        let report = scanner(provider.clone(), config(20, 20)).discover().await;

        assert!(report.is_complete());
        assert_eq!(report.stop_reason, StopReason::UnusedAccount);
        assert_eq!(report.accounts.len(), 2);
        let first = &report.accounts[0];
        assert_eq!(first.payout.highest_used_index, Some(2));
        assert_eq!(first.change.highest_used_index, Some(0));
        // unused run after the first batch is 17 (payout) and 19 (change), so each chain
        // needs a second batch to reach the gap limit
        assert_eq!(first.payout.batches_scanned, 2);
        assert_eq!(first.change.batches_scanned, 2);
        assert!(!report.accounts[1].is_used());
        assert_eq!(report.accounts[1].payout.batches_scanned, 1);

        assert_eq!(provider.call_count("get_transactions"), scripted_calls);
        assert_eq!(provider.remaining_responses(), 0);
    }

    #[tokio::test]
    async fn test_single_batch_when_increment_covers_gap() {
        let mut provider = scripted();
        provider.set_num_used_accounts(1);
        provider.set_num_used_addresses(0, 3, ChainId::Payout);
        provider.set_num_used_addresses(0, 1, ChainId::Change);
        provider.script_hd_discovery(40, 20);
        let provider = Arc::new(provider);

        let report = scanner(provider.clone(), config(40, 20)).discover().await;

        assert_eq!(report.accounts[0].payout.batches_scanned, 1);
        assert_eq!(report.accounts[0].change.batches_scanned, 1);
        assert_eq!(report.accounts[0].payout.highest_used_index, Some(2));
        // one batch per chain for account 0 and for unused account 1
        assert_eq!(provider.call_count("get_transactions"), 4);
    }

    #[tokio::test]
    async fn test_heavy_usage_across_accounts() {
        let mut provider = scripted();
        provider.set_num_used_accounts(3);
        for account in 0..3 {
            provider.set_num_used_addresses(account, 45, ChainId::Payout);
            provider.set_num_used_addresses(account, 22, ChainId::Change);
        }
        let scripted_calls = provider.script_hd_discovery(20, 20);
        let provider = Arc::new(provider);

        let report = scanner(provider.clone(), config(20, 20)).discover().await;

        assert!(report.is_complete());
        assert_eq!(report.highest_used_account(), Some(2));
        for account in 0..3 {
            let discovered = report.account(account).unwrap();
            assert_eq!(discovered.payout.highest_used_index, Some(44));
            assert_eq!(discovered.change.highest_used_index, Some(21));
            // ceil((45 + 20) / 20) and ceil((22 + 20) / 20)
            assert_eq!(discovered.payout.batches_scanned, 4);
            assert_eq!(discovered.change.batches_scanned, 3);
        }
        assert!(!report.account(3).unwrap().is_used());
        assert_eq!(provider.call_count("get_transactions"), scripted_calls);
    }

    #[tokio::test]
    async fn test_provider_failure_mid_scan() {
        let provider = scripted();
        provider.push_response(ScriptedResponse::Usage(ChainUsage {
            account: 0,
            chain: ChainId::Payout,
            num_used: 30,
            window: 0..20,
        }));
        provider.push_response(ScriptedResponse::Error(ProviderError::Connection("reset".into())));
        // change chain of account 0 is empty
        provider.push_response(ScriptedResponse::Unused);
        // account 1 is scanned because the partial payout scan proved account 0 used
        provider.push_response(ScriptedResponse::Unused);
        provider.push_response(ScriptedResponse::Unused);
        let provider = Arc::new(provider);

        let report = scanner(provider.clone(), config(20, 20)).discover().await;

        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.account(), 0);
        assert_eq!(failure.chain(), ChainId::Payout);
        assert_eq!(failure.state.highest_used_index, Some(19));
        assert_eq!(failure.state.next_probe_index, 20);
        assert_eq!(report.accounts[0].payout, failure.state);
        assert!(report.accounts[0].change.exhausted);
        assert_eq!(report.stop_reason, StopReason::UnusedAccount);
        assert_eq!(report.stats.chains_failed, 1);
        assert_eq!(provider.remaining_responses(), 0);
    }

    #[tokio::test]
    async fn test_empty_wallet_termination_bound() {
        for (increment, gap_limit, expected) in [(20, 20, 1), (5, 20, 4), (7, 20, 3), (50, 1, 1)] {
            let provider = scripted();
            provider.script_hd_discovery(increment, gap_limit);
            let provider = Arc::new(provider);

            let report = scanner(provider.clone(), config(increment, gap_limit)).discover().await;

            assert_eq!(report.accounts.len(), 1);
            assert!(!report.accounts[0].is_used());
            assert_eq!(report.accounts[0].payout.batches_scanned, expected);
            assert_eq!(report.accounts[0].change.batches_scanned, expected);
            assert_eq!(provider.call_count("get_transactions") as u32, 2 * expected);
        }
    }

    #[tokio::test]
    async fn test_results_independent_of_increment() {
        let mut highest = Vec::new();
        for increment in [1, 3, 20, 64] {
            let mut provider = scripted();
            provider.set_num_used_accounts(2);
            provider.set_num_used_addresses(0, 17, ChainId::Payout);
            provider.set_num_used_addresses(0, 4, ChainId::Change);
            provider.set_num_used_addresses(1, 2, ChainId::Payout);
            provider.script_hd_discovery(increment, 10);
            let provider = Arc::new(provider);

            let report = scanner(provider, config(increment, 10)).discover().await;
            assert!(report.is_complete());
            highest.push(
                report
                    .states()
                    .map(|s| (s.account, s.chain, s.highest_used_index))
                    .collect::<Vec<_>>(),
            );
        }
        assert!(highest.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(highest[0].len(), 6);
    }

    #[tokio::test]
    async fn test_bootstrap_and_account_cap() {
        let provider = scripted();
        provider.script_hd_discovery(20, 20);
        for _ in 0..4 {
            provider.push_response(ScriptedResponse::Unused);
        }
        let provider = Arc::new(provider);

        let report = scanner(
            provider.clone(),
            DiscoveryConfig {
                min_accounts: 3,
                ..config(20, 20)
            },
        )
        .discover()
        .await;
        assert_eq!(report.accounts.len(), 3);
        assert_eq!(report.stop_reason, StopReason::UnusedAccount);

        let mut capped = scripted();
        capped.set_num_used_accounts(10);
        for account in 0..10 {
            capped.set_num_used_addresses(account, 1, ChainId::Payout);
        }
        capped.script_hd_discovery(20, 20);
        let capped = Arc::new(capped);
        let report = scanner(
            capped.clone(),
            DiscoveryConfig {
                max_accounts: 4,
                ..config(20, 20)
            },
        )
        .discover()
        .await;
        assert_eq!(report.accounts.len(), 4);
        assert_eq!(report.stop_reason, StopReason::MaxAccounts);
        assert!(report.used_accounts().count() == 4);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_batches() {
        let mut provider = scripted();
        provider.set_num_used_accounts(1);
        provider.set_num_used_addresses(0, 30, ChainId::Payout);
        provider.set_num_used_addresses(0, 2, ChainId::Change);
        let provider = Arc::new(provider);

        // first run: payout fails on its second batch
        provider.push_response(ScriptedResponse::Usage(ChainUsage {
            account: 0,
            chain: ChainId::Payout,
            num_used: 30,
            window: 0..20,
        }));
        provider.push_response(ScriptedResponse::Error(ProviderError::Connection("down".into())));
        for window in [0..20, 20..40] {
            provider.push_response(ScriptedResponse::Usage(ChainUsage {
                account: 0,
                chain: ChainId::Change,
                num_used: 2,
                window,
            }));
        }
        provider.push_response(ScriptedResponse::Unused);
        provider.push_response(ScriptedResponse::Unused);

        let mut scanner = scanner(provider.clone(), config(20, 20));
        let first = scanner.discover().await;
        assert_eq!(first.failures.len(), 1);
        let checkpoint = scanner.last_checkpoint().cloned().unwrap();
        assert!(!checkpoint.is_complete());
        assert_eq!(provider.remaining_responses(), 0);

        // second run: only the failed payout batches are queried again, the change chain
        // and account 1 are already exhausted
        provider.reset_calls();
        for window in [20..40, 40..60] {
            provider.push_response(ScriptedResponse::Usage(ChainUsage {
                account: 0,
                chain: ChainId::Payout,
                num_used: 30,
                window,
            }));
        }
        let resumed = scanner.resume(&checkpoint).await.unwrap();

        assert!(resumed.is_complete());
        assert_eq!(provider.call_count("get_transactions"), 2);
        assert_eq!(resumed.accounts[0].payout.highest_used_index, Some(29));
        assert_eq!(resumed.accounts[0].payout.batches_scanned, 3);
        assert_eq!(resumed.accounts[0].change.highest_used_index, Some(1));
        assert_eq!(resumed.accounts.len(), 2);
        assert!(scanner.last_checkpoint().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_checkpoint() {
        let provider = Arc::new(scripted());
        let mut scanner = scanner(provider, config(20, 20));
        let checkpoint = DiscoveryCheckpoint {
            wallet_id: "deadbeef_bip44-mainnet".into(),
            profile: "bip44-mainnet".into(),
            gap_limit: 20,
            discovery_increment: 20,
            states: Vec::new(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            scanner.resume(&checkpoint).await,
            Err(WalletError::CheckpointError(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_master_key_drops_checkpoint() {
        let provider = scripted();
        provider.script_hd_discovery(20, 20);
        let provider = Arc::new(provider);
        let mut scanner = scanner(provider, config(20, 20));
        scanner.discover().await;
        let old_id = scanner.tree().wallet_id();
        assert!(scanner.last_checkpoint().is_some());

        scanner.replace_master_key(MasterKey::from_seed(Network::Bitcoin, &[43u8; 32]).unwrap());
        assert!(scanner.last_checkpoint().is_none());
        assert_ne!(scanner.tree().wallet_id(), old_id);
    }

    /// Scripted provider cancelling the scan after a number of calls
    struct CancelAfter {
        inner: ScriptedProvider,
        calls: Mutex<u32>,
        limit: u32,
        handle: Mutex<Option<CancelHandle>>,
    }

    #[async_trait::async_trait]
    impl TransactionDataProvider for CancelAfter {
        async fn get_balance(&self, address: &Address) -> Result<Balance, ProviderError> {
            self.inner.get_balance(address).await
        }

        async fn get_transactions(
            &self,
            addresses: &[Address],
        ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
            let result = self.inner.get_transactions(addresses).await;
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == self.limit {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.cancel();
                }
            }
            result
        }

        async fn get_utxo(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
            self.inner.get_utxo(address).await
        }

        async fn send_transaction(&self, raw: &[u8]) -> Result<String, ProviderError> {
            self.inner.send_transaction(raw).await
        }

        fn supports_concurrent_calls(&self) -> bool {
            false
        }

        fn name(&self) -> &'static str {
            "CancelAfter"
        }
    }

    #[tokio::test]
    async fn test_cancellation_is_resumable() {
        let mut inner = scripted();
        inner.set_num_used_accounts(1);
        inner.set_num_used_addresses(0, 25, ChainId::Payout);
        inner.script_hd_discovery(20, 20);
        let provider = Arc::new(CancelAfter {
            inner,
            calls: Mutex::new(0),
            limit: 1,
            handle: Mutex::new(None),
        });

        let mut scanner = DiscoveryScanner::new(master(), provider.clone(), config(20, 20)).unwrap();
        *provider.handle.lock().unwrap() = Some(scanner.cancel_handle());

        let report = scanner.discover().await;
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.is_cancelled()));
        assert_eq!(report.accounts[0].payout.next_probe_index, 20);
        assert_eq!(report.accounts[0].change.next_probe_index, 0);

        // the cancellation does not leak into the resumed run
        let checkpoint = scanner.last_checkpoint().cloned().unwrap();
        let resumed = scanner.resume(&checkpoint).await.unwrap();
        assert!(resumed.is_complete());
        assert_eq!(resumed.accounts[0].payout.highest_used_index, Some(24));
        assert_eq!(provider.inner.remaining_responses(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_idle_is_ignored() {
        let mut provider = scripted();
        provider.set_num_used_accounts(1);
        provider.set_num_used_addresses(0, 3, ChainId::Payout);
        provider.script_hd_discovery(20, 20);
        let provider = Arc::new(provider);
        let mut scanner = scanner(provider.clone(), config(20, 20));

        scanner.cancel_handle().cancel();
        let report = scanner.discover().await;

        assert_eq!(report.stop_reason, StopReason::UnusedAccount);
        assert!(report.is_complete());
        assert_eq!(report.accounts[0].payout.highest_used_index, Some(2));
        assert_eq!(provider.remaining_responses(), 0);
        assert!(scanner.last_checkpoint().is_some());
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl DiscoveryEventHandler for Recorder {
        async fn handle(&mut self, event: &DiscoveryEvent) -> Result<(), WalletError> {
            let label = match event {
                DiscoveryEvent::AccountStarted { account } => format!("start {}", account),
                DiscoveryEvent::ChainCompleted { state } => {
                    format!("done {}/{}", state.account, state.chain)
                }
                DiscoveryEvent::ChainFailed { state, .. } => {
                    format!("failed {}/{}", state.account, state.chain)
                }
                DiscoveryEvent::AccountFinished { account, used } => {
                    format!("finish {} {}", account, used)
                }
                DiscoveryEvent::DiscoveryCompleted { stop_reason, .. } => {
                    format!("completed {:?}", stop_reason)
                }
            };
            self.0.lock().unwrap().push(label);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recorder"
        }
    }

    #[tokio::test]
    async fn test_events_in_scan_order() {
        let mut provider = scripted();
        provider.set_num_used_accounts(1);
        provider.set_num_used_addresses(0, 1, ChainId::Payout);
        provider.script_hd_discovery(20, 20);
        let provider = Arc::new(provider);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut scanner = scanner(provider, config(20, 20));
        scanner.register_handler(Box::new(Recorder(seen.clone())));
        scanner.discover().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "start 0",
                "done 0/payout",
                "done 0/change",
                "finish 0 true",
                "start 1",
                "done 1/payout",
                "done 1/change",
                "finish 1 false",
                "completed UnusedAccount",
            ]
        );
    }
}

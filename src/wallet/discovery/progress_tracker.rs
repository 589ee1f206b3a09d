//! Progress tracking for address discovery.
//!
//! `DiscoveryProgressTracker` counts what a discovery run has done so far: accounts visited,
//! chains finished or failed, provider batches issued and addresses probed. It logs progress
//! periodically and produces a `DiscoveryStats` summary at the end of a run.

use crate::wallet::discovery::DiscoveryState;

use tracing::{info, warn};

/// Service for tracking discovery progress
#[derive(Debug, Clone, Default)]
pub struct DiscoveryProgressTracker {
    accounts_scanned: u32,
    used_accounts: u32,
    chains_completed: u32,
    chains_failed: u32,
    /// Provider batches issued during this run
    batches_scanned: u32,
    addresses_probed: u64,
    used_addresses: u64,
    /// Batch count at which progress was last logged
    last_logged_batches: u32,
}

impl DiscoveryProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one chain scan. `before` is the state the scan started from.
    pub fn record_chain(&mut self, before: &DiscoveryState, after: &DiscoveryState, failed: bool) {
        let batches = after.batches_scanned.saturating_sub(before.batches_scanned);
        self.batches_scanned += batches;
        self.addresses_probed +=
            u64::from(after.next_probe_index.saturating_sub(before.next_probe_index));
        self.used_addresses += after.highest_used_index.map_or(0, |h| u64::from(h) + 1);

        if failed {
            self.chains_failed += 1;
        } else {
            self.chains_completed += 1;
        }
    }

    pub fn record_account(&mut self, used: bool) {
        self.accounts_scanned += 1;
        if used {
            self.used_accounts += 1;
        }
    }

    /// Log progress every 50 batches or when forced
    pub fn log_progress(&mut self, force: bool) {
        let since_last = self.batches_scanned.saturating_sub(self.last_logged_batches);
        if force || since_last >= 50 {
            info!(
                "Discovery progress: {} accounts, {} batches, {} addresses probed",
                self.accounts_scanned, self.batches_scanned, self.addresses_probed
            );
            self.last_logged_batches = self.batches_scanned;
        }
    }

    pub fn get_stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            accounts_scanned: self.accounts_scanned,
            used_accounts: self.used_accounts,
            chains_completed: self.chains_completed,
            chains_failed: self.chains_failed,
            batches_scanned: self.batches_scanned,
            addresses_probed: self.addresses_probed,
            used_addresses: self.used_addresses,
        }
    }

    /// Warn about failed chains; returns an error message if any chain failed
    pub fn validate_completion(&self) -> Result<(), String> {
        if self.chains_failed > 0 {
            warn!(
                "Discovery finished with {} incomplete chains",
                self.chains_failed
            );
            return Err(format!("{} chains did not complete", self.chains_failed));
        }
        Ok(())
    }
}

/// Statistics about a discovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub accounts_scanned: u32,
    pub used_accounts: u32,
    pub chains_completed: u32,
    pub chains_failed: u32,
    pub batches_scanned: u32,
    pub addresses_probed: u64,
    pub used_addresses: u64,
}

impl DiscoveryStats {
    /// Get a human-readable summary of the discovery statistics
    pub fn summary(&self) -> String {
        format!(
            "Scanned {} accounts ({} used): {} batches, {} addresses probed, {} used addresses{}",
            self.accounts_scanned,
            self.used_accounts,
            self.batches_scanned,
            self.addresses_probed,
            self.used_addresses,
            if self.chains_failed == 0 {
                String::new()
            } else {
                format!(" ({} chains failed)", self.chains_failed)
            }
        )
    }
}

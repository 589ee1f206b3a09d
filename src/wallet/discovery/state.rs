//! Per-chain discovery state and resumable checkpoints.

use crate::keys::ChainId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Progress of the gap-limit scan over one (account, chain) pair.
///
/// `next_probe_index` is the first index not yet covered by a fully processed batch, so
/// every index below it has been classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub account: u32,
    pub chain: ChainId,
    /// Highest index with a non-empty history, `None` while no address has been used
    pub highest_used_index: Option<u32>,
    pub next_probe_index: u32,
    pub batches_scanned: u32,
    pub exhausted: bool,
}

impl DiscoveryState {
    pub fn new(account: u32, chain: ChainId) -> Self {
        Self {
            account,
            chain,
            highest_used_index: None,
            next_probe_index: 0,
            batches_scanned: 0,
            exhausted: false,
        }
    }

    pub fn is_used(&self) -> bool {
        self.highest_used_index.is_some()
    }

    /// Number of consecutive unused addresses at the end of the scanned range.
    pub fn unused_run(&self) -> u32 {
        match self.highest_used_index {
            Some(highest) => self.next_probe_index.saturating_sub(highest + 1),
            None => self.next_probe_index,
        }
    }

    /// Whether the scanned range already ends with at least `gap_limit` unused addresses.
    pub fn reaches_gap(&self, gap_limit: u32) -> bool {
        self.batches_scanned > 0 && self.unused_run() >= gap_limit
    }

    /// Fold a fully processed batch ending at `batch_end` (exclusive) into the state.
    pub fn record_batch(&mut self, batch_end: u32, highest_in_batch: Option<u32>, gap_limit: u32) {
        if let Some(m) = highest_in_batch {
            self.highest_used_index = Some(self.highest_used_index.map_or(m, |h| h.max(m)));
        }
        self.next_probe_index = batch_end;
        self.batches_scanned += 1;
        self.exhausted = self.reaches_gap(gap_limit);
    }

    /// Indices known to be in use, `0..=highest_used_index`.
    pub fn used_range(&self) -> Option<RangeInclusive<u32>> {
        self.highest_used_index.map(|h| 0..=h)
    }
}

/// Serializable snapshot of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCheckpoint {
    /// Master key fingerprint and profile name, see `KeyDerivationTree::wallet_id`
    pub wallet_id: String,
    pub profile: String,
    pub gap_limit: u32,
    pub discovery_increment: u32,
    pub states: Vec<DiscoveryState>,
    pub created_at: DateTime<Utc>,
}

impl DiscoveryCheckpoint {
    pub fn state(&self, account: u32, chain: ChainId) -> Option<&DiscoveryState> {
        self.states
            .iter()
            .find(|s| s.account == account && s.chain == chain)
    }

    /// Number of accounts with any recorded state.
    pub fn account_count(&self) -> u32 {
        self.states.iter().map(|s| s.account + 1).max().unwrap_or(0)
    }

    pub fn used_accounts(&self) -> Vec<u32> {
        let mut accounts: Vec<u32> = self
            .states
            .iter()
            .filter(|s| s.is_used())
            .map(|s| s.account)
            .collect();
        accounts.sort_unstable();
        accounts.dedup();
        accounts
    }

    /// Whether every recorded chain finished its scan.
    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| s.exhausted)
    }
}

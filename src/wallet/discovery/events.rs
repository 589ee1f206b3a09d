//! Event system for address discovery.
//!
//! This module defines the events emitted while a discovery run walks accounts and chains,
//! the handler trait observers implement, and the dispatcher fanning events out to them.
//! Events are informational: handlers cannot influence the scan, and a failing handler never
//! aborts it.

use crate::keys::ChainId;
use crate::wallet::WalletError;
use crate::wallet::discovery::{DiscoveryState, StopReason};

use tracing::{info, warn};

/// Events that occur during discovery
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Scanning of an account begins
    AccountStarted { account: u32 },
    /// A chain reached its gap limit
    ChainCompleted { state: DiscoveryState },
    /// A chain scan stopped on an error; `state` is resumable
    ChainFailed { state: DiscoveryState, error: String },
    /// Both chains of an account were processed
    AccountFinished { account: u32, used: bool },
    /// The run is over
    DiscoveryCompleted {
        accounts_scanned: u32,
        stop_reason: StopReason,
    },
}

/// Trait for handling discovery events.
#[async_trait::async_trait]
pub trait DiscoveryEventHandler: Send + Sync {
    async fn handle(&mut self, event: &DiscoveryEvent) -> Result<(), WalletError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn DiscoveryEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, handler: Box<dyn DiscoveryEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &DiscoveryEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Handler writing every event to the log
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl DiscoveryEventHandler for LoggingEventHandler {
    async fn handle(&mut self, event: &DiscoveryEvent) -> Result<(), WalletError> {
        match event {
            DiscoveryEvent::AccountStarted { account } => {
                info!("Scanning account {}", account);
            }
            DiscoveryEvent::ChainCompleted { state } => {
                info!(
                    "Account {} {} chain exhausted after {} batches, highest used index {}",
                    state.account,
                    state.chain,
                    state.batches_scanned,
                    describe_highest(state.highest_used_index)
                );
            }
            DiscoveryEvent::ChainFailed { state, error } => {
                warn!(
                    "Account {} {} chain failed at index {}: {}",
                    state.account, state.chain, state.next_probe_index, error
                );
            }
            DiscoveryEvent::AccountFinished { account, used } => {
                info!(
                    "Account {} is {}",
                    account,
                    if *used { "in use" } else { "unused" }
                );
            }
            DiscoveryEvent::DiscoveryCompleted {
                accounts_scanned,
                stop_reason,
            } => {
                info!(
                    "Discovery finished after {} accounts: {:?}",
                    accounts_scanned, stop_reason
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingEventHandler"
    }
}

fn describe_highest(highest: Option<u32>) -> String {
    highest.map_or_else(|| "none".to_string(), |h| h.to_string())
}

/// Short label of a chain, e.g. `3/change`
pub fn chain_label(account: u32, chain: ChainId) -> String {
    format!("{}/{}", account, chain)
}

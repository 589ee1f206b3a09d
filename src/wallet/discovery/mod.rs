//! Address and account discovery
//!
//! This module finds which derived addresses and accounts of an HD wallet have ever been
//! used, following the gap-limit protocol. It is composed of several submodules:
//!
//! - `orchestrator`: the `DiscoveryScanner`, walking accounts and applying the account policy.
//! - `scanner`: the batched gap-limit scan of a single chain.
//! - `state`: per-chain discovery state and serializable checkpoints.
//! - `events`: event types and handlers observing a run.
//! - `progress_tracker`: counters and statistics of a run.
//! - `repositories` / `state_persistence`: checkpoint storage for resumable runs.

/// Event system for observing discovery
pub mod events;
/// Account walk and run coordination
pub mod orchestrator;
/// Tracks discovery progress and statistics
pub mod progress_tracker;
/// Checkpoint storage backends
pub mod repositories;
/// Gap-limit scan of one chain
pub mod scanner;
/// Checkpoint persistence service
pub mod state_persistence;
/// Discovery state types
pub mod state;

pub use orchestrator::*;
pub use state::*;

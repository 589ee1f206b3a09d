//! HD wallet address and account discovery.
//!
//! Given a master key and a ledger query capability, finds which derived addresses and
//! accounts of the wallet have ever been used and aggregates their balances.
//!
//! - `keys`: deterministic BIP32 derivation of accounts, chains and addresses.
//! - `provider`: the ledger query capability, an Esplora client and a scripted fake.
//! - `wallet`: the gap-limit discovery engine, checkpoints and balance aggregation.
//! - `config`: discovery and provider settings.
//! - `update`: update check helpers for the command line tooling.

pub mod config;
pub mod keys;
pub mod provider;
pub mod update;
pub mod utils;
pub mod wallet;

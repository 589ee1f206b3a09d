//! Deterministic key derivation for HD wallet profiles.
//!
//! Accounts live under `purpose' / coin_type' / account'`, chains under the account xpub
//! (`0` payout, `1` change) and addresses under the chain key. Nothing here performs I/O.

/// Wallet profiles (derivation prefix, network, address form)
mod account_type;
/// Master keys, chain keys and address derivation
mod derivation;

pub use account_type::{AccountType, AddressKind};
pub use derivation::*;

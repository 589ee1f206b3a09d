//!
//! Utility module for the discovery engine.
//!
//! Re-exports formatting helpers used in log output.
/// Utility functions for formatting and display
pub mod index;

pub use index::{
    BTC_DECIMALS, format_btc_amount, format_btc_unsigned, format_token_amount,
    format_unsigned_amount,
};

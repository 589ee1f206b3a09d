pub mod balance;
pub mod discovery;
pub mod types;

pub use balance::{BalanceAggregator, BalanceQueryMode, WalletBalance};
pub use discovery::{DiscoveryReport, DiscoveryScanner};
pub use types::*;

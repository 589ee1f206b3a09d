//!
//! Runtime configuration for discovery and ledger access.
//!
//! Both configs have sensible defaults and can be overridden from the process environment.
//! Lookups go through a closure so the parsing rules can be exercised without touching the
//! real environment.

use crate::keys::AccountType;
use crate::wallet::BalanceQueryMode;

use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DISCOVERY_INCREMENT: u32 = 20;
pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_MIN_ACCOUNTS: u32 = 1;
pub const DEFAULT_MAX_ACCOUNTS: u32 = 10;
pub const DEFAULT_ESPLORA_URL: &str = "https://blockstream.info/api";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid value {value:?} for {key}: {reason}")]
	InvalidValue {
		key: &'static str,
		value: String,
		reason: String,
	},

	#[error("Unknown account type {0:?}")]
	UnknownAccountType(String),

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

/// Parameters of address and account discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
	/// Addresses requested per provider call
	pub discovery_increment: u32,
	/// Consecutive unused addresses after which a chain is considered exhausted
	pub gap_limit: u32,
	/// Accounts scanned unconditionally, starting at account 0
	pub min_accounts: u32,
	/// Hard cap on the number of accounts scanned
	pub max_accounts: u32,
	pub account_type: AccountType,
	pub balance_query_mode: BalanceQueryMode,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			discovery_increment: DEFAULT_DISCOVERY_INCREMENT,
			gap_limit: DEFAULT_GAP_LIMIT,
			min_accounts: DEFAULT_MIN_ACCOUNTS,
			max_accounts: DEFAULT_MAX_ACCOUNTS,
			account_type: AccountType::default(),
			balance_query_mode: BalanceQueryMode::default(),
		}
	}
}

impl DiscoveryConfig {
	/// Load from `DISCOVERY_INCREMENT`, `GAP_LIMIT`, `MIN_ACCOUNTS`, `MAX_ACCOUNTS`,
	/// `ACCOUNT_TYPE` and `BALANCE_QUERY_MODE`.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = Self::default();

		if let Some(v) = parse_var(&lookup, "DISCOVERY_INCREMENT")? {
			config.discovery_increment = v;
		}
		if let Some(v) = parse_var(&lookup, "GAP_LIMIT")? {
			config.gap_limit = v;
		}
		if let Some(v) = parse_var(&lookup, "MIN_ACCOUNTS")? {
			config.min_accounts = v;
		}
		if let Some(v) = parse_var(&lookup, "MAX_ACCOUNTS")? {
			config.max_accounts = v;
		}
		if let Some(name) = lookup("ACCOUNT_TYPE") {
			config.account_type = AccountType::from_name(name.trim())
				.ok_or_else(|| ConfigError::UnknownAccountType(name.clone()))?;
		}
		if let Some(v) = parse_var(&lookup, "BALANCE_QUERY_MODE")? {
			config.balance_query_mode = v;
		}

		config.validate()?;
		debug!("Loaded discovery config: {:?}", config);
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.discovery_increment == 0 {
			return Err(ConfigError::Invalid("discovery increment must be positive".into()));
		}
		if self.gap_limit == 0 {
			return Err(ConfigError::Invalid("gap limit must be positive".into()));
		}
		if self.max_accounts == 0 {
			return Err(ConfigError::Invalid("max accounts must be positive".into()));
		}
		if self.min_accounts > self.max_accounts {
			return Err(ConfigError::Invalid(format!(
				"min accounts ({}) exceeds max accounts ({})",
				self.min_accounts, self.max_accounts
			)));
		}
		Ok(())
	}
}

/// Ledger backend settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
	pub esplora_url: String,
	/// Per-request timeout
	pub timeout: Duration,
	/// Time budget for retrying a failed call
	pub max_retry_elapsed: Duration,
}

impl Default for ProviderConfig {
	fn default() -> Self {
		Self {
			esplora_url: DEFAULT_ESPLORA_URL.to_string(),
			timeout: Duration::from_secs(30),
			max_retry_elapsed: Duration::from_secs(60),
		}
	}
}

impl ProviderConfig {
	/// Load from `ESPLORA_URL`, `PROVIDER_TIMEOUT_SECS` and `PROVIDER_RETRY_SECS`.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = Self::default();

		if let Some(url) = lookup("ESPLORA_URL") {
			if !url.starts_with("http://") && !url.starts_with("https://") {
				return Err(ConfigError::InvalidValue {
					key: "ESPLORA_URL",
					value: url,
					reason: "expected an http(s) URL".into(),
				});
			}
			config.esplora_url = url;
		}
		if let Some(secs) = parse_var::<u64, _>(&lookup, "PROVIDER_TIMEOUT_SECS")? {
			config.timeout = Duration::from_secs(secs);
		}
		if let Some(secs) = parse_var::<u64, _>(&lookup, "PROVIDER_RETRY_SECS")? {
			config.max_retry_elapsed = Duration::from_secs(secs);
		}

		Ok(config)
	}
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
	T: FromStr,
	T::Err: std::fmt::Display,
	F: Fn(&str) -> Option<String>,
{
	match lookup(key) {
		None => Ok(None),
		Some(raw) => raw
			.trim()
			.parse::<T>()
			.map(Some)
			.map_err(|e| ConfigError::InvalidValue {
				key,
				value: raw.clone(),
				reason: e.to_string(),
			}),
	}
}

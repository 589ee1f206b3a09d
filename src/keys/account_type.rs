use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, DerivationPath};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::DerivationError;

/// Script form used when turning a derived public key into an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
	/// Legacy pay-to-pubkey-hash (BIP44 wallets)
	P2pkh,
	/// Native segwit v0 pay-to-witness-pubkey-hash (BIP84 wallets)
	P2wpkh,
}

/// A wallet profile: the hardened `purpose' / coin_type'` prefix every account of the
/// wallet is derived under, plus the network and address form of its addresses.
///
/// Two profiles with different prefixes never produce the same address for one master key,
/// so the profile is part of a wallet's identity and is fixed once chosen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountType {
	name: String,
	purpose: u32,
	coin_type: u32,
	network: Network,
	address_kind: AddressKind,
}

impl AccountType {
	pub const BIP44_MAINNET: &'static str = "bip44-mainnet";
	pub const BIP44_TESTNET: &'static str = "bip44-testnet";
	pub const BIP84_MAINNET: &'static str = "bip84-mainnet";
	pub const BIP84_TESTNET: &'static str = "bip84-testnet";

	/// Define a custom profile. Both prefix segments must fit below the hardened boundary.
	pub fn custom(
		name: impl Into<String>,
		purpose: u32,
		coin_type: u32,
		network: Network,
		address_kind: AddressKind,
	) -> Result<Self, DerivationError> {
		ChildNumber::from_hardened_idx(purpose).map_err(|_| DerivationError::IndexOutOfRange {
			level: "purpose",
			index: purpose,
		})?;
		ChildNumber::from_hardened_idx(coin_type).map_err(|_| {
			DerivationError::IndexOutOfRange {
				level: "account type",
				index: coin_type,
			}
		})?;

		Ok(Self {
			name: name.into(),
			purpose,
			coin_type,
			network,
			address_kind,
		})
	}

	pub fn bip44_mainnet() -> Self {
		Self::builtin(Self::BIP44_MAINNET, 44, 0, Network::Bitcoin, AddressKind::P2pkh)
	}

	pub fn bip44_testnet() -> Self {
		Self::builtin(Self::BIP44_TESTNET, 44, 1, Network::Testnet, AddressKind::P2pkh)
	}

	pub fn bip84_mainnet() -> Self {
		Self::builtin(Self::BIP84_MAINNET, 84, 0, Network::Bitcoin, AddressKind::P2wpkh)
	}

	pub fn bip84_testnet() -> Self {
		Self::builtin(Self::BIP84_TESTNET, 84, 1, Network::Testnet, AddressKind::P2wpkh)
	}

	/// Look up one of the built-in profiles by name (case-insensitive).
	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().as_str() {
			Self::BIP44_MAINNET => Some(Self::bip44_mainnet()),
			Self::BIP44_TESTNET => Some(Self::bip44_testnet()),
			Self::BIP84_MAINNET => Some(Self::bip84_mainnet()),
			Self::BIP84_TESTNET => Some(Self::bip84_testnet()),
			_ => None,
		}
	}

	pub fn builtin_names() -> [&'static str; 4] {
		[
			Self::BIP44_MAINNET,
			Self::BIP44_TESTNET,
			Self::BIP84_MAINNET,
			Self::BIP84_TESTNET,
		]
	}

	fn builtin(
		name: &str,
		purpose: u32,
		coin_type: u32,
		network: Network,
		address_kind: AddressKind,
	) -> Self {
		Self {
			name: name.to_string(),
			purpose,
			coin_type,
			network,
			address_kind,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn purpose(&self) -> u32 {
		self.purpose
	}

	pub fn coin_type(&self) -> u32 {
		self.coin_type
	}

	pub fn network(&self) -> Network {
		self.network
	}

	pub fn address_kind(&self) -> AddressKind {
		self.address_kind
	}

	/// Hardened path of account `account`: `m / purpose' / coin_type' / account'`.
	pub fn account_path(&self, account: u32) -> Result<DerivationPath, DerivationError> {
		let segments = [
			("purpose", self.purpose),
			("account type", self.coin_type),
			("account", account),
		];

		let mut children = Vec::with_capacity(segments.len());
		for (level, index) in segments {
			let child = ChildNumber::from_hardened_idx(index)
				.map_err(|_| DerivationError::IndexOutOfRange { level, index })?;
			children.push(child);
		}

		Ok(DerivationPath::from(children))
	}
}

impl Default for AccountType {
	fn default() -> Self {
		Self::bip44_mainnet()
	}
}

impl fmt::Display for AccountType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} (m/{}'/{}')",
			self.name, self.purpose, self.coin_type
		)
	}
}

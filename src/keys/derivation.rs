use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, Fingerprint, Xpriv, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use super::{AccountType, AddressKind};

/// Errors raised by a single derivation call. They never poison the session: the same
/// tree keeps deriving other indices afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerivationError {
	#[error("{level} index {index} is outside the derivable range")]
	IndexOutOfRange { level: &'static str, index: u32 },

	#[error("Invalid master key: {0}")]
	InvalidMasterKey(String),

	#[error("Invalid mnemonic: {0}")]
	InvalidMnemonic(String),

	#[error("Key derivation failed: {0}")]
	Bip32(String),
}

/// Chain of an HD account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
	/// External chain, addresses handed out for receiving (chain id 0)
	Payout,
	/// Internal chain, addresses used for change outputs (chain id 1)
	Change,
}

impl ChainId {
	pub const ALL: [ChainId; 2] = [ChainId::Payout, ChainId::Change];

	pub fn index(self) -> u32 {
		match self {
			ChainId::Payout => 0,
			ChainId::Change => 1,
		}
	}
}

impl fmt::Display for ChainId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChainId::Payout => f.write_str("payout"),
			ChainId::Change => f.write_str("change"),
		}
	}
}

/// Root key material of a wallet session.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
	xpriv: Xpriv,
}

impl MasterKey {
	pub fn from_seed(network: Network, seed: &[u8]) -> Result<Self, DerivationError> {
		let xpriv = Xpriv::new_master(network, seed)
			.map_err(|e| DerivationError::InvalidMasterKey(e.to_string()))?;
		Ok(Self { xpriv })
	}

	/// Build the master key from a BIP39 phrase and optional passphrase.
	pub fn from_mnemonic(
		words: &str,
		passphrase: &str,
		network: Network,
	) -> Result<Self, DerivationError> {
		let mnemonic = Mnemonic::parse(words)
			.map_err(|e| DerivationError::InvalidMnemonic(e.to_string()))?;
		let seed = mnemonic.to_seed(passphrase);
		Self::from_seed(network, &seed)
	}

	/// Fresh random master key, for brand new wallets.
	pub fn generate(network: Network) -> Result<Self, DerivationError> {
		let mut seed = [0u8; 32];
		rand::rng().fill(&mut seed);
		Self::from_seed(network, &seed)
	}

	pub fn from_xpriv(xpriv: Xpriv) -> Self {
		Self { xpriv }
	}

	pub fn fingerprint(&self, secp: &Secp256k1<All>) -> Fingerprint {
		self.xpriv.fingerprint(secp)
	}

	pub(crate) fn xpriv(&self) -> &Xpriv {
		&self.xpriv
	}
}

impl FromStr for MasterKey {
	type Err = DerivationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let xpriv =
			Xpriv::from_str(s).map_err(|e| DerivationError::InvalidMasterKey(e.to_string()))?;
		Ok(Self { xpriv })
	}
}

impl fmt::Debug for MasterKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MasterKey")
			.field("network", &self.xpriv.network)
			.field("fingerprint", &self.xpriv.fingerprint(&Secp256k1::new()))
			.finish_non_exhaustive()
	}
}

/// Watch-only key of one chain of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainKey {
	pub account: u32,
	pub chain: ChainId,
	pub xpub: Xpub,
	pub network: Network,
	pub address_kind: AddressKind,
}

/// Keys of one account: the payout and change chain keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeys {
	pub index: u32,
	pub payout_key: ChainKey,
	pub change_key: ChainKey,
}

impl AccountKeys {
	pub fn chain(&self, chain: ChainId) -> &ChainKey {
		match chain {
			ChainId::Payout => &self.payout_key,
			ChainId::Change => &self.change_key,
		}
	}
}

/// Derive the two chain keys of account `index`.
///
/// The account level is hardened private derivation; chain keys are public children of
/// the account xpub so everything below them can be derived without private material.
pub fn derive_account(
	master: &MasterKey,
	account_type: &AccountType,
	index: u32,
) -> Result<AccountKeys, DerivationError> {
	let secp = Secp256k1::new();
	derive_account_with(&secp, master, account_type, index)
}

fn derive_account_with(
	secp: &Secp256k1<All>,
	master: &MasterKey,
	account_type: &AccountType,
	index: u32,
) -> Result<AccountKeys, DerivationError> {
	let path = account_type.account_path(index)?;
	let account_xpriv = master
		.xpriv()
		.derive_priv(secp, &path)
		.map_err(|e| DerivationError::Bip32(e.to_string()))?;
	let account_xpub = Xpub::from_priv(secp, &account_xpriv);

	let chain_key = |chain: ChainId| -> Result<ChainKey, DerivationError> {
		let child = ChildNumber::from_normal_idx(chain.index())
			.map_err(|e| DerivationError::Bip32(e.to_string()))?;
		let xpub = account_xpub
			.derive_pub(secp, &[child])
			.map_err(|e| DerivationError::Bip32(e.to_string()))?;
		Ok(ChainKey {
			account: index,
			chain,
			xpub,
			network: account_type.network(),
			address_kind: account_type.address_kind(),
		})
	};

	Ok(AccountKeys {
		index,
		payout_key: chain_key(ChainId::Payout)?,
		change_key: chain_key(ChainId::Change)?,
	})
}

/// Derive the address at `index` on a chain.
pub fn derive_address(chain_key: &ChainKey, index: u32) -> Result<Address, DerivationError> {
	let secp = Secp256k1::verification_only();
	let child = ChildNumber::from_normal_idx(index).map_err(|_| {
		DerivationError::IndexOutOfRange {
			level: "address",
			index,
		}
	})?;

	let derived = chain_key
		.xpub
		.derive_pub(&secp, &[child])
		.map_err(|e| DerivationError::Bip32(e.to_string()))?;
	let compressed = CompressedPublicKey(derived.public_key);

	let address = match chain_key.address_kind {
		AddressKind::P2pkh => Address::p2pkh(compressed.pubkey_hash(), chain_key.network),
		AddressKind::P2wpkh => Address::p2wpkh(&compressed, chain_key.network),
	};
	Ok(address)
}

/// Derive `(index, address)` pairs for every index of `range`.
pub fn derive_addresses(
	chain_key: &ChainKey,
	range: Range<u32>,
) -> Result<Vec<(u32, Address)>, DerivationError> {
	range
		.map(|index| derive_address(chain_key, index).map(|address| (index, address)))
		.collect()
}

/// Deterministic derivation of every account, chain and address of one wallet profile.
///
/// The tree is a pure function of its master key and account type; replacing the master
/// key yields a new tree and invalidates anything derived from the previous one.
#[derive(Clone)]
pub struct KeyDerivationTree {
	master: MasterKey,
	account_type: AccountType,
	secp: Secp256k1<All>,
}

impl KeyDerivationTree {
	pub fn new(master: MasterKey, account_type: AccountType) -> Self {
		Self {
			master,
			account_type,
			secp: Secp256k1::new(),
		}
	}

	pub fn account_type(&self) -> &AccountType {
		&self.account_type
	}

	pub fn fingerprint(&self) -> Fingerprint {
		self.master.fingerprint(&self.secp)
	}

	/// Identifier of the wallet profile: master fingerprint plus profile name.
	pub fn wallet_id(&self) -> String {
		format!(
			"{}_{}",
			hex::encode(self.fingerprint().as_bytes()),
			self.account_type.name()
		)
	}

	pub fn derive_account(&self, index: u32) -> Result<AccountKeys, DerivationError> {
		derive_account_with(&self.secp, &self.master, &self.account_type, index)
	}

	pub fn derive_address(
		&self,
		account: u32,
		chain: ChainId,
		index: u32,
	) -> Result<Address, DerivationError> {
		let keys = self.derive_account(account)?;
		derive_address(keys.chain(chain), index)
	}

	/// Full path of an address, for display: `m/purpose'/coin'/account'/chain/index`.
	pub fn derivation_path(&self, account: u32, chain: ChainId, index: u32) -> String {
		format!(
			"m/{}'/{}'/{}'/{}/{}",
			self.account_type.purpose(),
			self.account_type.coin_type(),
			account,
			chain.index(),
			index
		)
	}
}

impl fmt::Debug for KeyDerivationTree {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyDerivationTree")
			.field("master", &self.master)
			.field("account_type", &self.account_type)
			.finish()
	}
}

//! Scripted transaction data provider.
//!
//! `ScriptedProvider` stands in for a ledger in tests and dry runs. Responses to
//! `get_transactions` come from a FIFO script consumed strictly in call order; a call with
//! no scripted response left fails with `ProviderError::ScriptExhausted`. Usage patterns
//! ("the first N addresses of this chain are used") are synthesised per call with
//! [`is_used`], so a script can describe a whole HD discovery without listing addresses.
//!
//! Balances are derived from the configured usage: every used payout address holds
//! 100000 confirmed satoshis and every used change address 10000 unconfirmed satoshis.

use super::types::*;
use super::TransactionDataProvider;
use crate::config::DEFAULT_DISCOVERY_INCREMENT;
use crate::keys::{AccountKeys, AccountType, ChainId, DerivationError, MasterKey, derive_account, derive_addresses};

use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{Address, Txid};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Mutex;
use tracing::debug;

/// Accounts derived by a scripted provider unless configured otherwise.
pub const DEFAULT_SCRIPTED_ACCOUNTS: u32 = 10;
/// Addresses derived per chain unless configured otherwise.
pub const DEFAULT_SCRIPTED_ADDRESSES: u32 = 8 * DEFAULT_DISCOVERY_INCREMENT;

const PAYOUT_BALANCE: Balance = Balance {
    confirmed: 100_000,
    unconfirmed: 0,
};
const CHANGE_BALANCE: Balance = Balance {
    confirmed: 0,
    unconfirmed: 10_000,
};

/// Whether the address at `index` reports transactions, given that the first `num_used`
/// addresses of its chain are used and only indices inside `window` are answered as used.
pub fn is_used(index: u32, num_used: u32, window: Range<u32>) -> bool {
    num_used > 0 && index >= window.start && index < window.end.min(num_used)
}

/// Usage pattern answering one `get_transactions` call for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUsage {
    pub account: u32,
    pub chain: ChainId,
    pub num_used: u32,
    pub window: Range<u32>,
}

/// One scripted answer to `get_transactions`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// Addresses of the given chain answer according to [`is_used`]; all others are unused
    Usage(ChainUsage),
    /// Every requested address is unused
    Unused,
    /// The call fails
    Error(ProviderError),
}

struct ScriptedAccount {
    keys: AccountKeys,
    payout_addresses: Vec<Address>,
    change_addresses: Vec<Address>,
}

impl ScriptedAccount {
    fn addresses(&self, chain: ChainId) -> &[Address] {
        match chain {
            ChainId::Payout => &self.payout_addresses,
            ChainId::Change => &self.change_addresses,
        }
    }
}

#[derive(Default)]
struct ScriptState {
    responses: VecDeque<ScriptedResponse>,
    calls: HashMap<&'static str, usize>,
    broadcasts: Vec<Vec<u8>>,
}

/// Transaction data provider replaying a script
pub struct ScriptedProvider {
    account_type: AccountType,
    max_accounts: u32,
    max_address: u32,
    accounts: Vec<ScriptedAccount>,
    address_index: HashMap<Address, (u32, ChainId, u32)>,
    num_used_addresses: Vec<[u32; 2]>,
    num_used_accounts: u32,
    state: Mutex<ScriptState>,
}

impl ScriptedProvider {
    pub fn new(account_type: AccountType, master: MasterKey) -> Result<Self, DerivationError> {
        Self::with_limits(
            account_type,
            master,
            DEFAULT_SCRIPTED_ACCOUNTS,
            DEFAULT_SCRIPTED_ADDRESSES,
        )
    }

    /// Scripted provider deriving `max_accounts` accounts of `max_address` addresses per chain.
    pub fn with_limits(
        account_type: AccountType,
        master: MasterKey,
        max_accounts: u32,
        max_address: u32,
    ) -> Result<Self, DerivationError> {
        let mut provider = Self {
            account_type,
            max_accounts,
            max_address,
            accounts: Vec::new(),
            address_index: HashMap::new(),
            num_used_addresses: Vec::new(),
            num_used_accounts: 0,
            state: Mutex::new(ScriptState::default()),
        };
        provider.set_master_key(master)?;
        Ok(provider)
    }

    /// Replace the master key. All derived addresses and usage counts are reset.
    pub fn set_master_key(&mut self, master: MasterKey) -> Result<(), DerivationError> {
        let mut accounts = Vec::with_capacity(self.max_accounts as usize);
        let mut address_index = HashMap::new();

        for account in 0..self.max_accounts {
            let keys = derive_account(&master, &self.account_type, account)?;
            let payout_addresses: Vec<Address> = derive_addresses(&keys.payout_key, 0..self.max_address)?
                .into_iter()
                .map(|(_, address)| address)
                .collect();
            let change_addresses: Vec<Address> = derive_addresses(&keys.change_key, 0..self.max_address)?
                .into_iter()
                .map(|(_, address)| address)
                .collect();

            for (chain, addresses) in [
                (ChainId::Payout, &payout_addresses),
                (ChainId::Change, &change_addresses),
            ] {
                for (index, address) in addresses.iter().enumerate() {
                    address_index.insert(address.clone(), (account, chain, index as u32));
                }
            }

            accounts.push(ScriptedAccount {
                keys,
                payout_addresses,
                change_addresses,
            });
        }

        self.accounts = accounts;
        self.address_index = address_index;
        self.num_used_addresses = vec![[0, 0]; self.max_accounts as usize];
        self.num_used_accounts = 0;
        Ok(())
    }

    pub fn account_type(&self) -> &AccountType {
        &self.account_type
    }

    pub fn max_accounts(&self) -> u32 {
        self.max_accounts
    }

    /// Mark the first `n` addresses of a chain as used.
    pub fn set_num_used_addresses(&mut self, account: u32, n: u32, chain: ChainId) {
        if let Some(counts) = self.num_used_addresses.get_mut(account as usize) {
            counts[chain.index() as usize] = n.min(self.max_address);
        }
    }

    /// Mark the first `n` accounts as used. Only used accounts report any usage.
    pub fn set_num_used_accounts(&mut self, n: u32) {
        self.num_used_accounts = n.min(self.max_accounts);
    }

    pub fn num_used(&self, account: u32, chain: ChainId) -> u32 {
        if account >= self.num_used_accounts {
            return 0;
        }
        self.num_used_addresses
            .get(account as usize)
            .map(|counts| counts[chain.index() as usize])
            .unwrap_or(0)
    }

    /// Address at `index` of a chain, if within the derived range.
    pub fn address(&self, account: u32, chain: ChainId, index: u32) -> Option<Address> {
        self.accounts
            .get(account as usize)
            .and_then(|a| a.addresses(chain).get(index as usize))
            .cloned()
    }

    pub fn account_keys(&self, account: u32) -> Option<&AccountKeys> {
        self.accounts.get(account as usize).map(|a| &a.keys)
    }

    /// Append a response to the `get_transactions` script.
    pub fn push_response(&self, response: ScriptedResponse) {
        self.lock().responses.push_back(response);
    }

    /// Script the answers to probing a single address index.
    pub fn script_index_probe(&self, account: u32, index: u32, chain: ChainId) {
        self.push_response(ScriptedResponse::Usage(ChainUsage {
            account,
            chain,
            num_used: index + 1,
            window: index..index + 1,
        }));
    }

    /// Script every `get_transactions` call a full discovery will make, assuming payout then
    /// change are scanned for each account and the scan continues one account past the last
    /// used one. Returns the number of scripted responses.
    pub fn script_hd_discovery(&self, increment: u32, gap_limit: u32) -> usize {
        let accounts = if self.num_used_accounts == 0 {
            1
        } else {
            (self.num_used_accounts + 1).min(self.max_accounts)
        };

        let mut scripted = 0;
        for account in 0..accounts {
            for chain in ChainId::ALL {
                let num_used = self.num_used(account, chain);
                let batches = (num_used + gap_limit).div_ceil(increment).max(1);

                for batch in 0..batches {
                    self.push_response(ScriptedResponse::Usage(ChainUsage {
                        account,
                        chain,
                        num_used,
                        window: batch * increment..(batch + 1) * increment,
                    }));
                    scripted += 1;
                }
            }
        }

        debug!("Scripted {} get_transactions responses for {} accounts", scripted, accounts);
        scripted
    }

    pub fn remaining_responses(&self) -> usize {
        self.lock().responses.len()
    }

    /// Number of calls made to `method` so far.
    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Forget recorded calls, keeping the script.
    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.lock().broadcasts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A panic while holding the lock cannot leave the script half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_call(&self, method: &'static str) -> usize {
        let mut state = self.lock();
        let count = state.calls.entry(method).or_insert(0);
        *count += 1;
        *count
    }

    fn scripted_balance(&self, address: &Address) -> Balance {
        match self.address_index.get(address) {
            Some(&(account, chain, index)) if index < self.num_used(account, chain) => match chain {
                ChainId::Payout => PAYOUT_BALANCE,
                ChainId::Change => CHANGE_BALANCE,
            },
            _ => Balance::default(),
        }
    }

    fn dummy_transaction(address: &Address) -> LedgerTransaction {
        LedgerTransaction {
            txid: fake_txid(address.to_string().as_bytes()),
            confirmed: true,
            block_height: Some(1),
            fee: None,
        }
    }

    fn answer(&self, response: ScriptedResponse, addresses: &[Address]) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        match response {
            ScriptedResponse::Error(e) => Err(e),
            ScriptedResponse::Unused => Ok(addresses.iter().map(|a| (a.clone(), Vec::new())).collect()),
            ScriptedResponse::Usage(usage) => Ok(addresses
                .iter()
                .map(|address| {
                    let used = match self.address_index.get(address) {
                        Some(&(account, chain, index)) if account == usage.account && chain == usage.chain => {
                            is_used(index, usage.num_used, usage.window.clone())
                        }
                        _ => false,
                    };
                    let txs = if used { vec![Self::dummy_transaction(address)] } else { Vec::new() };
                    (address.clone(), txs)
                })
                .collect()),
        }
    }
}

fn fake_txid(data: &[u8]) -> String {
    Txid::from_raw_hash(sha256d::Hash::hash(data)).to_string()
}

#[async_trait::async_trait]
impl TransactionDataProvider for ScriptedProvider {
    async fn get_balance(&self, address: &Address) -> Result<Balance, ProviderError> {
        self.record_call("get_balance");
        Ok(self.scripted_balance(address))
    }

    async fn get_transactions(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        let calls = self.record_call("get_transactions");
        let response = self.lock().responses.pop_front();
        match response {
            Some(response) => self.answer(response, addresses),
            None => Err(ProviderError::ScriptExhausted {
                method: "get_transactions",
                calls,
            }),
        }
    }

    async fn get_utxo(&self, address: &Address) -> Result<Vec<Utxo>, ProviderError> {
        self.record_call("get_utxo");
        let balance = self.scripted_balance(address);
        if balance.confirmed == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Utxo {
            txid: fake_txid(address.to_string().as_bytes()),
            vout: 0,
            value: balance.confirmed,
            confirmed: true,
            block_height: Some(1),
        }])
    }

    async fn send_transaction(&self, raw: &[u8]) -> Result<String, ProviderError> {
        self.record_call("send_transaction");
        if raw.is_empty() {
            return Err(ProviderError::Rejected("empty transaction".to_string()));
        }
        self.lock().broadcasts.push(raw.to_vec());
        Ok(fake_txid(raw))
    }

    /// Scripted balances of the addresses inside the query bounds. Unused addresses within
    /// the bounds report a zero balance.
    async fn get_balance_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Balance>, ProviderError> {
        self.record_call("get_balance_hd");

        let mut balances = HashMap::new();
        for query in accounts {
            for (_, addresses) in query.chain_addresses()? {
                for address in addresses {
                    let balance = self.scripted_balance(&address);
                    balances.insert(address, balance);
                }
            }
        }
        Ok(balances)
    }

    async fn get_transactions_hd(
        &self,
        accounts: &[HdAccountQuery],
    ) -> Result<HashMap<Address, Vec<LedgerTransaction>>, ProviderError> {
        self.record_call("get_transactions_hd");

        let mut result = HashMap::new();
        for query in accounts {
            for (chain, addresses) in query.chain_addresses()? {
                let num_used = self.num_used(query.account(), chain);
                for (index, address) in addresses.into_iter().enumerate() {
                    let txs = if is_used(index as u32, num_used, 0..num_used) {
                        vec![Self::dummy_transaction(&address)]
                    } else {
                        Vec::new()
                    };
                    result.insert(address, txs);
                }
            }
        }
        Ok(result)
    }

    fn supports_concurrent_calls(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "ScriptedProvider"
    }
}

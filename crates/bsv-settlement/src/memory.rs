//! In-process collaborators and index.
//!
//! `MemoryInvoiceCounter` is fit for single-process deployments. The rest
//! exist for tests and local tooling: they keep everything in maps and
//! record what was asked of them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bsv_electrum::{Balance, ElectrumError, HistoryEntry, IndexService, UnspentOutput};
use bsv_script::ScriptHash;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::collaborators::*;
use crate::SettlementError;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Strictly increasing per-merchant indexes starting at 0.
#[derive(Debug, Default)]
pub struct MemoryInvoiceCounter {
    next: Mutex<HashMap<String, u32>>,
}

impl MemoryInvoiceCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceCounter for MemoryInvoiceCounter {
    async fn next_index(&self, merchant_id: &str) -> Result<u32, SettlementError> {
        let mut next = guard(&self.next);
        let slot = next.entry(merchant_id.to_string()).or_insert(0);
        let index = *slot;
        *slot = slot
            .checked_add(1)
            .ok_or_else(|| SettlementError::Store(format!("invoice indexes exhausted for {}", merchant_id)))?;
        Ok(index)
    }
}

/// Treats the stored seed bytes as already decrypted.
#[derive(Debug, Default)]
pub struct PlaintextSeeds;

impl SeedDecryptor for PlaintextSeeds {
    fn decrypt(&self, encrypted: &[u8]) -> Result<Seed, SettlementError> {
        Ok(Zeroizing::new(encrypted.to_vec()))
    }
}

#[derive(Debug, Default)]
struct MerchantEntry {
    wallet: Option<MerchantWallet>,
    balance: i64,
    addresses: Vec<OwnedAddress>,
}

#[derive(Debug, Default)]
pub struct MemoryMerchantStore {
    merchants: Mutex<HashMap<String, MerchantEntry>>,
}

impl MemoryMerchantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_wallet(&self, wallet: MerchantWallet) {
        let id = wallet.merchant_id.clone();
        guard(&self.merchants).entry(id).or_default().wallet = Some(wallet);
    }

    pub fn add_address(&self, merchant_id: &str, address: OwnedAddress) {
        let mut merchants = guard(&self.merchants);
        merchants.entry(merchant_id.to_string()).or_default().addresses.push(address);
    }

    pub fn stored_balance(&self, merchant_id: &str) -> i64 {
        guard(&self.merchants).get(merchant_id).map_or(0, |m| m.balance)
    }
}

#[async_trait]
impl MerchantStore for MemoryMerchantStore {
    async fn wallet(&self, merchant_id: &str) -> Result<MerchantWallet, SettlementError> {
        guard(&self.merchants)
            .get(merchant_id)
            .and_then(|m| m.wallet.clone())
            .ok_or_else(|| SettlementError::Store(format!("unknown merchant {}", merchant_id)))
    }

    async fn balance(&self, merchant_id: &str) -> Result<i64, SettlementError> {
        Ok(self.stored_balance(merchant_id))
    }

    async fn set_balance(&self, merchant_id: &str, balance: i64) -> Result<(), SettlementError> {
        guard(&self.merchants).entry(merchant_id.to_string()).or_default().balance = balance;
        Ok(())
    }

    async fn owned_addresses(&self, merchant_id: &str) -> Result<Vec<OwnedAddress>, SettlementError> {
        Ok(guard(&self.merchants)
            .get(merchant_id)
            .map(|m| m.addresses.clone())
            .unwrap_or_default())
    }
}

/// Counts invalidations.
#[derive(Debug, Default)]
pub struct RecordingCache {
    merchants: Mutex<Vec<String>>,
    chain_height: AtomicUsize,
}

impl RecordingCache {
    pub fn merchant_invalidations(&self) -> Vec<String> {
        guard(&self.merchants).clone()
    }

    pub fn chain_height_invalidations(&self) -> usize {
        self.chain_height.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceCache for RecordingCache {
    async fn invalidate_merchant(&self, merchant_id: &str) {
        guard(&self.merchants).push(merchant_id.to_string());
    }

    async fn invalidate_chain_height(&self) {
        self.chain_height.fetch_add(1, Ordering::SeqCst);
    }
}

/// A delivered notification.
#[derive(Clone, Debug, PartialEq)]
pub struct SentEvent {
    pub merchant_id: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SentEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<SentEvent> {
        guard(&self.events).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, merchant_id: &str, event: &str, payload: Value) -> Result<(), SettlementError> {
        guard(&self.events).push(SentEvent {
            merchant_id: merchant_id.to_string(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IndexState {
    balances: HashMap<ScriptHash, Balance>,
    histories: HashMap<ScriptHash, Vec<HistoryEntry>>,
    unspent: HashMap<ScriptHash, Vec<UnspentOutput>>,
    transactions: HashMap<String, String>,
    broadcasts: Vec<String>,
    broadcast_reply: Option<Value>,
    failing: HashSet<ScriptHash>,
    height: u64,
}

/// An [`IndexService`] answering from maps.
///
/// Broadcasts are recorded and answered with the transaction's own txid
/// unless [`MemoryIndex::set_broadcast_reply`] overrides it.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
    balance_calls: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, script_hash: ScriptHash, balance: Balance) {
        guard(&self.state).balances.insert(script_hash, balance);
    }

    pub fn set_history(&self, script_hash: ScriptHash, history: Vec<HistoryEntry>) {
        guard(&self.state).histories.insert(script_hash, history);
    }

    pub fn set_unspent(&self, script_hash: ScriptHash, unspent: Vec<UnspentOutput>) {
        guard(&self.state).unspent.insert(script_hash, unspent);
    }

    pub fn add_transaction(&self, txid: impl Into<String>, raw_hex: impl Into<String>) {
        guard(&self.state).transactions.insert(txid.into(), raw_hex.into());
    }

    pub fn set_height(&self, height: u64) {
        guard(&self.state).height = height;
    }

    /// Make every query for `script_hash` fail as if all servers were down.
    pub fn fail_script_hash(&self, script_hash: ScriptHash, failing: bool) {
        let mut state = guard(&self.state);
        if failing {
            state.failing.insert(script_hash);
        } else {
            state.failing.remove(&script_hash);
        }
    }

    /// Raw JSON the next broadcasts answer with.
    pub fn set_broadcast_reply(&self, reply: Value) {
        guard(&self.state).broadcast_reply = Some(reply);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        guard(&self.state).broadcasts.clone()
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    fn check(&self, script_hash: &ScriptHash) -> Result<(), ElectrumError> {
        if guard(&self.state).failing.contains(script_hash) {
            return Err(ElectrumError::NoServersAvailable);
        }
        Ok(())
    }
}

#[async_trait]
impl IndexService for MemoryIndex {
    async fn balance(&self, script_hash: &ScriptHash) -> Result<Balance, ElectrumError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.check(script_hash)?;
        Ok(guard(&self.state).balances.get(script_hash).copied().unwrap_or_default())
    }

    async fn history(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryEntry>, ElectrumError> {
        self.check(script_hash)?;
        Ok(guard(&self.state).histories.get(script_hash).cloned().unwrap_or_default())
    }

    async fn unspent(&self, script_hash: &ScriptHash) -> Result<Vec<UnspentOutput>, ElectrumError> {
        self.check(script_hash)?;
        Ok(guard(&self.state).unspent.get(script_hash).cloned().unwrap_or_default())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<String, ElectrumError> {
        guard(&self.state)
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| ElectrumError::Rpc {
                code: 2,
                message: format!("no such transaction {}", txid),
            })
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String, ElectrumError> {
        let mut state = guard(&self.state);
        state.broadcasts.push(raw_hex.to_string());
        match &state.broadcast_reply {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(ElectrumError::Protocol(format!("unexpected broadcast result {}", other))),
            None => {
                let tx = bsv_transaction::Transaction::from_hex(raw_hex)
                    .map_err(|e| ElectrumError::Rpc { code: 1, message: e.to_string() })?;
                let txid = tx.tx_id_hex();
                state.transactions.insert(txid.clone(), raw_hex.to_string());
                Ok(txid)
            }
        }
    }

    async fn chain_height(&self) -> Result<u64, ElectrumError> {
        Ok(guard(&self.state).height)
    }
}

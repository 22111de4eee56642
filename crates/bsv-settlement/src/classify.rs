//! Transaction classification relative to the set of addresses a merchant
//! owns at the time of asking.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bsv_electrum::IndexService;
use bsv_script::{address_to_script_hash, script_to_address, Network};
use bsv_transaction::{Transaction, TransactionOutput};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::debug;

use crate::collaborators::MerchantStore;
use crate::SettlementError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Funds arrived from outside.
    Received,
    /// Owned inputs paid someone else.
    Sent,
    /// Owned inputs paid only owned outputs.
    SelfTransfer,
    /// Touches no owned address that could be seen.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClassifiedTransaction {
    pub txid: String,
    pub direction: Direction,
    /// Satoshis received, sent away, or moved between owned addresses.
    pub amount: u64,
    /// First foreign address on the other side, when one is attributable.
    pub counterparty: Option<String>,
    pub confirmations: u64,
    /// Only known when every spent output could be fetched.
    pub fee: Option<u64>,
    /// Index-server height: positive when mined, 0 or -1 in the mempool.
    pub height: i64,
}

impl ClassifiedTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// Confirmations for a transaction at `height` with the chain at `tip`.
pub fn confirmations(height: i64, tip: u64) -> u64 {
    if height <= 0 {
        return 0;
    }
    let height = height as u64;
    if tip < height {
        return 0;
    }
    tip - height + 1
}

/// Classify `tx`. `prevouts[i]` is the output spent by input `i`, if known.
pub fn classify(
    tx: &Transaction,
    prevouts: &[Option<TransactionOutput>],
    owned: &HashSet<String>,
    network: Network,
    height: i64,
    tip: u64,
) -> ClassifiedTransaction {
    let address_of = |output: &TransactionOutput| {
        script_to_address(&output.locking_script, network).map(|a| a.address_string)
    };

    let mut spends_owned = false;
    let mut sender = None;
    for prevout in prevouts.iter().flatten() {
        match address_of(prevout) {
            Some(address) if owned.contains(&address) => spends_owned = true,
            Some(address) => {
                sender.get_or_insert(address);
            }
            None => {}
        }
    }

    let mut to_owned = 0u64;
    let mut to_foreign = 0u64;
    let mut recipient = None;
    for output in &tx.outputs {
        match address_of(output) {
            Some(address) if owned.contains(&address) => to_owned += output.satoshis,
            other => {
                to_foreign += output.satoshis;
                if let Some(address) = other {
                    recipient.get_or_insert(address);
                }
            }
        }
    }

    let (direction, amount, counterparty) = if spends_owned && to_foreign > 0 {
        (Direction::Sent, to_foreign, recipient)
    } else if spends_owned {
        (Direction::SelfTransfer, to_owned, None)
    } else if to_owned > 0 {
        (Direction::Received, to_owned, sender)
    } else {
        (Direction::Unknown, 0, None)
    };

    let all_known = !tx.is_coinbase() && prevouts.len() == tx.inputs.len() && prevouts.iter().all(Option::is_some);
    let fee = if all_known {
        let spent: u64 = prevouts.iter().flatten().map(|o| o.satoshis).sum();
        Some(spent.saturating_sub(tx.total_output_satoshis()))
    } else {
        None
    };

    ClassifiedTransaction {
        txid: tx.tx_id_hex(),
        direction,
        amount,
        counterparty,
        confirmations: confirmations(height, tip),
        fee,
        height,
    }
}

/// Mempool first, then newest block first, then txid.
fn newest_first(a: &ClassifiedTransaction, b: &ClassifiedTransaction) -> Ordering {
    a.is_confirmed()
        .cmp(&b.is_confirmed())
        .then_with(|| b.height.cmp(&a.height))
        .then_with(|| a.txid.cmp(&b.txid))
}

/// Fetches and classifies merchant transactions through an index.
#[derive(Clone)]
pub struct HistoryService {
    index: Arc<dyn IndexService>,
    store: Arc<dyn MerchantStore>,
    network: Network,
}

impl HistoryService {
    pub fn new(index: Arc<dyn IndexService>, store: Arc<dyn MerchantStore>, network: Network) -> Self {
        HistoryService { index, store, network }
    }

    async fn fetch(index: &dyn IndexService, txid: &str) -> Result<Transaction, SettlementError> {
        let raw = index.raw_transaction(txid).await?;
        Ok(Transaction::from_hex(&raw)?)
    }

    /// Fetch `txid` and the outputs it spends, then classify it.
    pub async fn classify_txid(
        &self,
        txid: &str,
        owned: &HashSet<String>,
        height: i64,
        tip: u64,
    ) -> Result<ClassifiedTransaction, SettlementError> {
        let tx = Self::fetch(self.index.as_ref(), txid).await?;

        let mut prevouts = vec![None; tx.inputs.len()];
        if !tx.is_coinbase() {
            let parents: HashSet<String> = tx.inputs.iter().map(|i| i.source_txid_hex()).collect();
            let mut fetches = JoinSet::new();
            for parent in parents {
                let index = self.index.clone();
                fetches.spawn(async move {
                    let tx = Self::fetch(index.as_ref(), &parent).await;
                    (parent, tx)
                });
            }
            let mut fetched = HashMap::new();
            while let Some(joined) = fetches.join_next().await {
                let (parent, tx) = joined.map_err(|e| SettlementError::ConnectionFailure(e.to_string()))?;
                match tx {
                    Ok(tx) => {
                        fetched.insert(parent, tx);
                    }
                    Err(SettlementError::NoServersAvailable(m)) => {
                        return Err(SettlementError::NoServersAvailable(m))
                    }
                    Err(e) => debug!(txid, parent = %parent, error = %e, "spent output unavailable"),
                }
            }
            for (slot, input) in prevouts.iter_mut().zip(&tx.inputs) {
                *slot = fetched
                    .get(&input.source_txid_hex())
                    .and_then(|parent| parent.outputs.get(input.source_tx_out_index as usize))
                    .cloned();
            }
        }

        Ok(classify(&tx, &prevouts, owned, self.network, height, tip))
    }

    /// Every transaction touching any address `merchant_id` owns, newest
    /// first and without duplicates.
    pub async fn merchant_history(&self, merchant_id: &str) -> Result<Vec<ClassifiedTransaction>, SettlementError> {
        let owned: HashSet<String> = self
            .store
            .owned_addresses(merchant_id)
            .await?
            .into_iter()
            .map(|a| a.address)
            .collect();

        let mut lookups = JoinSet::new();
        for address in &owned {
            let script_hash = address_to_script_hash(address)?;
            let index = self.index.clone();
            lookups.spawn(async move { index.history(&script_hash).await });
        }
        // txid -> height; BTreeMap keeps the classification order stable.
        let mut heights: BTreeMap<String, i64> = BTreeMap::new();
        while let Some(joined) = lookups.join_next().await {
            let entries = joined.map_err(|e| SettlementError::ConnectionFailure(e.to_string()))??;
            for entry in entries {
                heights
                    .entry(entry.tx_hash)
                    .and_modify(|h| *h = (*h).max(entry.height))
                    .or_insert(entry.height);
            }
        }

        let tip = self.index.chain_height().await?;
        let owned = Arc::new(owned);
        let mut classifications = JoinSet::new();
        for (txid, height) in heights {
            let service = self.clone();
            let owned = owned.clone();
            classifications.spawn(async move { service.classify_txid(&txid, &owned, height, tip).await });
        }
        let mut out = Vec::new();
        while let Some(joined) = classifications.join_next().await {
            out.push(joined.map_err(|e| SettlementError::ConnectionFailure(e.to_string()))??);
        }
        out.sort_by(newest_first);
        debug!(merchant = merchant_id, transactions = out.len(), "classified history");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use bsv_electrum::HistoryEntry;
    use bsv_primitives::hd::DerivationPath;
    use bsv_script::{Address, Script};
    use bsv_transaction::TransactionInput;

    use super::*;
    use crate::collaborators::OwnedAddress;
    use crate::memory::{MemoryIndex, MemoryMerchantStore};

    fn address(byte: u8) -> Address {
        Address::from_public_key_hash(&[byte; 20], Network::Mainnet)
    }

    fn output(to: &Address, sats: u64) -> TransactionOutput {
        TransactionOutput::new(sats, to.locking_script())
    }

    fn tx(inputs: &[([u8; 32], u32)], outputs: Vec<TransactionOutput>) -> Transaction {
        let mut tx = Transaction::new();
        for (txid, vout) in inputs {
            tx.add_input(TransactionInput::new(*txid, *vout));
        }
        for output in outputs {
            tx.add_output(output);
        }
        tx
    }

    fn owned(addresses: &[&Address]) -> HashSet<String> {
        addresses.iter().map(|a| a.address_string.clone()).collect()
    }

    #[test]
    fn test_confirmations() {
        assert_eq!(confirmations(0, 100), 0);
        assert_eq!(confirmations(-1, 100), 0);
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(95, 100), 6);
        assert_eq!(confirmations(101, 100), 0);
    }

    #[test]
    fn test_received() {
        let (me, payer) = (address(1), address(2));
        let t = tx(&[([9; 32], 0)], vec![output(&me, 5_000), output(&payer, 1_000)]);
        let prevouts = vec![Some(output(&payer, 6_300))];
        let c = classify(&t, &prevouts, &owned(&[&me]), Network::Mainnet, 10, 12);
        assert_eq!(c.direction, Direction::Received);
        assert_eq!(c.amount, 5_000);
        assert_eq!(c.counterparty.as_deref(), Some(payer.address_string.as_str()));
        assert_eq!(c.fee, Some(300));
        assert_eq!(c.confirmations, 3);
    }

    #[test]
    fn test_sent_with_change() {
        let (me, invoice, shop) = (address(1), address(3), address(4));
        let t = tx(
            &[([9; 32], 0), ([8; 32], 1)],
            vec![output(&shop, 600_000), output(&me, 99_626)],
        );
        let prevouts = vec![Some(output(&me, 500_000)), Some(output(&invoice, 200_000))];
        let c = classify(&t, &prevouts, &owned(&[&me, &invoice]), Network::Mainnet, 0, 50);
        assert_eq!(c.direction, Direction::Sent);
        assert_eq!(c.amount, 600_000);
        assert_eq!(c.counterparty.as_deref(), Some(shop.address_string.as_str()));
        assert_eq!(c.fee, Some(374));
        assert_eq!(c.confirmations, 0);
    }

    #[test]
    fn test_self_transfer_and_unknown() {
        let (me, invoice, stranger) = (address(1), address(3), address(5));
        let t = tx(&[([9; 32], 0)], vec![output(&me, 1_000)]);
        let c = classify(&t, &[Some(output(&invoice, 1_200))], &owned(&[&me, &invoice]), Network::Mainnet, 0, 0);
        assert_eq!(c.direction, Direction::SelfTransfer);
        assert_eq!(c.amount, 1_000);
        assert!(c.counterparty.is_none());

        let c = classify(&t, &[Some(output(&stranger, 1_200))], &owned(&[&invoice]), Network::Mainnet, 0, 0);
        assert_eq!(c.direction, Direction::Unknown);
    }

    #[test]
    fn test_unknown_prevout_leaves_fee_open() {
        let me = address(1);
        let t = tx(&[([9; 32], 0)], vec![output(&me, 1_000)]);
        let c = classify(&t, &[None], &owned(&[&me]), Network::Mainnet, 0, 0);
        assert_eq!(c.direction, Direction::Received);
        assert_eq!(c.fee, None);
        assert!(c.counterparty.is_none());
    }

    #[test]
    fn test_nonstandard_output_counts_as_foreign() {
        let me = address(1);
        let t = tx(&[([9; 32], 0)], vec![TransactionOutput::new(10, Script::from_bytes(&[0x6a]))]);
        let c = classify(&t, &[Some(output(&me, 20))], &owned(&[&me]), Network::Mainnet, 0, 0);
        assert_eq!(c.direction, Direction::Sent);
        assert_eq!(c.amount, 10);
        assert!(c.counterparty.is_none());
    }

    #[tokio::test]
    async fn test_merchant_history_merges_and_orders() {
        let (primary, invoice, payer) = (address(1), address(3), address(2));
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryMerchantStore::new());
        for (a, path) in [(&primary, "m/0/0"), (&invoice, "m/1/0")] {
            store.add_address(
                "m1",
                OwnedAddress {
                    address: a.address_string.clone(),
                    path: path.parse::<DerivationPath>().expect("path"),
                    invoice_id: None,
                },
            );
        }

        let funding = tx(&[([7; 32], 0)], vec![output(&payer, 900_000)]);
        let pay_invoice = tx(
            &[(*funding.tx_id().as_bytes(), 0)],
            vec![output(&invoice, 200_000), output(&payer, 699_000)],
        );
        let pay_primary = tx(
            &[(*funding.tx_id().as_bytes(), 0)],
            vec![output(&primary, 500_000), output(&payer, 399_500)],
        );
        for t in [&funding, &pay_invoice, &pay_primary] {
            index.add_transaction(t.tx_id_hex(), t.to_hex());
        }
        index.set_height(120);

        let entry = |t: &Transaction, height| HistoryEntry {
            tx_hash: t.tx_id_hex(),
            height,
            fee: None,
        };
        index.set_history(
            address_to_script_hash(&primary.address_string).expect("hash"),
            vec![entry(&pay_primary, 100)],
        );
        // The mempool entry is reported by both addresses' histories.
        index.set_history(
            address_to_script_hash(&invoice.address_string).expect("hash"),
            vec![entry(&pay_invoice, 0), entry(&pay_primary, 100)],
        );

        let service = HistoryService::new(index, store, Network::Mainnet);
        let history = service.merchant_history("m1").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].txid, pay_invoice.tx_id_hex());
        assert_eq!(history[0].confirmations, 0);
        assert_eq!(history[0].fee, Some(1_000));
        assert_eq!(history[1].txid, pay_primary.tx_id_hex());
        assert_eq!(history[1].direction, Direction::Received);
        assert_eq!(history[1].amount, 500_000);
        assert_eq!(history[1].confirmations, 21);
    }
}

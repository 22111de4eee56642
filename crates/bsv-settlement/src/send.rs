//! Outgoing payments from every address a merchant owns.

use std::collections::HashMap;
use std::sync::Arc;

use bsv_electrum::{ElectrumError, IndexService};
use bsv_primitives::ec::PrivateKey;
use bsv_script::{address_to_script_hash, Address};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::amount::MAX_SATOSHIS;
use crate::builder::{build_and_sign, select, Candidate, FeePolicy};
use crate::collaborators::Collaborators;
use crate::config::{FeeTier, WalletConfig};
use crate::keys::KeyDerivationEngine;
use crate::SettlementError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub merchant_id: String,
    pub destination: String,
    /// Satoshis to deliver; see [`crate::amount::parse_amount`].
    pub amount: u64,
    #[serde(default)]
    pub tier: FeeTier,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// As acknowledged by the network.
    pub txid: String,
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
    pub inputs: usize,
    pub raw_hex: String,
}

fn is_txid(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub struct SendService {
    index: Arc<dyn IndexService>,
    services: Collaborators,
    wallet: WalletConfig,
    engine: KeyDerivationEngine,
}

impl SendService {
    pub fn new(index: Arc<dyn IndexService>, services: Collaborators, wallet: WalletConfig) -> Self {
        let engine = KeyDerivationEngine::new(wallet.network);
        SendService {
            index,
            services,
            wallet,
            engine,
        }
    }

    /// Validate, select, sign and broadcast.
    ///
    /// Every stored address is re-derived from the seed first; any
    /// disagreement aborts before a single output is fetched.
    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SettlementError> {
        let destination = Address::from_string(&request.destination)?;
        if destination.network != self.wallet.network {
            return Err(SettlementError::InvalidAddress(format!(
                "{} is not a {:?} address",
                request.destination, self.wallet.network
            )));
        }
        if request.amount > MAX_SATOSHIS {
            return Err(SettlementError::InvalidAmount(format!(
                "{} sat exceeds the total supply",
                request.amount
            )));
        }
        if request.amount < self.wallet.dust_limit {
            return Err(SettlementError::DustAmount {
                amount: request.amount,
                dust_limit: self.wallet.dust_limit,
            });
        }

        let (primary, keys) = self.signing_keys(&request.merchant_id).await?;
        let candidates = self.gather(&keys).await?;
        debug!(
            merchant = %request.merchant_id,
            addresses = keys.len(),
            outputs = candidates.len(),
            "gathered spendable outputs"
        );

        let policy = FeePolicy {
            sat_per_byte: self.wallet.fee_rates.rate(request.tier),
            dust_limit: self.wallet.dust_limit,
            max_iterations: self.wallet.max_fee_iterations,
        };
        let selection = select(&candidates, request.amount, &policy)?;
        let tx = build_and_sign(&selection, &destination, &primary, &keys)?;
        let raw_hex = tx.to_hex();
        let local_txid = tx.tx_id_hex();

        let acknowledged = self.index.broadcast(&raw_hex).await.map_err(|e| match e {
            ElectrumError::NoServersAvailable => SettlementError::from(e),
            other => SettlementError::BroadcastFailure(other.to_string()),
        })?;
        let acknowledged = acknowledged.trim().to_ascii_lowercase();
        if !is_txid(&acknowledged) {
            return Err(SettlementError::BroadcastFailure(format!(
                "server answered {:?} instead of a txid",
                acknowledged
            )));
        }
        if acknowledged != local_txid {
            warn!(local = %local_txid, acknowledged = %acknowledged, "server acknowledged a different txid");
        }

        self.services.cache.invalidate_merchant(&request.merchant_id).await;
        self.services.cache.invalidate_chain_height().await;
        info!(
            merchant = %request.merchant_id,
            txid = %acknowledged,
            amount = request.amount,
            fee = selection.fee,
            inputs = selection.inputs.len(),
            "payment broadcast"
        );

        Ok(SendReceipt {
            txid: acknowledged,
            amount: request.amount,
            fee: selection.fee,
            change: selection.change,
            inputs: selection.inputs.len(),
            raw_hex,
        })
    }

    /// The primary address and a key for every owned address, each
    /// checked against what the store recorded.
    async fn signing_keys(
        &self,
        merchant_id: &str,
    ) -> Result<(Address, HashMap<String, PrivateKey>), SettlementError> {
        let store = &self.services.store;
        let wallet = store.wallet(merchant_id).await?;
        let seed = self.services.seeds.decrypt(&wallet.encrypted_seed)?;
        let base = match &wallet.base_path {
            Some(path) => path.clone(),
            None => self.wallet.base_path()?,
        };

        let primary = self.engine.derive_primary(&seed, &base)?;
        if let Some(stored) = &wallet.stored_address {
            self.engine.verify_stored(stored, &primary)?;
        }

        let mut keys = HashMap::new();
        for owned in store.owned_addresses(merchant_id).await? {
            let derived = self.engine.derive_path(&seed, &owned.path)?;
            self.engine.verify_stored(&owned.address, &derived)?;
            keys.insert(owned.address, derived.signing_key);
        }
        keys.insert(primary.address.address_string.clone(), primary.signing_key);
        Ok((primary.address, keys))
    }

    async fn gather(&self, keys: &HashMap<String, PrivateKey>) -> Result<Vec<Candidate>, SettlementError> {
        let mut lookups = JoinSet::new();
        for address in keys.keys() {
            let script_hash = address_to_script_hash(address)?;
            let index = self.index.clone();
            let address = address.clone();
            lookups.spawn(async move { (address, index.unspent(&script_hash).await) });
        }
        let mut candidates = Vec::new();
        while let Some(joined) = lookups.join_next().await {
            let (address, unspent) = joined.map_err(|e| SettlementError::ConnectionFailure(e.to_string()))?;
            candidates.extend(unspent?.into_iter().map(|u| Candidate {
                txid: u.tx_hash,
                vout: u.tx_pos,
                value: u.value,
                address: address.clone(),
            }));
        }
        Ok(candidates)
    }
}

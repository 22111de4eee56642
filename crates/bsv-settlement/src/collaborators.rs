//! Interfaces the settlement core consumes from the surrounding platform.
//!
//! Storage, seed encryption, caching and client push live elsewhere; the
//! core only sees these traits. [`crate::memory`] has in-process versions.

use std::sync::Arc;

use async_trait::async_trait;
use bsv_primitives::hd::DerivationPath;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::SettlementError;

/// A decrypted wallet seed. Wiped on drop.
pub type Seed = Zeroizing<Vec<u8>>;

/// What the store knows about a merchant's wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerchantWallet {
    pub merchant_id: String,
    pub encrypted_seed: Vec<u8>,
    /// Account path; `None` falls back to the configured default.
    pub base_path: Option<DerivationPath>,
    /// Primary address recorded when the wallet was created.
    pub stored_address: Option<String>,
}

/// An address a merchant owns, with the path its key lives at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedAddress {
    pub address: String,
    pub path: DerivationPath,
    /// Set for invoice addresses.
    pub invoice_id: Option<String>,
}

#[async_trait]
pub trait MerchantStore: Send + Sync {
    async fn wallet(&self, merchant_id: &str) -> Result<MerchantWallet, SettlementError>;

    /// Last persisted balance in satoshis.
    async fn balance(&self, merchant_id: &str) -> Result<i64, SettlementError>;

    async fn set_balance(&self, merchant_id: &str, balance: i64) -> Result<(), SettlementError>;

    /// The primary address plus every invoice address whose order may
    /// still hold unspent funds.
    async fn owned_addresses(&self, merchant_id: &str) -> Result<Vec<OwnedAddress>, SettlementError>;
}

pub trait SeedDecryptor: Send + Sync {
    fn decrypt(&self, encrypted: &[u8]) -> Result<Seed, SettlementError>;
}

/// Per-merchant invoice index source. Must never hand out an index twice,
/// even across failures; gaps are fine.
#[async_trait]
pub trait InvoiceCounter: Send + Sync {
    async fn next_index(&self, merchant_id: &str) -> Result<u32, SettlementError>;
}

#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn invalidate_merchant(&self, merchant_id: &str);

    async fn invalidate_chain_height(&self);
}

/// Pushes events toward the merchant's clients.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, merchant_id: &str, event: &str, payload: Value) -> Result<(), SettlementError>;
}

/// The platform services a settlement instance is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MerchantStore>,
    pub seeds: Arc<dyn SeedDecryptor>,
    pub counter: Arc<dyn InvoiceCounter>,
    pub cache: Arc<dyn BalanceCache>,
    pub notifier: Arc<dyn Notifier>,
}

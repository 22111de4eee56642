//! Merchant settlement on top of ElectrumX index servers.
//!
//! - [`monitor`]: script-hash subscriptions turned into balance updates
//! - [`keys`]: primary and invoice key derivation with stored-address checks
//! - [`builder`] and [`send`]: UTXO aggregation, fee convergence, signing
//!   and broadcast
//! - [`classify`]: per-merchant transaction history
//! - [`collaborators`]: what the surrounding platform must provide
//!
//! [`SettlementService`] wires them to one server pool.

pub mod amount;
pub mod builder;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod keys;
pub mod memory;
pub mod monitor;
pub mod notifier;
pub mod send;
pub mod service;

mod error;
pub use error::SettlementError;
pub use amount::{format_satoshis, parse_amount};
pub use classify::{ClassifiedTransaction, Direction, HistoryService};
pub use collaborators::{
    BalanceCache, Collaborators, InvoiceCounter, MerchantStore, MerchantWallet, Notifier, OwnedAddress,
    SeedDecryptor,
};
pub use config::{FeeRates, FeeTier, MonitorConfig, SettlementConfig, WalletConfig, WebhookConfig};
pub use keys::{DerivedKey, KeyDerivationEngine};
pub use monitor::{AddressMonitor, BalanceUpdate, StatusOutcome, BALANCE_UPDATE_EVENT};
pub use notifier::WebhookNotifier;
pub use send::{SendReceipt, SendRequest, SendService};
pub use service::{InvoiceAddress, SettlementService};

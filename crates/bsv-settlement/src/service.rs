//! One settlement instance: pool, monitor, sender and history sharing the
//! same index servers and collaborators.

use std::sync::Arc;

use bsv_electrum::{ConnectionManager, Connector, TcpConnector};
use bsv_primitives::hd::DerivationPath;
use tracing::info;

use crate::classify::{ClassifiedTransaction, HistoryService};
use crate::collaborators::{Collaborators, Seed};
use crate::config::SettlementConfig;
use crate::keys::KeyDerivationEngine;
use crate::monitor::AddressMonitor;
use crate::send::{SendReceipt, SendRequest, SendService};
use crate::SettlementError;

/// A newly issued invoice address. The caller records it with the order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceAddress {
    pub index: u32,
    pub address: String,
    pub path: DerivationPath,
}

pub struct SettlementService {
    config: SettlementConfig,
    pool: ConnectionManager,
    monitor: AddressMonitor,
    sender: SendService,
    history: HistoryService,
    engine: KeyDerivationEngine,
    services: Collaborators,
}

impl SettlementService {
    /// Connect to the configured servers over TCP/TLS and start monitoring.
    /// Must be called inside a Tokio runtime.
    pub fn start(config: SettlementConfig, services: Collaborators) -> Result<Self, SettlementError> {
        config.validate()?;
        let connector = Arc::new(TcpConnector::new(&config.pool)?);
        Self::with_connector(config, connector, services)
    }

    pub fn with_connector(
        config: SettlementConfig,
        connector: Arc<dyn Connector>,
        services: Collaborators,
    ) -> Result<Self, SettlementError> {
        config.validate()?;
        let pool = ConnectionManager::start(config.pool.clone(), connector)?;
        let index = Arc::new(pool.clone());
        let network = config.wallet.network;
        let monitor = AddressMonitor::start(
            config.monitor.clone(),
            network,
            index.clone(),
            index.clone(),
            services.clone(),
        );
        let sender = SendService::new(index.clone(), services.clone(), config.wallet.clone());
        let history = HistoryService::new(index, services.store.clone(), network);
        info!(network = ?network, servers = config.pool.servers.len(), "settlement service started");
        Ok(SettlementService {
            engine: KeyDerivationEngine::new(network),
            config,
            pool,
            monitor,
            sender,
            history,
            services,
        })
    }

    pub fn pool(&self) -> &ConnectionManager {
        &self.pool
    }

    pub fn monitor(&self) -> &AddressMonitor {
        &self.monitor
    }

    async fn seed_and_base(&self, merchant_id: &str) -> Result<(Seed, DerivationPath, Option<String>), SettlementError> {
        let wallet = self.services.store.wallet(merchant_id).await?;
        let seed = self.services.seeds.decrypt(&wallet.encrypted_seed)?;
        let base = match wallet.base_path {
            Some(path) => path,
            None => self.config.wallet.base_path()?,
        };
        Ok((seed, base, wallet.stored_address))
    }

    /// Subscribe the merchant's primary address and every owned address.
    /// Returns how many addresses are tracked for the merchant.
    pub async fn watch_merchant(&self, merchant_id: &str) -> Result<usize, SettlementError> {
        let (seed, base, stored) = self.seed_and_base(merchant_id).await?;
        let primary = self.engine.derive_primary(&seed, &base)?;
        if let Some(stored) = &stored {
            self.engine.verify_stored(stored, &primary)?;
        }
        self.monitor
            .subscribe(merchant_id, &primary.address.address_string)
            .await?;
        for owned in self.services.store.owned_addresses(merchant_id).await? {
            match &owned.invoice_id {
                Some(invoice_id) => self.monitor.subscribe_invoice(merchant_id, invoice_id, &owned.address).await?,
                None => self.monitor.subscribe(merchant_id, &owned.address).await?,
            };
        }
        Ok(self
            .monitor
            .subscriptions()
            .iter()
            .filter(|s| s.owner_id == merchant_id)
            .count())
    }

    /// Allocate the next invoice address for `merchant_id` and start
    /// watching it.
    pub async fn create_invoice_address(
        &self,
        merchant_id: &str,
        invoice_id: &str,
    ) -> Result<InvoiceAddress, SettlementError> {
        let (seed, base, _) = self.seed_and_base(merchant_id).await?;
        let allocated = self
            .engine
            .allocate_invoice(self.services.counter.as_ref(), merchant_id, &seed, &base)
            .await?;
        let address = allocated.key.address.address_string.clone();
        self.monitor
            .subscribe_invoice(merchant_id, invoice_id, &address)
            .await?;
        Ok(InvoiceAddress {
            index: allocated.index,
            address,
            path: allocated.key.path.clone(),
        })
    }

    /// Stop watching an invoice address whose order is closed.
    pub async fn expire_invoice_address(&self, address: &str) -> Result<bool, SettlementError> {
        self.monitor.unsubscribe(address).await
    }

    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SettlementError> {
        self.sender.send(request).await
    }

    pub async fn history(&self, merchant_id: &str) -> Result<Vec<ClassifiedTransaction>, SettlementError> {
        self.history.merchant_history(merchant_id).await
    }

    /// Stop the monitor, then close every server connection.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.pool.shutdown().await;
        info!("settlement service stopped");
    }
}

//! Address monitor: script-hash subscriptions held on one pool channel.
//!
//! The monitor borrows whichever pool member is live (best rank first)
//! and keeps every tracked script hash subscribed on it. A status push
//! whose token differs from the last one recorded triggers a recompute of
//! the owner's balance through the index; the same token twice is a no-op.
//!
//! Tokens are claimed under the registry lock before any I/O, so one
//! status is recomputed at most once however many times it is delivered.
//! Recomputes for the same owner are serialized by that owner's ledger
//! lock. If the channel closes every token is forgotten, and all
//! subscriptions are re-issued on the next live channel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use bsv_electrum::index::{parse_status_notification, subscribe_script_hash, unsubscribe_script_hash};
use bsv_electrum::{ChannelSource, IndexService, RpcChannel, Status};
use bsv_script::{address_to_script_hash, Network, ScriptHash};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::classify::{Direction, HistoryService};
use crate::collaborators::Collaborators;
use crate::config::MonitorConfig;
use crate::SettlementError;

/// Event name passed to the notifier after a recompute.
pub const BALANCE_UPDATE_EVENT: &str = "balance_update";

#[derive(Clone, Debug, PartialEq, Eq)]
enum StatusToken {
    Unknown,
    Known(Status),
}

#[derive(Clone, Debug)]
struct Subscription {
    owner_id: String,
    address: String,
    invoice_id: Option<String>,
    status: StatusToken,
}

/// A snapshot of one tracked address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub script_hash: ScriptHash,
    pub owner_id: String,
    pub address: String,
    pub invoice_id: Option<String>,
    /// `None` until a status has been observed.
    pub status: Option<Status>,
}

/// Payload of a [`BALANCE_UPDATE_EVENT`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BalanceUpdate {
    pub merchant_id: String,
    pub address: String,
    /// Growth not explained by the merchant's own sends.
    pub incoming: u64,
    /// Amount plus fee of sends first seen in this recompute.
    pub outgoing: u64,
    pub balance: i64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The token matched the recorded one.
    Unchanged,
    /// Nobody tracks this script hash.
    Untracked,
    Recomputed(BalanceUpdate),
}

/// What the owner's recomputes have already accounted for.
#[derive(Debug, Default)]
struct OwnerLedger {
    known_txids: HashSet<String>,
    /// Script hashes whose history has been read once.
    seeded: HashSet<ScriptHash>,
}

struct Claim {
    script_hash: ScriptHash,
    owner_id: String,
    address: String,
    invoice_id: Option<String>,
    status: Status,
}

struct Inner {
    config: MonitorConfig,
    channels: Arc<dyn ChannelSource>,
    index: Arc<dyn IndexService>,
    history: HistoryService,
    services: Collaborators,
    registry: StdMutex<HashMap<ScriptHash, Subscription>>,
    ledgers: StdMutex<HashMap<String, Arc<Mutex<OwnerLedger>>>>,
    active: StdMutex<Option<Arc<dyn RpcChannel>>>,
    shutdown: watch::Sender<bool>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

fn guard<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks merchant addresses and reports balance movement.
///
/// Cloning is cheap; clones share the same registry and supervisor.
#[derive(Clone)]
pub struct AddressMonitor {
    inner: Arc<Inner>,
}

impl AddressMonitor {
    /// Start the supervisor task. Must be called inside a Tokio runtime.
    pub fn start(
        config: MonitorConfig,
        network: Network,
        channels: Arc<dyn ChannelSource>,
        index: Arc<dyn IndexService>,
        services: Collaborators,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            history: HistoryService::new(index.clone(), services.store.clone(), network),
            channels,
            index,
            services,
            registry: StdMutex::new(HashMap::new()),
            ledgers: StdMutex::new(HashMap::new()),
            active: StdMutex::new(None),
            shutdown,
            supervisor: StdMutex::new(None),
        });
        let supervisor = tokio::spawn(supervise(inner.clone(), shutdown_rx));
        *guard(&inner.supervisor) = Some(supervisor);
        AddressMonitor { inner }
    }

    /// Track `address` for `owner_id`. Tracking an address twice only
    /// updates its owner. If a channel is live the current status is
    /// fetched and handled before returning.
    pub async fn subscribe(&self, owner_id: &str, address: &str) -> Result<ScriptHash, SettlementError> {
        self.track(owner_id, address, None).await
    }

    /// Track a freshly allocated invoice address.
    pub async fn subscribe_invoice(
        &self,
        owner_id: &str,
        invoice_id: &str,
        address: &str,
    ) -> Result<ScriptHash, SettlementError> {
        self.track(owner_id, address, Some(invoice_id.to_string())).await
    }

    async fn track(
        &self,
        owner_id: &str,
        address: &str,
        invoice_id: Option<String>,
    ) -> Result<ScriptHash, SettlementError> {
        let script_hash = address_to_script_hash(address)?;
        {
            let mut registry = guard(&self.inner.registry);
            match registry.get_mut(&script_hash) {
                Some(existing) => {
                    existing.owner_id = owner_id.to_string();
                    if invoice_id.is_some() {
                        existing.invoice_id = invoice_id;
                    }
                }
                None => {
                    registry.insert(
                        script_hash,
                        Subscription {
                            owner_id: owner_id.to_string(),
                            address: address.to_string(),
                            invoice_id,
                            status: StatusToken::Unknown,
                        },
                    );
                }
            }
        }
        info!(owner = owner_id, address, script_hash = %script_hash, "tracking address");

        if let Some(channel) = self.inner.active_channel() {
            self.inner.refresh(&channel, script_hash).await;
        }
        Ok(script_hash)
    }

    /// Stop tracking `address`. Returns whether it was tracked.
    pub async fn unsubscribe(&self, address: &str) -> Result<bool, SettlementError> {
        let script_hash = address_to_script_hash(address)?;
        let removed = guard(&self.inner.registry).remove(&script_hash).is_some();
        if !removed {
            return Ok(false);
        }
        info!(address, "no longer tracking address");
        if let Some(channel) = self.inner.active_channel() {
            let call = unsubscribe_script_hash(channel.as_ref(), &script_hash);
            match timeout(self.inner.config.request_timeout, call).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(address, error = %e, "server-side unsubscribe failed"),
                Err(_) => debug!(address, "server-side unsubscribe timed out"),
            }
        }
        Ok(true)
    }

    /// Forget the recorded status of `address` and fetch it again. Returns
    /// `None` when no channel is live; the next one picks it up. An address
    /// nobody tracks yields `Untracked`.
    pub async fn resync(&self, address: &str) -> Result<Option<StatusOutcome>, SettlementError> {
        let script_hash = address_to_script_hash(address)?;
        {
            let mut registry = guard(&self.inner.registry);
            let Some(subscription) = registry.get_mut(&script_hash) else {
                return Ok(Some(StatusOutcome::Untracked));
            };
            subscription.status = StatusToken::Unknown;
        }
        let Some(channel) = self.inner.active_channel() else {
            return Ok(None);
        };
        let status = self.inner.request_status(&channel, &script_hash).await?;
        self.inner.handle_status(script_hash, status).await.map(Some)
    }

    /// Apply a status for `script_hash` as if the server had pushed it.
    pub async fn handle_status(
        &self,
        script_hash: ScriptHash,
        status: Status,
    ) -> Result<StatusOutcome, SettlementError> {
        self.inner.handle_status(script_hash, status).await
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let registry = guard(&self.inner.registry);
        let mut out: Vec<SubscriptionInfo> = registry
            .iter()
            .map(|(script_hash, s)| SubscriptionInfo {
                script_hash: *script_hash,
                owner_id: s.owner_id.clone(),
                address: s.address.clone(),
                invoice_id: s.invoice_id.clone(),
                status: match &s.status {
                    StatusToken::Unknown => None,
                    StatusToken::Known(status) => Some(status.clone()),
                },
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    /// Server id of the channel subscriptions are held on.
    pub fn channel_server(&self) -> Option<String> {
        self.inner.active_channel().map(|c| c.server_id().to_string())
    }

    /// Stop the supervisor and wait for it to exit. Subscriptions stay in
    /// the registry.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = guard(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor supervisor ended abnormally");
            }
        }
        *guard(&self.inner.active) = None;
        info!("address monitor stopped");
    }
}

impl Inner {
    fn active_channel(&self) -> Option<Arc<dyn RpcChannel>> {
        guard(&self.active).clone().filter(|c| !c.is_closed())
    }

    fn ledger(&self, owner_id: &str) -> Arc<Mutex<OwnerLedger>> {
        guard(&self.ledgers).entry(owner_id.to_string()).or_default().clone()
    }

    async fn request_status(
        &self,
        channel: &Arc<dyn RpcChannel>,
        script_hash: &ScriptHash,
    ) -> Result<Status, SettlementError> {
        match timeout(self.config.request_timeout, subscribe_script_hash(channel.as_ref(), script_hash)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SettlementError::ConnectionFailure(format!(
                "subscribe on {} timed out",
                channel.server_id()
            ))),
        }
    }

    /// Subscribe on `channel` and handle the returned status. Failures are
    /// logged; the next push or reconnect retries.
    async fn refresh(&self, channel: &Arc<dyn RpcChannel>, script_hash: ScriptHash) {
        let result = match self.request_status(channel, &script_hash).await {
            Ok(status) => self.handle_status(script_hash, status).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(script_hash = %script_hash, error = %e, "status refresh failed");
        }
    }

    async fn handle_status(&self, script_hash: ScriptHash, status: Status) -> Result<StatusOutcome, SettlementError> {
        match self.claim(script_hash, status) {
            Ok(claim) => self.recompute(claim).await.map(StatusOutcome::Recomputed),
            Err(outcome) => Ok(outcome),
        }
    }

    /// Record `status` as observed, unless it already is.
    fn claim(&self, script_hash: ScriptHash, status: Status) -> Result<Claim, StatusOutcome> {
        let mut registry = guard(&self.registry);
        let Some(subscription) = registry.get_mut(&script_hash) else {
            return Err(StatusOutcome::Untracked);
        };
        let token = StatusToken::Known(status.clone());
        if subscription.status == token {
            return Err(StatusOutcome::Unchanged);
        }
        subscription.status = token;
        Ok(Claim {
            script_hash,
            owner_id: subscription.owner_id.clone(),
            address: subscription.address.clone(),
            invoice_id: subscription.invoice_id.clone(),
            status,
        })
    }

    /// Put the token back to unknown if it is still the one `claim` set.
    fn release(&self, claim: &Claim) {
        let mut registry = guard(&self.registry);
        if let Some(subscription) = registry.get_mut(&claim.script_hash) {
            if subscription.status == StatusToken::Known(claim.status.clone()) {
                subscription.status = StatusToken::Unknown;
            }
        }
    }

    fn forget_statuses(&self) {
        for subscription in guard(&self.registry).values_mut() {
            subscription.status = StatusToken::Unknown;
        }
    }

    fn tracked_for(&self, owner_id: &str) -> Vec<String> {
        guard(&self.registry)
            .values()
            .filter(|s| s.owner_id == owner_id)
            .map(|s| s.address.clone())
            .collect()
    }

    async fn recompute(&self, claim: Claim) -> Result<BalanceUpdate, SettlementError> {
        let result = self.recompute_owner(&claim).await;
        if let Err(e) = &result {
            warn!(
                owner = %claim.owner_id,
                address = %claim.address,
                error = %e,
                "balance recompute failed; status will be re-checked"
            );
            self.release(&claim);
        }
        result
    }

    async fn recompute_owner(&self, claim: &Claim) -> Result<BalanceUpdate, SettlementError> {
        let ledger = self.ledger(&claim.owner_id);
        let mut ledger = ledger.lock().await;
        let store = &self.services.store;

        let mut addresses: BTreeSet<String> = store
            .owned_addresses(&claim.owner_id)
            .await?
            .into_iter()
            .map(|a| a.address)
            .collect();
        addresses.extend(self.tracked_for(&claim.owner_id));

        let current = self.total_balance(&addresses).await?;
        let stored = store.balance(&claim.owner_id).await?;
        let delta = current - stored;

        let history = self.index.history(&claim.script_hash).await?;
        let fresh: Vec<_> = history
            .into_iter()
            .filter(|entry| !ledger.known_txids.contains(&entry.tx_hash))
            .collect();

        let mut outgoing = 0u64;
        if ledger.seeded.contains(&claim.script_hash) {
            let owned: HashSet<String> = addresses.iter().cloned().collect();
            for entry in &fresh {
                let classified = self
                    .history
                    .classify_txid(&entry.tx_hash, &owned, entry.height, 0)
                    .await?;
                if classified.direction == Direction::Sent {
                    outgoing += classified.amount + classified.fee.unwrap_or(0);
                }
            }
        }
        let incoming = (delta + outgoing as i64).max(0) as u64;

        if current != stored {
            store.set_balance(&claim.owner_id, current).await?;
        }
        ledger.seeded.insert(claim.script_hash);
        ledger.known_txids.extend(fresh.into_iter().map(|e| e.tx_hash));
        drop(ledger);

        self.services.cache.invalidate_merchant(&claim.owner_id).await;

        let update = BalanceUpdate {
            merchant_id: claim.owner_id.clone(),
            address: claim.address.clone(),
            incoming,
            outgoing,
            balance: current,
            status: claim.status.clone(),
            invoice_id: claim.invoice_id.clone(),
        };
        info!(
            owner = %update.merchant_id,
            address = %update.address,
            incoming,
            outgoing,
            balance = current,
            "balance recomputed"
        );
        let mut payload = json!({
            "merchant_id": update.merchant_id,
            "address": update.address,
            "incoming": update.incoming,
            "outgoing": update.outgoing,
            "balance": update.balance,
            "status": update.status,
        });
        if let Some(invoice_id) = &update.invoice_id {
            payload["invoice_id"] = json!(invoice_id);
        }
        if let Err(e) = self
            .services
            .notifier
            .notify(&claim.owner_id, BALANCE_UPDATE_EVENT, payload)
            .await
        {
            warn!(owner = %claim.owner_id, error = %e, "balance notification not delivered");
        }
        Ok(update)
    }

    async fn total_balance(&self, addresses: &BTreeSet<String>) -> Result<i64, SettlementError> {
        let mut lookups = JoinSet::new();
        for address in addresses {
            let script_hash = address_to_script_hash(address)?;
            let index = self.index.clone();
            lookups.spawn(async move { index.balance(&script_hash).await });
        }
        let mut total = 0i64;
        while let Some(joined) = lookups.join_next().await {
            let balance = joined.map_err(|e| SettlementError::ConnectionFailure(e.to_string()))??;
            total += balance.total();
        }
        Ok(total)
    }
}

/// Re-issue every tracked subscription on `channel`.
async fn resubscribe_all(inner: &Arc<Inner>, channel: &Arc<dyn RpcChannel>) {
    let tracked: Vec<ScriptHash> = guard(&inner.registry).keys().copied().collect();
    debug!(server = channel.server_id(), count = tracked.len(), "re-issuing subscriptions");
    let mut refreshes = JoinSet::new();
    for script_hash in tracked {
        let inner = inner.clone();
        let channel = channel.clone();
        refreshes.spawn(async move { inner.refresh(&channel, script_hash).await });
    }
    while refreshes.join_next().await.is_some() {}
}

/// Hold a channel, dispatch its pushes, and move to another pool member
/// when it closes.
async fn supervise(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let found = tokio::select! {
            _ = shutdown.changed() => return,
            found = inner.channels.wait_for_channel(inner.config.reconnect_delay) => found,
        };
        let Some(channel) = found else {
            debug!("no live index server for subscriptions yet");
            continue;
        };

        info!(server = channel.server_id(), "holding subscriptions on server");
        let mut notifications = channel.notifications();
        let mut closed = channel.closed();
        if channel.is_closed() {
            continue;
        }
        *guard(&inner.active) = Some(channel.clone());
        let mut resubscribe = tokio::spawn({
            let inner = inner.clone();
            let channel = channel.clone();
            async move { resubscribe_all(&inner, &channel).await }
        });

        let stopping = loop {
            tokio::select! {
                _ = shutdown.changed() => break true,
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break false;
                    }
                }
                received = notifications.recv() => match received {
                    Ok(notification) => {
                        let Some((script_hash, status)) = parse_status_notification(&notification) else {
                            continue;
                        };
                        // Claim in arrival order; recompute off the loop.
                        if let Ok(claim) = inner.claim(script_hash, status) {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                let _ = inner.recompute(claim).await;
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "status pushes dropped; re-checking every address");
                        inner.forget_statuses();
                        resubscribe.abort();
                        resubscribe = tokio::spawn({
                            let inner = inner.clone();
                            let channel = channel.clone();
                            async move { resubscribe_all(&inner, &channel).await }
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break false,
                },
            }
        };

        resubscribe.abort();
        *guard(&inner.active) = None;
        inner.forget_statuses();
        if stopping {
            return;
        }
        warn!(
            server = channel.server_id(),
            retry_in = ?inner.config.reconnect_delay,
            "subscription channel lost"
        );
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(inner.config.reconnect_delay) => {}
        }
    }
}

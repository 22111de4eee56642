//! The server pool: one connection record per configured index server.
//!
//! Every server moves through `Disconnected -> Connecting -> Connected`.
//! A failed attempt or a dropped connection returns it to `Disconnected`
//! and arms that server's own reconnect timer. A slower sweep retries any
//! server left disconnected without a timer and pings live ones so idle
//! sockets are noticed.
//!
//! Requests are raced: the same call goes to every live server at once and
//! the first success wins. Records are guarded one mutex each, so connect,
//! close and sweep paths never interleave on the same server.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, ServerEndpoint};
use crate::connection::{Connector, RpcChannel};
use crate::protocol::{METHOD_PING, METHOD_VERSION};
use crate::ElectrumError;

/// Lifecycle state of one server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Mutable per-server bookkeeping, only touched under its slot's lock.
pub struct ConnectionRecord {
    pub server_id: String,
    pub channel: Option<Arc<dyn RpcChannel>>,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    retry: Option<JoinHandle<()>>,
}

impl ConnectionRecord {
    fn has_pending_retry(&self) -> bool {
        self.retry.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// A point-in-time view of one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerStatus {
    pub server_id: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

struct Slot {
    endpoint: ServerEndpoint,
    record: Mutex<ConnectionRecord>,
}

struct Inner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    slots: Vec<Arc<Slot>>,
    shutting_down: AtomicBool,
    /// Bumped whenever a server becomes live.
    live_generation: watch::Sender<u64>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

/// Owns a connection to every configured server and races requests
/// across the live ones.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

impl ConnectionManager {
    /// Validate `config`, start connecting to every server concurrently,
    /// and return without waiting for any of them.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Self, ElectrumError> {
        config.validate()?;
        let slots = config
            .ranked_servers()
            .into_iter()
            .map(|endpoint| {
                Arc::new(Slot {
                    record: Mutex::new(ConnectionRecord {
                        server_id: endpoint.server_id(),
                        channel: None,
                        state: ConnectionState::Disconnected,
                        last_error: None,
                        retry: None,
                    }),
                    endpoint,
                })
            })
            .collect();
        let (live_generation, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            config,
            connector,
            slots,
            shutting_down: AtomicBool::new(false),
            live_generation,
            sweeper: StdMutex::new(None),
        });

        info!(servers = inner.slots.len(), "starting index server pool");
        for slot in &inner.slots {
            tokio::spawn(connect_slot(inner.clone(), slot.clone()));
        }
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);

        Ok(ConnectionManager { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Live channels, best rank first.
    pub async fn live_channels(&self) -> Vec<Arc<dyn RpcChannel>> {
        let mut live = Vec::new();
        for slot in &self.inner.slots {
            let record = slot.record.lock().await;
            if let Some(channel) = &record.channel {
                if record.state == ConnectionState::Connected && !channel.is_closed() {
                    live.push(channel.clone());
                }
            }
        }
        live
    }

    pub async fn live_count(&self) -> usize {
        self.live_channels().await.len()
    }

    /// The best-ranked live channel, for holding subscriptions.
    pub async fn primary_channel(&self) -> Option<Arc<dyn RpcChannel>> {
        self.live_channels().await.into_iter().next()
    }

    /// Wait up to `limit` for any server to become live.
    pub async fn wait_for_live(&self, limit: Duration) -> Option<Arc<dyn RpcChannel>> {
        let mut generation = self.inner.live_generation.subscribe();
        let wait = async {
            loop {
                if let Some(channel) = self.primary_channel().await {
                    return Some(channel);
                }
                if generation.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout(limit, wait).await.ok().flatten()
    }

    /// Snapshot of every record, in rank order.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let mut out = Vec::with_capacity(self.inner.slots.len());
        for slot in &self.inner.slots {
            let record = slot.record.lock().await;
            out.push(ServerStatus {
                server_id: record.server_id.clone(),
                state: record.state,
                last_error: record.last_error.clone(),
            });
        }
        out
    }

    /// Send `method(params)` to every live server and return the first
    /// successful result.
    ///
    /// Each server's answer is bounded by `request_timeout`. With no live
    /// server the call waits once for up to `startup_grace` before failing
    /// with `NoServersAvailable`. If every server fails, the error carries
    /// the first failure observed.
    pub async fn race(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        let mut live = self.live_channels().await;
        if live.is_empty() {
            debug!(method, "no live servers, waiting for one");
            if self.wait_for_live(self.inner.config.startup_grace).await.is_some() {
                live = self.live_channels().await;
            }
            if live.is_empty() {
                warn!(method, "no index servers available");
                return Err(ElectrumError::NoServersAvailable);
            }
        }

        let per_request = self.inner.config.request_timeout;
        let attempts = live.len();
        let mut set = JoinSet::new();
        for channel in live {
            let method = method.to_string();
            let params = params.clone();
            set.spawn(async move {
                let server = channel.server_id().to_string();
                let outcome = match timeout(per_request, channel.call(&method, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(ElectrumError::Timeout {
                        operation: format!("{} on {}", method, server),
                        after: per_request,
                    }),
                };
                (server, outcome)
            });
        }

        let mut first_error: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((server, Ok(value))) => {
                    set.abort_all();
                    debug!(method, server = %server, "race won");
                    return Ok(value);
                }
                Ok((server, Err(e))) => {
                    debug!(method, server = %server, error = %e, "race attempt failed");
                    first_error.get_or_insert_with(|| format!("{}: {}", server, e));
                }
                Err(e) => {
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        let first = first_error.unwrap_or_default();
        warn!(method, attempts, first = %first, "all servers failed");
        Err(ElectrumError::AllServersFailed { attempts, first })
    }

    /// Stop timers, suppress reconnects and close every channel.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down index server pool");
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        for slot in &self.inner.slots {
            let channel = {
                let mut record = slot.record.lock().await;
                if let Some(retry) = record.retry.take() {
                    retry.abort();
                }
                record.state = ConnectionState::Disconnected;
                record.channel.take()
            };
            if let Some(channel) = channel {
                channel.close().await;
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

/// Where a long-lived subscriber gets its channel from.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// The best live channel right now, if any.
    async fn current_channel(&self) -> Option<Arc<dyn RpcChannel>>;

    /// Wait up to `limit` for a live channel.
    async fn wait_for_channel(&self, limit: Duration) -> Option<Arc<dyn RpcChannel>>;
}

#[async_trait]
impl ChannelSource for ConnectionManager {
    async fn current_channel(&self) -> Option<Arc<dyn RpcChannel>> {
        self.primary_channel().await
    }

    async fn wait_for_channel(&self, limit: Duration) -> Option<Arc<dyn RpcChannel>> {
        self.wait_for_live(limit).await
    }
}

/// One connect attempt for `slot`: open, handshake, and on failure arm the
/// slot's reconnect timer.
fn connect_slot(inner: Arc<Inner>, slot: Arc<Slot>) -> BoxFuture {
    Box::pin(async move {
        {
            let mut record = slot.record.lock().await;
            if inner.shutting_down.load(Ordering::SeqCst)
                || record.state != ConnectionState::Disconnected
            {
                return;
            }
            record.state = ConnectionState::Connecting;
        }

        let server_id = slot.endpoint.server_id();
        debug!(server = %server_id, "connecting");
        let attempt = timeout(inner.config.connect_timeout, open_and_handshake(&inner, &slot.endpoint)).await;
        let outcome = match attempt {
            Ok(result) => result,
            Err(_) => Err(ElectrumError::Timeout {
                operation: format!("connect to {}", server_id),
                after: inner.config.connect_timeout,
            }),
        };

        let mut record = slot.record.lock().await;
        match outcome {
            Ok(channel) if !inner.shutting_down.load(Ordering::SeqCst) => {
                info!(server = %server_id, "connected");
                record.state = ConnectionState::Connected;
                record.last_error = None;
                record.channel = Some(channel.clone());
                drop(record);
                tokio::spawn(watch_close(inner.clone(), slot.clone(), channel));
                inner.live_generation.send_modify(|g| *g += 1);
            }
            Ok(channel) => {
                record.state = ConnectionState::Disconnected;
                drop(record);
                channel.close().await;
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "connect failed");
                record.state = ConnectionState::Disconnected;
                record.last_error = Some(e.to_string());
                schedule_reconnect(&inner, &slot, &mut record);
            }
        }
    })
}

async fn open_and_handshake(
    inner: &Inner,
    endpoint: &ServerEndpoint,
) -> Result<Arc<dyn RpcChannel>, ElectrumError> {
    let channel = inner.connector.connect(endpoint).await?;
    let params = json!([inner.config.client_name, inner.config.protocol_version]);
    match channel.call(METHOD_VERSION, params).await {
        Ok(version) => {
            debug!(server = %endpoint, version = %version, "handshake complete");
            Ok(channel)
        }
        Err(e) => {
            channel.close().await;
            Err(ElectrumError::Handshake {
                server: endpoint.server_id(),
                message: e.to_string(),
            })
        }
    }
}

/// Arm the slot's own retry timer unless one is already pending.
fn schedule_reconnect(inner: &Arc<Inner>, slot: &Arc<Slot>, record: &mut ConnectionRecord) {
    if inner.shutting_down.load(Ordering::SeqCst) || record.has_pending_retry() {
        return;
    }
    let delay = inner.config.reconnect_delay;
    debug!(server = %record.server_id, ?delay, "scheduling reconnect");
    let (inner, slot) = (inner.clone(), slot.clone());
    record.retry = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // Clear our own handle first so the attempt may re-arm the timer.
        slot.record.lock().await.retry = None;
        connect_slot(inner, slot).await;
    }));
}

/// Mark the slot disconnected when its channel closes, unless the channel
/// was already replaced or the pool is shutting down.
async fn watch_close(inner: Arc<Inner>, slot: Arc<Slot>, channel: Arc<dyn RpcChannel>) {
    let mut closed = channel.closed();
    if closed.wait_for(|c| *c).await.is_err() {
        debug!(server = %channel.server_id(), "close watch dropped");
    }
    let mut record = slot.record.lock().await;
    let current = record
        .channel
        .as_ref()
        .is_some_and(|c| Arc::ptr_eq(c, &channel));
    if !current {
        return;
    }
    record.channel = None;
    record.state = ConnectionState::Disconnected;
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    warn!(server = %record.server_id, "connection lost");
    record.last_error = Some("connection closed".to_string());
    schedule_reconnect(&inner, &slot, &mut record);
}

async fn sweep_loop(inner: std::sync::Weak<Inner>) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = inner.upgrade() else { return };
        if pool.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        sweep_once(&pool).await;
    }
}

async fn sweep_once(inner: &Arc<Inner>) {
    for slot in &inner.slots {
        let (idle, live) = {
            let record = slot.record.lock().await;
            let idle = record.state == ConnectionState::Disconnected && !record.has_pending_retry();
            (idle, record.channel.clone())
        };
        if idle {
            debug!(server = %slot.endpoint, "sweep retrying server");
            tokio::spawn(connect_slot(inner.clone(), slot.clone()));
        } else if let Some(channel) = live {
            let ping = timeout(inner.config.request_timeout, channel.call(METHOD_PING, json!([]))).await;
            if !matches!(ping, Ok(Ok(_))) {
                warn!(server = %slot.endpoint, "keepalive failed, dropping connection");
                channel.close().await;
            }
        }
    }
}

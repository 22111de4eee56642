//! ElectrumX client pool for SPV index servers.
//!
//! A [`ConnectionManager`] keeps a connection to every configured server,
//! reconnects them independently, and races each request across the live
//! ones. [`IndexService`] wraps the raced calls in typed queries, and the
//! free functions in [`index`] handle script-hash subscriptions on a single
//! held channel.

pub mod config;
pub mod protocol;
pub mod connection;
pub mod pool;
pub mod index;

mod error;
pub use error::ElectrumError;
pub use config::{PoolConfig, ServerEndpoint, Transport};
pub use connection::{Connector, ElectrumConnection, RpcChannel, TcpConnector};
pub use pool::{ChannelSource, ConnectionManager, ConnectionRecord, ConnectionState, ServerStatus};
pub use index::{Balance, HeaderTip, HistoryEntry, IndexService, Status, UnspentOutput};
pub use protocol::Notification;

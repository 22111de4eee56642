//! Server endpoints and pool tuning.
//!
//! Durations are written in whole seconds in TOML:
//!
//! ```toml
//! client_name = "merchant-settlement"
//! connect_timeout = 10
//!
//! [[servers]]
//! host = "electrumx.example.com"
//! port = 50002
//! transport = "tls"
//! rank = 0
//! ```

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ElectrumError;

/// How a server is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP, newline-delimited JSON.
    Tcp,
    /// TLS over TCP.
    #[default]
    Tls,
}

/// A configured index server. Lower `rank` is preferred.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub rank: u32,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport, rank: u32) -> Self {
        ServerEndpoint {
            host: host.into(),
            port,
            transport,
            rank,
        }
    }

    /// `host:port`, the key every connection record is filed under.
    pub fn server_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub servers: Vec<ServerEndpoint>,
    /// Sent as the first `server.version` parameter.
    pub client_name: String,
    /// Protocol version requested in the handshake.
    pub protocol_version: String,
    /// Bound on opening a transport plus the handshake.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Bound on each server's answer to a raced request.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Per-server backoff after a failed connect or a dropped connection.
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    /// Period of the sweep that retries servers with no pending timer.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// How long a request waits once for a first server when none is live.
    #[serde(with = "duration_secs")]
    pub startup_grace: Duration,
    /// Capacity of each connection's notification broadcast channel.
    pub notification_buffer: usize,
    /// Accept self-signed TLS certificates, common on ElectrumX servers.
    pub accept_invalid_certs: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            servers: Vec::new(),
            client_name: "bsv-merchant".to_string(),
            protocol_version: "1.4".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            startup_grace: Duration::from_secs(3),
            notification_buffer: 256,
            accept_invalid_certs: false,
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), ElectrumError> {
        if self.servers.is_empty() {
            return Err(ElectrumError::Config("no servers configured".into()));
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(ElectrumError::Config("server with empty host".into()));
            }
            if !seen.insert(server.server_id()) {
                return Err(ElectrumError::Config(format!(
                    "duplicate server {}",
                    server.server_id()
                )));
            }
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("reconnect_delay", self.reconnect_delay),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ElectrumError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.notification_buffer == 0 {
            return Err(ElectrumError::Config("notification_buffer must be non-zero".into()));
        }
        Ok(())
    }

    /// Servers in preference order; ties keep their configured order.
    pub fn ranked_servers(&self) -> Vec<ServerEndpoint> {
        let mut servers = self.servers.clone();
        servers.sort_by_key(|s| s.rank);
        servers
    }
}

/// Serde adapter for `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, rank: u32) -> ServerEndpoint {
        ServerEndpoint::new(host, port, Transport::Tcp, rank)
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.protocol_version, "1.4");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_toml() {
        let config: PoolConfig = toml::from_str(
            r#"
            connect_timeout = 4
            [[servers]]
            host = "a.example"
            port = 50002
            [[servers]]
            host = "b.example"
            port = 50001
            transport = "tcp"
            rank = 1
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.connect_timeout, Duration::from_secs(4));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.servers[0].transport, Transport::Tls);
        assert_eq!(config.servers[1].transport, Transport::Tcp);
        assert_eq!(config.servers[1].server_id(), "b.example:50001");
        config.validate().expect("valid");
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(PoolConfig::default().validate().is_err());

        let dup = PoolConfig {
            servers: vec![endpoint("a", 1, 0), endpoint("a", 1, 1)],
            ..PoolConfig::default()
        };
        assert!(matches!(dup.validate(), Err(ElectrumError::Config(m)) if m.contains("duplicate")));

        let zero = PoolConfig {
            servers: vec![endpoint("a", 1, 0)],
            request_timeout: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_ranked_servers_is_stable() {
        let config = PoolConfig {
            servers: vec![endpoint("c", 1, 2), endpoint("a", 1, 0), endpoint("b", 1, 0)],
            ..PoolConfig::default()
        };
        let hosts: Vec<_> = config.ranked_servers().into_iter().map(|s| s.host).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }
}

//! Settlement configuration, loadable from TOML.
//!
//! ```toml
//! [pool]
//! client_name = "merchant-settlement"
//! [[pool.servers]]
//! host = "electrumx.example.com"
//! port = 50002
//!
//! [wallet]
//! network = "mainnet"
//! base_path = "m/44'/236'/0'"
//! dust_limit = 546
//! [wallet.fee_rates]
//! low = 1
//! medium = 2
//! high = 5
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use bsv_electrum::config::duration_secs;
use bsv_electrum::PoolConfig;
use bsv_primitives::hd::DerivationPath;
use bsv_script::Network;
use serde::{Deserialize, Serialize};

use crate::SettlementError;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub wallet: WalletConfig,
    pub webhook: Option<WebhookConfig>,
}

impl SettlementConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, SettlementError> {
        let config: SettlementConfig =
            toml::from_str(s).map_err(|e| SettlementError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettlementError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SettlementError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SettlementError> {
        self.pool
            .validate()
            .map_err(|e| SettlementError::Config(e.to_string()))?;
        self.monitor.validate()?;
        self.wallet.validate()?;
        if let Some(webhook) = &self.webhook {
            webhook.validate()?;
        }
        Ok(())
    }
}

/// Address monitor tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Pause before looking for a new subscription channel after one closes.
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    /// Bound on each subscribe/unsubscribe call on the held channel.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            reconnect_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), SettlementError> {
        if self.reconnect_delay.is_zero() || self.request_timeout.is_zero() {
            return Err(SettlementError::Config("monitor timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Fee tier chosen by the caller of a send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    #[default]
    Low,
    Medium,
    High,
}

impl FromStr for FeeTier {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(FeeTier::Low),
            "medium" => Ok(FeeTier::Medium),
            "high" => Ok(FeeTier::High),
            other => Err(SettlementError::Config(format!("unknown fee tier {:?}", other))),
        }
    }
}

/// Satoshis per byte for each tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl Default for FeeRates {
    fn default() -> Self {
        FeeRates {
            low: 1,
            medium: 2,
            high: 5,
        }
    }
}

impl FeeRates {
    pub fn rate(&self, tier: FeeTier) -> u64 {
        match tier {
            FeeTier::Low => self.low,
            FeeTier::Medium => self.medium,
            FeeTier::High => self.high,
        }
    }
}

/// Key derivation and transaction building parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: Network,
    /// Used for merchants whose record carries no path of its own.
    pub base_path: String,
    pub fee_rates: FeeRates,
    /// Smallest output value the network relays.
    pub dust_limit: u64,
    pub max_fee_iterations: usize,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            network: Network::Mainnet,
            base_path: "m/44'/236'/0'".to_string(),
            fee_rates: FeeRates::default(),
            dust_limit: 546,
            max_fee_iterations: 3,
        }
    }
}

impl WalletConfig {
    pub fn base_path(&self) -> Result<DerivationPath, SettlementError> {
        self.base_path
            .parse()
            .map_err(|e| SettlementError::Config(format!("base_path {:?}: {}", self.base_path, e)))
    }

    fn validate(&self) -> Result<(), SettlementError> {
        self.base_path()?;
        let r = &self.fee_rates;
        if r.low == 0 || r.low > r.medium || r.medium > r.high {
            return Err(SettlementError::Config(format!(
                "fee rates must be non-zero and non-decreasing, got {}/{}/{}",
                r.low, r.medium, r.high
            )));
        }
        if self.max_fee_iterations == 0 {
            return Err(SettlementError::Config("max_fee_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where balance events are POSTed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_webhook_backoff", with = "duration_secs")]
    pub retry_backoff: Duration,
    #[serde(default = "default_webhook_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_webhook_attempts() -> u32 {
    3
}

fn default_webhook_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookConfig {
            url: url.into(),
            max_attempts: default_webhook_attempts(),
            retry_backoff: default_webhook_backoff(),
            timeout: default_webhook_timeout(),
        }
    }

    fn validate(&self) -> Result<(), SettlementError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(SettlementError::Config(format!("webhook url {:?} is not http(s)", self.url)));
        }
        if self.max_attempts == 0 {
            return Err(SettlementError::Config("webhook max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

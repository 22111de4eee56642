//! Typed index queries on top of raced JSON-RPC calls.
//!
//! Settlement code depends on [`IndexService`] rather than the pool, so its
//! tests can answer from memory.

use async_trait::async_trait;
use bsv_script::ScriptHash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::RpcChannel;
use crate::pool::ConnectionManager;
use crate::protocol::*;
use crate::ElectrumError;

/// `blockchain.scripthash.get_balance`. Unconfirmed may be negative while
/// a spend sits in the mempool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

impl Balance {
    pub fn total(&self) -> i64 {
        self.confirmed + self.unconfirmed
    }
}

/// One `blockchain.scripthash.get_history` entry. `height` is 0 for a
/// mempool transaction and -1 when its parents are unconfirmed too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

impl HistoryEntry {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// One `blockchain.scripthash.listunspent` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

/// `blockchain.headers.subscribe` result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTip {
    pub height: u64,
    #[serde(default)]
    pub hex: String,
}

/// The index-server queries the settlement core needs.
#[async_trait]
pub trait IndexService: Send + Sync {
    async fn balance(&self, script_hash: &ScriptHash) -> Result<Balance, ElectrumError>;

    async fn history(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryEntry>, ElectrumError>;

    async fn unspent(&self, script_hash: &ScriptHash) -> Result<Vec<UnspentOutput>, ElectrumError>;

    /// Raw transaction hex for `txid` (display order).
    async fn raw_transaction(&self, txid: &str) -> Result<String, ElectrumError>;

    /// Submit raw transaction hex; returns whatever string the server
    /// answered, which callers must check is a txid.
    async fn broadcast(&self, raw_hex: &str) -> Result<String, ElectrumError>;

    async fn chain_height(&self) -> Result<u64, ElectrumError>;
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, ElectrumError> {
    serde_json::from_value(value)
        .map_err(|e| ElectrumError::Protocol(format!("unexpected {} result: {}", method, e)))
}

fn expect_string(method: &str, value: Value) -> Result<String, ElectrumError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ElectrumError::Protocol(format!(
            "unexpected {} result: {}",
            method, other
        ))),
    }
}

#[async_trait]
impl IndexService for ConnectionManager {
    async fn balance(&self, script_hash: &ScriptHash) -> Result<Balance, ElectrumError> {
        let value = self
            .race(METHOD_SCRIPTHASH_BALANCE, json!([script_hash.to_string()]))
            .await?;
        decode(METHOD_SCRIPTHASH_BALANCE, value)
    }

    async fn history(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryEntry>, ElectrumError> {
        let value = self
            .race(METHOD_SCRIPTHASH_HISTORY, json!([script_hash.to_string()]))
            .await?;
        decode(METHOD_SCRIPTHASH_HISTORY, value)
    }

    async fn unspent(&self, script_hash: &ScriptHash) -> Result<Vec<UnspentOutput>, ElectrumError> {
        let value = self
            .race(METHOD_SCRIPTHASH_UNSPENT, json!([script_hash.to_string()]))
            .await?;
        decode(METHOD_SCRIPTHASH_UNSPENT, value)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<String, ElectrumError> {
        let value = self.race(METHOD_TRANSACTION_GET, json!([txid, false])).await?;
        expect_string(METHOD_TRANSACTION_GET, value)
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String, ElectrumError> {
        let value = self.race(METHOD_TRANSACTION_BROADCAST, json!([raw_hex])).await?;
        expect_string(METHOD_TRANSACTION_BROADCAST, value)
    }

    async fn chain_height(&self) -> Result<u64, ElectrumError> {
        let value = self.race(METHOD_HEADERS_SUBSCRIBE, json!([])).await?;
        decode::<HeaderTip>(METHOD_HEADERS_SUBSCRIBE, value).map(|tip| tip.height)
    }
}

/// A script-hash status: `None` means the server knows no history.
pub type Status = Option<String>;

fn decode_status(value: Value) -> Result<Status, ElectrumError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(ElectrumError::Protocol(format!("unexpected status {}", other))),
    }
}

/// Subscribe to `script_hash` on one channel and return its current status.
pub async fn subscribe_script_hash(
    channel: &dyn RpcChannel,
    script_hash: &ScriptHash,
) -> Result<Status, ElectrumError> {
    let value = channel
        .call(METHOD_SCRIPTHASH_SUBSCRIBE, json!([script_hash.to_string()]))
        .await?;
    decode_status(value)
}

/// Drop a subscription. Returns whether the server had one.
pub async fn unsubscribe_script_hash(
    channel: &dyn RpcChannel,
    script_hash: &ScriptHash,
) -> Result<bool, ElectrumError> {
    let value = channel
        .call(METHOD_SCRIPTHASH_UNSUBSCRIBE, json!([script_hash.to_string()]))
        .await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Decode a `blockchain.scripthash.subscribe` push into (script hash, status).
/// Other notifications yield `None`.
pub fn parse_status_notification(notification: &Notification) -> Option<(ScriptHash, Status)> {
    if notification.method != METHOD_SCRIPTHASH_SUBSCRIBE {
        return None;
    }
    let params = notification.params.as_array()?;
    let script_hash = ScriptHash::from_hex(params.first()?.as_str()?).ok()?;
    let status = decode_status(params.get(1).cloned().unwrap_or(Value::Null)).ok()?;
    Some((script_hash, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    #[test]
    fn test_decode_results() {
        let balance: Balance = decode("b", json!({"confirmed": 500, "unconfirmed": -200})).expect("balance");
        assert_eq!(balance.total(), 300);

        let history: Vec<HistoryEntry> = decode(
            "h",
            json!([{"tx_hash": "aa", "height": 100}, {"tx_hash": "bb", "height": 0, "fee": 226}]),
        )
        .expect("history");
        assert!(history[0].is_confirmed());
        assert!(!history[1].is_confirmed());
        assert_eq!(history[1].fee, Some(226));

        let unspent: Vec<UnspentOutput> =
            decode("u", json!([{"tx_hash": "cc", "tx_pos": 1, "height": 5, "value": 700}])).expect("utxo");
        assert_eq!(unspent[0].value, 700);

        assert!(decode::<Balance>("b", json!("nope")).is_err());
        assert!(expect_string("t", json!(3)).is_err());
    }

    #[test]
    fn test_status_notification() {
        let push = Notification {
            method: METHOD_SCRIPTHASH_SUBSCRIBE.into(),
            params: json!([HASH, "deadbeef"]),
        };
        let (hash, status) = parse_status_notification(&push).expect("status push");
        assert_eq!(hash.to_string(), HASH);
        assert_eq!(status.as_deref(), Some("deadbeef"));

        let cleared = Notification {
            method: METHOD_SCRIPTHASH_SUBSCRIBE.into(),
            params: json!([HASH, null]),
        };
        assert_eq!(parse_status_notification(&cleared).map(|(_, s)| s), Some(None));

        let header = Notification {
            method: METHOD_HEADERS_SUBSCRIBE.into(),
            params: json!([{"height": 1}]),
        };
        assert!(parse_status_notification(&header).is_none());

        let malformed = Notification {
            method: METHOD_SCRIPTHASH_SUBSCRIBE.into(),
            params: json!(["xyz", "s"]),
        };
        assert!(parse_status_notification(&malformed).is_none());
    }
}

//! JSON-RPC 2.0 framing for the ElectrumX line protocol.
//!
//! Each message is one JSON object terminated by `\n`. Responses carry the
//! request `id`; server pushes carry a `method` and no `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ElectrumError;

pub const METHOD_VERSION: &str = "server.version";
pub const METHOD_PING: &str = "server.ping";
pub const METHOD_SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_SCRIPTHASH_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";
pub const METHOD_SCRIPTHASH_BALANCE: &str = "blockchain.scripthash.get_balance";
pub const METHOD_SCRIPTHASH_HISTORY: &str = "blockchain.scripthash.get_history";
pub const METHOD_SCRIPTHASH_UNSPENT: &str = "blockchain.scripthash.listunspent";
pub const METHOD_TRANSACTION_GET: &str = "blockchain.transaction.get";
pub const METHOD_TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
pub const METHOD_HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }

    /// The request as one newline-terminated line.
    pub fn to_line(&self) -> Result<String, ElectrumError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// An unsolicited server push.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// One decoded inbound line.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Notification(Notification),
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<Value>,
}

/// Decode one line received from a server.
pub fn parse_line(line: &str) -> Result<Incoming, ElectrumError> {
    let raw: RawMessage = serde_json::from_str(line)?;
    match (raw.id, raw.method) {
        (Some(id), _) if !id.is_null() => {
            let id = id
                .as_u64()
                .ok_or_else(|| ElectrumError::Protocol(format!("non-numeric response id {}", id)))?;
            let result = match raw.error {
                Some(err) if !err.is_null() => Err(parse_rpc_error(err)),
                _ => Ok(raw.result),
            };
            Ok(Incoming::Response { id, result })
        }
        (_, Some(method)) => Ok(Incoming::Notification(Notification {
            method,
            params: raw.params,
        })),
        _ => Err(ElectrumError::Protocol(format!("unrecognised message: {}", line))),
    }
}

// ElectrumX sometimes sends a bare string instead of an error object.
fn parse_rpc_error(err: Value) -> RpcError {
    match err {
        Value::String(message) => RpcError { code: 0, message },
        other => serde_json::from_value(other.clone()).unwrap_or(RpcError {
            code: 0,
            message: other.to_string(),
        }),
    }
}

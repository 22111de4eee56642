use std::time::Duration;

/// Errors raised by the index-server client and pool.
#[derive(Debug, thiserror::Error)]
pub enum ElectrumError {
    /// Transport-level failure opening or using a socket.
    #[error("connection to {server} failed: {message}")]
    Connection { server: String, message: String },

    /// The TLS layer rejected the server or could not be configured.
    #[error("tls error: {0}")]
    Tls(String),

    /// `server.version` was refused or answered with garbage.
    #[error("handshake with {server} failed: {message}")]
    Handshake { server: String, message: String },

    /// A connect or request exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The channel closed before a response arrived.
    #[error("connection to {0} closed")]
    Closed(String),

    /// The server answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A line could not be parsed as JSON-RPC, or a result had the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No server was live when a request was issued.
    #[error("no index servers available")]
    NoServersAvailable,

    /// Every live server failed the raced request.
    #[error("all {attempts} servers failed; first error: {first}")]
    AllServersFailed { attempts: usize, first: String },

    /// The pool configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ElectrumError {
    /// A bounded-retry transport condition rather than a server verdict.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ElectrumError::Connection { .. }
                | ElectrumError::Tls(_)
                | ElectrumError::Handshake { .. }
                | ElectrumError::Timeout { .. }
                | ElectrumError::Closed(_)
        )
    }
}

impl From<serde_json::Error> for ElectrumError {
    fn from(e: serde_json::Error) -> Self {
        ElectrumError::Protocol(e.to_string())
    }
}

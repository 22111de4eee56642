use bsv_electrum::ElectrumError;
use bsv_script::ScriptError;

/// Errors surfaced by the settlement core.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// Transport or handshake failure talking to index servers.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Every index server failed or none was reachable.
    #[error("no index servers available: {0}")]
    NoServersAvailable(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unsupported script type: {0}")]
    UnsupportedScriptType(String),

    #[error("insufficient funds: {available} sat available, {required} sat required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("amount {amount} sat is below the dust limit of {dust_limit} sat")]
    DustAmount { amount: u64, dust_limit: u64 },

    /// A re-derived address disagrees with the stored one. Never retried.
    #[error("address mismatch at {path}: stored {stored}, derived {derived}")]
    DataIntegrityMismatch {
        path: String,
        stored: String,
        derived: String,
    },

    /// The network did not acknowledge the broadcast with a txid.
    #[error("broadcast failed: {0}")]
    BroadcastFailure(String),

    /// A collaborator store failed or the record is missing.
    #[error("store error: {0}")]
    Store(String),

    /// Seed decryption or key derivation failed.
    #[error("derivation error: {0}")]
    Derivation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("notification failed: {0}")]
    Notification(String),

    /// An index server returned data that does not decode.
    #[error("malformed index data: {0}")]
    MalformedData(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

impl SettlementError {
    /// Whether the caller may retry the whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::ConnectionFailure(_)
                | SettlementError::NoServersAvailable(_)
                | SettlementError::BroadcastFailure(_)
        )
    }
}

impl From<ElectrumError> for SettlementError {
    fn from(e: ElectrumError) -> Self {
        match e {
            ElectrumError::NoServersAvailable | ElectrumError::AllServersFailed { .. } => {
                SettlementError::NoServersAvailable(e.to_string())
            }
            ElectrumError::Protocol(m) => SettlementError::MalformedData(m),
            ElectrumError::Config(m) => SettlementError::Config(m),
            other => SettlementError::ConnectionFailure(other.to_string()),
        }
    }
}

impl From<ScriptError> for SettlementError {
    fn from(e: ScriptError) -> Self {
        match e {
            ScriptError::UnsupportedScriptType(m) => SettlementError::UnsupportedScriptType(m),
            ScriptError::InvalidAddress(m) => SettlementError::InvalidAddress(m),
            other => SettlementError::InvalidAddress(other.to_string()),
        }
    }
}

impl From<bsv_primitives::PrimitivesError> for SettlementError {
    fn from(e: bsv_primitives::PrimitivesError) -> Self {
        SettlementError::Derivation(e.to_string())
    }
}

impl From<bsv_transaction::TransactionError> for SettlementError {
    fn from(e: bsv_transaction::TransactionError) -> Self {
        SettlementError::MalformedData(e.to_string())
    }
}

/// Errors raised while decoding, building or signing transactions.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The transaction is structurally unusable (bad input index, missing prevout).
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    /// An input could not be signed.
    #[error("signing error: {0}")]
    SigningError(String),
    /// The wire bytes were truncated, malformed or had trailing data.
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("script error: {0}")]
    Script(#[from] bsv_script::ScriptError),
    #[error("primitives error: {0}")]
    Primitives(#[from] bsv_primitives::PrimitivesError),
}

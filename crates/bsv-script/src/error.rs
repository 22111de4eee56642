/// Error types for script and address handling.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The string is not a well-formed Base58Check address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The address decoded cleanly but is not P2PKH or P2SH.
    #[error("unsupported script type: {0}")]
    UnsupportedScriptType(String),

    /// A script hash was not 64 hex characters.
    #[error("invalid script hash: {0}")]
    InvalidScriptHash(String),

    /// Invalid hex string.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A push opcode was passed to `append_opcodes`.
    #[error("use append_push_data for push data opcodes: {0:#04x}")]
    InvalidOpcodeType(u8),

    /// A push ran past the end of the script.
    #[error("not enough data")]
    DataTooSmall,

    /// Push data exceeds the maximum push size.
    #[error("data too big")]
    DataTooBig,

    /// Error from the primitives crate.
    #[error("primitives error: {0}")]
    Primitives(#[from] bsv_primitives::PrimitivesError),
}

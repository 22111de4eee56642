/// Unified error type for the primitives crate.
///
/// Covers hashing, key parsing, signing, encoding and HD derivation failures.
#[derive(Debug, thiserror::Error)]
pub enum PrimitivesError {
    /// The bytes do not form a valid secp256k1 private scalar.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The bytes do not form a valid SEC1 public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signing failed or a DER signature could not be parsed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A Base58Check payload failed its checksum.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A decoded point is not on the curve.
    #[error("point not on curve")]
    PointNotOnCurve,

    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A chain hash had the wrong length or format.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Base58 decoding failed.
    #[error("invalid base58: {0}")]
    InvalidBase58(String),

    /// A derivation path string could not be parsed.
    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// HD derivation produced an unusable child (probability ~2^-127).
    #[error("invalid child key at index {0}")]
    InvalidChildKey(u32),

    /// A seed outside the BIP-32 16..=64 byte range.
    #[error("invalid seed length: {0} bytes")]
    InvalidSeedLength(usize),

    /// A reader ran off the end of its buffer.
    #[error("unexpected end of data")]
    UnexpectedEof,
}

impl From<hex::FromHexError> for PrimitivesError {
    fn from(e: hex::FromHexError) -> Self {
        PrimitivesError::InvalidHex(e.to_string())
    }
}

//! Cryptographic primitives for the BSV settlement core.
//!
//! This crate provides the building blocks every other member of the
//! workspace sits on:
//! - Hash functions (SHA-256, SHA-256d, RIPEMD-160, Hash160, HMAC-SHA512)
//! - Chain hash type for transaction identifiers
//! - Variable-length integers and binary reader/writer
//! - Base58 and Base58Check encoding
//! - secp256k1 private keys, public keys and ECDSA signatures
//! - BIP-32 hierarchical deterministic key derivation

pub mod hash;
pub mod chainhash;
pub mod util;
pub mod base58;
pub mod ec;
pub mod hd;

mod error;
pub use error::PrimitivesError;

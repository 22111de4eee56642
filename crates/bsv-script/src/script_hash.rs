//! Address ↔ script-hash codec used by ElectrumX index servers.
//!
//! Servers key every subscription and query by the SHA-256 of the output's
//! locking script, byte-reversed and hex-encoded. Outputs are attributed back
//! to addresses through the closed `ScriptKind` variant so every recognised
//! shape is handled exhaustively.

use std::fmt;
use std::str::FromStr;

use bsv_primitives::hash::sha256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Address, Network, Script, ScriptError};

/// The recognised shapes of a locking script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
    PayToPublicKeyHash([u8; 20]),
    /// `OP_HASH160 <hash> OP_EQUAL`.
    PayToScriptHash([u8; 20]),
    /// Anything else: legal on chain but not attributable to an address.
    NonStandard,
}

impl ScriptKind {
    /// Classify a locking script.
    pub fn classify(script: &Script) -> Self {
        let b = script.to_bytes();
        if script.is_p2pkh() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&b[3..23]);
            ScriptKind::PayToPublicKeyHash(hash)
        } else if script.is_p2sh() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&b[2..22]);
            ScriptKind::PayToScriptHash(hash)
        } else {
            ScriptKind::NonStandard
        }
    }

    /// The address for this shape on `network`, if it has one.
    pub fn to_address(&self, network: Network) -> Option<Address> {
        match self {
            ScriptKind::PayToPublicKeyHash(hash) => Some(Address::from_public_key_hash(hash, network)),
            ScriptKind::PayToScriptHash(hash) => Some(Address::from_script_hash(hash, network)),
            ScriptKind::NonStandard => None,
        }
    }
}

/// An index-server script hash: reversed SHA-256 of a locking script.
///
/// Stored in display order, so `to_string()` is exactly the hex sent on the
/// wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHash([u8; 32]);

impl ScriptHash {
    /// Hash a locking script.
    pub fn from_script(script: &Script) -> Self {
        let mut digest = sha256(script.to_bytes());
        digest.reverse();
        ScriptHash(digest)
    }

    /// Parse the 64-character hex form.
    pub fn from_hex(hex_str: &str) -> Result<Self, ScriptError> {
        let bytes = hex::decode(hex_str).map_err(|e| ScriptError::InvalidScriptHash(e.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            ScriptError::InvalidScriptHash(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(ScriptHash(arr))
    }

    /// The bytes in wire (display) order.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self)
    }
}

impl FromStr for ScriptHash {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptHash::from_hex(s)
    }
}

impl Serialize for ScriptHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScriptHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ScriptHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Convert an address string into the script hash servers index it by.
///
/// # Arguments
/// * `address` - A P2PKH or P2SH address on either network.
///
/// # Returns
/// The script hash, `InvalidAddress` if the string does not decode, or
/// `UnsupportedScriptType` for any other address kind.
pub fn address_to_script_hash(address: &str) -> Result<ScriptHash, ScriptError> {
    let address = Address::from_string(address)?;
    Ok(ScriptHash::from_script(&address.locking_script()))
}

/// Attribute a raw locking script to an address.
///
/// Returns `None` for non-standard scripts; that is not an error.
pub fn script_to_address(script: &Script, network: Network) -> Option<Address> {
    ScriptKind::classify(script).to_address(network)
}

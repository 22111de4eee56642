//! Base58Check addresses for the two standard pay-to-hash forms.
//!
//! Version bytes: P2PKH 0x00 (mainnet) / 0x6f (testnet), P2SH 0x05 / 0xc4.
//! Anything else that decodes cleanly is reported as an unsupported script
//! type rather than an invalid address, so callers can tell "typo" apart
//! from "valid but not something we can pay to".

use std::fmt;
use std::str::FromStr;

use bsv_primitives::base58;
use bsv_primitives::ec::PublicKey;
use bsv_primitives::PrimitivesError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Script, ScriptError};

const MAINNET_P2PKH: u8 = 0x00;
const TESTNET_P2PKH: u8 = 0x6f;
const MAINNET_P2SH: u8 = 0x05;
const TESTNET_P2SH: u8 = 0xc4;

/// Network an address belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Mainnet: P2PKH addresses start with `1`, P2SH with `3`.
    #[default]
    Mainnet,
    /// Testnet: P2PKH addresses start with `m`/`n`, P2SH with `2`.
    Testnet,
}

/// Which of the two standard locking scripts an address pays to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Pay-to-public-key-hash.
    PublicKeyHash,
    /// Pay-to-script-hash.
    ScriptHash,
}

/// A decoded P2PKH or P2SH address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    /// The Base58Check string.
    pub address_string: String,
    /// The 20-byte hash160 payload.
    pub hash: [u8; 20],
    /// Which template the hash is locked into.
    pub kind: AddressKind,
    /// The network implied by the version byte.
    pub network: Network,
}

impl Address {
    /// Parse and validate a Base58Check address.
    ///
    /// # Arguments
    /// * `addr` - The address string.
    ///
    /// # Returns
    /// The decoded `Address`; `InvalidAddress` for bad characters, bad
    /// checksum or wrong length; `UnsupportedScriptType` for a well-formed
    /// address with a version byte outside the four supported ones.
    pub fn from_string(addr: &str) -> Result<Self, ScriptError> {
        let payload = base58::check_decode(addr).map_err(|e| match e {
            PrimitivesError::ChecksumMismatch => {
                ScriptError::InvalidAddress(format!("checksum failed for '{}'", addr))
            }
            other => ScriptError::InvalidAddress(format!("'{}': {}", addr, other)),
        })?;
        if payload.len() != 21 {
            return Err(ScriptError::InvalidAddress(format!(
                "'{}' decodes to {} bytes, want 21",
                addr,
                payload.len()
            )));
        }

        let (kind, network) = match payload[0] {
            MAINNET_P2PKH => (AddressKind::PublicKeyHash, Network::Mainnet),
            TESTNET_P2PKH => (AddressKind::PublicKeyHash, Network::Testnet),
            MAINNET_P2SH => (AddressKind::ScriptHash, Network::Mainnet),
            TESTNET_P2SH => (AddressKind::ScriptHash, Network::Testnet),
            version => {
                return Err(ScriptError::UnsupportedScriptType(format!(
                    "'{}' has version byte {:#04x}",
                    addr, version
                )))
            }
        };

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Address {
            address_string: addr.to_string(),
            hash,
            kind,
            network,
        })
    }

    /// Build a P2PKH address from a public key hash.
    pub fn from_public_key_hash(hash: &[u8; 20], network: Network) -> Self {
        Self::encode(*hash, AddressKind::PublicKeyHash, network)
    }

    /// Build a P2SH address from a redeem script hash.
    pub fn from_script_hash(hash: &[u8; 20], network: Network) -> Self {
        Self::encode(*hash, AddressKind::ScriptHash, network)
    }

    /// The P2PKH address of a public key (compressed form).
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self::from_public_key_hash(&public_key.hash160(), network)
    }

    /// The locking script this address pays to.
    pub fn locking_script(&self) -> Script {
        match self.kind {
            AddressKind::PublicKeyHash => Script::p2pkh(&self.hash),
            AddressKind::ScriptHash => Script::p2sh(&self.hash),
        }
    }

    fn encode(hash: [u8; 20], kind: AddressKind, network: Network) -> Self {
        let version = match (kind, network) {
            (AddressKind::PublicKeyHash, Network::Mainnet) => MAINNET_P2PKH,
            (AddressKind::PublicKeyHash, Network::Testnet) => TESTNET_P2PKH,
            (AddressKind::ScriptHash, Network::Mainnet) => MAINNET_P2SH,
            (AddressKind::ScriptHash, Network::Testnet) => TESTNET_P2SH,
        };
        let mut payload = Vec::with_capacity(21);
        payload.push(version);
        payload.extend_from_slice(&hash);
        Address {
            address_string: base58::check_encode(&payload),
            hash,
            kind,
            network,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_string)
    }
}

impl FromStr for Address {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_string(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.address_string)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_string(&s).map_err(serde::de::Error::custom)
    }
}

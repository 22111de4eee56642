//! ECDSA signatures with DER encoding and low-S normalization.
//!
//! Transaction inputs carry `DER(signature) || sighash_type`, and the network
//! only relays low-S signatures, so every signature produced here is
//! normalized before it is exposed.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa;

use crate::ec::private_key::PrivateKey;
use crate::ec::public_key::PublicKey;
use crate::PrimitivesError;

/// An ECDSA signature over secp256k1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    inner: ecdsa::Signature,
}

impl Signature {
    /// Sign a digest with RFC 6979 deterministic nonces.
    ///
    /// # Arguments
    /// * `hash` - The digest to sign; shorter inputs are left-padded to 32 bytes.
    /// * `priv_key` - The signing key.
    ///
    /// # Returns
    /// A low-S signature, or `InvalidSignature` if signing fails.
    pub fn sign(hash: &[u8], priv_key: &PrivateKey) -> Result<Self, PrimitivesError> {
        let digest = Self::normalize_hash(hash);
        let sig: ecdsa::Signature = priv_key
            .signing_key()
            .sign_prehash(&digest)
            .map_err(|e| PrimitivesError::InvalidSignature(e.to_string()))?;
        Ok(Signature {
            inner: sig.normalize_s().unwrap_or(sig),
        })
    }

    /// Parse a strict DER signature.
    pub fn from_der(bytes: &[u8]) -> Result<Self, PrimitivesError> {
        let inner = ecdsa::Signature::from_der(bytes)
            .map_err(|e| PrimitivesError::InvalidSignature(e.to_string()))?;
        Ok(Signature { inner })
    }

    /// DER encoding: `0x30 len 0x02 rlen r 0x02 slen s`.
    pub fn to_der(&self) -> Vec<u8> {
        self.inner.to_der().as_bytes().to_vec()
    }

    /// Whether `s` is in the lower half of the curve order.
    pub fn is_low_s(&self) -> bool {
        self.inner.normalize_s().is_none()
    }

    /// Verify against a digest and public key.
    pub fn verify(&self, hash: &[u8], pub_key: &PublicKey) -> bool {
        let digest = Self::normalize_hash(hash);
        pub_key
            .verifying_key()
            .verify_prehash(&digest, &self.inner)
            .is_ok()
    }

    fn normalize_hash(hash: &[u8]) -> [u8; 32] {
        let mut padded = [0u8; 32];
        if hash.len() >= 32 {
            padded.copy_from_slice(&hash[..32]);
        } else {
            padded[32 - hash.len()..].copy_from_slice(hash);
        }
        padded
    }
}

//! Hash functions used by addresses, script hashes, txids and HD derivation.

use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

/// Compute the SHA-256 digest of `data`.
///
/// This is also the digest ElectrumX applies to a locking script before
/// reversing it into a script hash.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute SHA-256(SHA-256(data)).
///
/// Used for transaction ids, sighash digests and Base58Check checksums.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Compute the RIPEMD-160 digest of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// Compute Hash160: RIPEMD-160(SHA-256(data)).
///
/// # Arguments
/// * `data` - Usually a compressed public key or a redeem script.
///
/// # Returns
/// The 20-byte hash carried inside P2PKH and P2SH addresses.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// Compute HMAC-SHA512 of `data` keyed with `key`.
///
/// # Arguments
/// * `key` - The HMAC key (e.g. `b"Bitcoin seed"` or a chain code).
/// * `data` - The message bytes.
///
/// # Returns
/// A 64-byte tag; BIP-32 splits it into a key half and a chain code half.
pub fn sha512_hmac(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .expect("HMAC accepts any key length");
    mac.update(data);
    let mut output = [0u8; 64];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

//! BIP-32 hierarchical deterministic key derivation.
//!
//! Merchant wallets are a single seed; the primary address and every invoice
//! address are children of it at fixed paths. Only private derivation is
//! implemented since the settlement core always holds the seed when it needs
//! a key.

use std::fmt;
use std::str::FromStr;

use k256::elliptic_curve::PrimeField;
use k256::Scalar;
use zeroize::Zeroize;

use crate::ec::{PrivateKey, PublicKey};
use crate::hash::{hash160, sha512_hmac};
use crate::PrimitivesError;

/// First hardened child index.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// HMAC key for master key generation.
const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

// ---------------------------------------------------------------------------
// DerivationPath
// ---------------------------------------------------------------------------

/// A parsed derivation path such as `m/44'/236'/0'/1/7`.
///
/// Hardened components carry the `HARDENED_OFFSET` bit. `'`, `h` and `H`
/// are all accepted as hardened markers when parsing; `'` is used when
/// formatting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// The empty path `m`.
    pub fn master() -> Self {
        DerivationPath(Vec::new())
    }

    /// Return a new path with `index` appended.
    pub fn child(&self, index: u32) -> Self {
        let mut indexes = self.0.clone();
        indexes.push(index);
        DerivationPath(indexes)
    }

    /// The raw child indexes, hardened bit included.
    pub fn indexes(&self) -> &[u32] {
        &self.0
    }

    /// Number of components below the master key.
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl FromStr for DerivationPath {
    type Err = PrimitivesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(PrimitivesError::InvalidDerivationPath(format!(
                "{:?} must start with \"m\"",
                s
            )));
        }
        let mut indexes = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix(['\'', 'h', 'H']) {
                Some(stripped) => (stripped, true),
                None => (part, false),
            };
            let index: u32 = digits.parse().map_err(|_| {
                PrimitivesError::InvalidDerivationPath(format!("bad component {:?} in {:?}", part, s))
            })?;
            if index >= HARDENED_OFFSET {
                return Err(PrimitivesError::InvalidDerivationPath(format!(
                    "component {} out of range in {:?}",
                    index, s
                )));
            }
            indexes.push(if hardened { index | HARDENED_OFFSET } else { index });
        }
        Ok(DerivationPath(indexes))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for index in &self.0 {
            if index & HARDENED_OFFSET != 0 {
                write!(f, "/{}'", index & !HARDENED_OFFSET)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExtendedPrivateKey
// ---------------------------------------------------------------------------

/// A private key plus chain code: one node of a BIP-32 tree.
#[derive(Clone)]
pub struct ExtendedPrivateKey {
    private_key: PrivateKey,
    chain_code: [u8; 32],
    depth: u8,
    child_number: u32,
    parent_fingerprint: [u8; 4],
}

impl ExtendedPrivateKey {
    /// Derive the master node from a seed.
    ///
    /// # Arguments
    /// * `seed` - 16 to 64 bytes of seed material.
    ///
    /// # Returns
    /// The master node, `InvalidSeedLength` for out-of-range seeds, or
    /// `InvalidPrivateKey` in the negligible case that the seed hashes to an
    /// unusable scalar.
    pub fn from_seed(seed: &[u8]) -> Result<Self, PrimitivesError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(PrimitivesError::InvalidSeedLength(seed.len()));
        }
        let mut i = sha512_hmac(MASTER_HMAC_KEY, seed);
        let result = Self::from_hmac_output(&i, 0, 0, [0u8; 4])
            .map_err(|_| PrimitivesError::InvalidPrivateKey("seed yields invalid master key".into()));
        i.zeroize();
        result
    }

    /// Derive one child node.
    ///
    /// Indexes at or above `HARDENED_OFFSET` use hardened derivation
    /// (`0x00 || k || i`); lower indexes use the compressed public key.
    ///
    /// # Returns
    /// The child node, or `InvalidChildKey(index)` when `IL >= n` or the
    /// child scalar is zero; callers should then skip to the next index.
    pub fn derive_child(&self, index: u32) -> Result<Self, PrimitivesError> {
        let mut data = Vec::with_capacity(37);
        if index >= HARDENED_OFFSET {
            data.push(0u8);
            data.extend_from_slice(&self.private_key.to_bytes());
        } else {
            data.extend_from_slice(&self.public_key().to_compressed());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let mut i = sha512_hmac(&self.chain_code, &data);
        data.zeroize();

        let mut il = [0u8; 32];
        il.copy_from_slice(&i[..32]);
        let tweak: Option<Scalar> = Scalar::from_repr(il.into()).into();
        il.zeroize();

        let result = match tweak {
            Some(tweak) => {
                let child = tweak + self.private_key.to_scalar();
                let mut child_bytes: [u8; 32] = child.to_bytes().into();
                let key = PrivateKey::from_bytes(&child_bytes);
                child_bytes.zeroize();
                let mut chain_code = [0u8; 32];
                chain_code.copy_from_slice(&i[32..]);
                key.map(|private_key| ExtendedPrivateKey {
                    private_key,
                    chain_code,
                    depth: self.depth.saturating_add(1),
                    child_number: index,
                    parent_fingerprint: self.fingerprint(),
                })
                .map_err(|_| PrimitivesError::InvalidChildKey(index))
            }
            None => Err(PrimitivesError::InvalidChildKey(index)),
        };
        i.zeroize();
        result
    }

    /// Derive every component of `path` starting from this node.
    pub fn derive_path(&self, path: &DerivationPath) -> Result<Self, PrimitivesError> {
        let mut node = self.clone();
        for &index in path.indexes() {
            node = node.derive_child(index)?;
        }
        Ok(node)
    }

    /// The signing key at this node.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// The public key at this node.
    pub fn public_key(&self) -> PublicKey {
        self.private_key.pub_key()
    }

    /// The 32-byte chain code.
    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// Depth below the master node.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The index this node was derived at (0 for the master).
    pub fn child_number(&self) -> u32 {
        self.child_number
    }

    /// Fingerprint of the parent node.
    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// First four bytes of Hash160 of this node's public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        let h = hash160(&self.public_key().to_compressed());
        [h[0], h[1], h[2], h[3]]
    }

    fn from_hmac_output(
        i: &[u8; 64],
        depth: u8,
        child_number: u32,
        parent_fingerprint: [u8; 4],
    ) -> Result<Self, PrimitivesError> {
        let private_key = PrivateKey::from_bytes(&i[..32])?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        Ok(ExtendedPrivateKey {
            private_key,
            chain_code,
            depth,
            child_number,
            parent_fingerprint,
        })
    }
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .field("parent_fingerprint", &hex::encode(self.parent_fingerprint))
            .field("private_key", &"<redacted>")
            .field("chain_code", &"<redacted>")
            .finish()
    }
}

impl Drop for ExtendedPrivateKey {
    fn drop(&mut self) {
        self.chain_code.zeroize();
    }
}

#[cfg(test)]
mod tests {
    //! BIP-32 test vector 1 and path parsing.

    use super::*;

    const SEED_1: &str = "000102030405060708090a0b0c0d0e0f";

    fn master() -> ExtendedPrivateKey {
        let seed = hex::decode(SEED_1).expect("valid hex");
        ExtendedPrivateKey::from_seed(&seed).expect("master key")
    }

    /// Chain m.
    #[test]
    fn test_vector_1_master() {
        let m = master();
        assert_eq!(
            m.private_key().to_hex(),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(m.chain_code()),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
        assert_eq!(m.depth(), 0);
        assert_eq!(hex::encode(m.fingerprint()), "3442193e");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let m = master();
        let shown = format!("{:?}", m);
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains(&hex::encode(m.chain_code())));
        assert!(!shown.contains(&m.private_key().to_hex()));
    }

    /// Chains m/0' and m/0'/1 cover both hardened and normal steps.
    #[test]
    fn test_vector_1_children() {
        let m = master();

        let hardened = m.derive_child(HARDENED_OFFSET).expect("m/0'");
        assert_eq!(
            hardened.private_key().to_hex(),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
        assert_eq!(
            hex::encode(hardened.chain_code()),
            "47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141"
        );
        assert_eq!(hardened.parent_fingerprint(), m.fingerprint());
        assert_eq!(hardened.child_number(), HARDENED_OFFSET);

        let normal = hardened.derive_child(1).expect("m/0'/1");
        assert_eq!(
            normal.private_key().to_hex(),
            "3c6cb8d0f6a264c91ea8b5030fadaa8e538b020f0a387421a12de9319dc93368"
        );
        assert_eq!(
            hex::encode(normal.chain_code()),
            "2a7857631386ba23dacac34180dd1983734e444fdbf774041578e9b6adb37c19"
        );
        assert_eq!(normal.depth(), 2);
    }

    /// derive_path walks the same steps as repeated derive_child.
    #[test]
    fn test_derive_path_matches_stepwise() {
        let m = master();
        let path: DerivationPath = "m/0'/1/2'".parse().expect("path");
        let node = m.derive_path(&path).expect("derive");
        assert_eq!(
            node.private_key().to_hex(),
            "cbce0d719ecf7431d88e6a89fa1483e02e35092af60c042b1df2ff59fa424dca"
        );
        assert_eq!(node.depth(), 3);
    }

    #[test]
    fn test_seed_length_bounds() {
        assert!(matches!(
            ExtendedPrivateKey::from_seed(&[7u8; 15]),
            Err(PrimitivesError::InvalidSeedLength(15))
        ));
        assert!(ExtendedPrivateKey::from_seed(&[7u8; 65]).is_err());
        assert!(ExtendedPrivateKey::from_seed(&[7u8; 64]).is_ok());
    }

    #[test]
    fn test_path_parse_and_display() {
        let path: DerivationPath = "m/44'/236h/0H/1/7".parse().expect("parse");
        assert_eq!(
            path.indexes(),
            &[44 | HARDENED_OFFSET, 236 | HARDENED_OFFSET, HARDENED_OFFSET, 1, 7]
        );
        assert_eq!(path.to_string(), "m/44'/236'/0'/1/7");
        assert_eq!(path.child(9).to_string(), "m/44'/236'/0'/1/7/9");
        assert_eq!("m".parse::<DerivationPath>().expect("master"), DerivationPath::master());
    }

    #[test]
    fn test_path_rejects_malformed() {
        for bad in ["", "44'/0", "m/", "m/x", "m/1//2", "m/2147483648", "m/-1"] {
            assert!(bad.parse::<DerivationPath>().is_err(), "accepted {:?}", bad);
        }
    }
}

//! Deterministic merchant keys.
//!
//! Under a merchant's account path the primary key sits at `base/0/0` and
//! invoice keys at `base/1/index`. Derivation is pure: the same seed and
//! path always give the same address, which is what lets stored addresses
//! be checked against their seed before any money moves.

use std::fmt;

use bsv_primitives::ec::PrivateKey;
use bsv_primitives::hd::{DerivationPath, ExtendedPrivateKey, HARDENED_OFFSET};
use bsv_script::{Address, Network};
use tracing::{debug, error};

use crate::collaborators::InvoiceCounter;
use crate::SettlementError;

const EXTERNAL_CHAIN: u32 = 0;
const INVOICE_CHAIN: u32 = 1;

/// An address with its signing key. Only lives as long as one operation.
#[derive(Clone)]
pub struct DerivedKey {
    pub path: DerivationPath,
    pub address: Address,
    pub signing_key: PrivateKey,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("path", &self.path.to_string())
            .field("address", &self.address.address_string)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

/// A freshly allocated invoice address.
#[derive(Clone, Debug)]
pub struct InvoiceKey {
    pub index: u32,
    pub key: DerivedKey,
}

#[derive(Clone, Copy, Debug)]
pub struct KeyDerivationEngine {
    network: Network,
}

impl KeyDerivationEngine {
    pub fn new(network: Network) -> Self {
        KeyDerivationEngine { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn primary_path(base: &DerivationPath) -> DerivationPath {
        base.child(EXTERNAL_CHAIN).child(0)
    }

    /// Invoice children are never hardened; an index at or past
    /// `HARDENED_OFFSET` is refused.
    pub fn invoice_path(base: &DerivationPath, index: u32) -> Result<DerivationPath, SettlementError> {
        if index >= HARDENED_OFFSET {
            return Err(SettlementError::Derivation(format!(
                "invoice index {} is outside the non-hardened range",
                index
            )));
        }
        Ok(base.child(INVOICE_CHAIN).child(index))
    }

    pub fn derive_path(&self, seed: &[u8], path: &DerivationPath) -> Result<DerivedKey, SettlementError> {
        let node = ExtendedPrivateKey::from_seed(seed)?.derive_path(path)?;
        let address = Address::from_public_key(&node.public_key(), self.network);
        Ok(DerivedKey {
            path: path.clone(),
            address,
            signing_key: node.private_key().clone(),
        })
    }

    pub fn derive_primary(&self, seed: &[u8], base: &DerivationPath) -> Result<DerivedKey, SettlementError> {
        self.derive_path(seed, &Self::primary_path(base))
    }

    pub fn derive_invoice(
        &self,
        seed: &[u8],
        base: &DerivationPath,
        index: u32,
    ) -> Result<DerivedKey, SettlementError> {
        self.derive_path(seed, &Self::invoice_path(base, index)?)
    }

    /// Fails with `DataIntegrityMismatch` unless `stored` is exactly the
    /// derived address.
    pub fn verify_stored(&self, stored: &str, derived: &DerivedKey) -> Result<(), SettlementError> {
        if stored == derived.address.address_string {
            return Ok(());
        }
        error!(
            path = %derived.path,
            stored,
            derived = %derived.address,
            "stored address does not match its derivation"
        );
        Err(SettlementError::DataIntegrityMismatch {
            path: derived.path.to_string(),
            stored: stored.to_string(),
            derived: derived.address.address_string.clone(),
        })
    }

    /// Take the merchant's next invoice index and derive its key.
    ///
    /// An index is consumed even if derivation then fails, so a retry never
    /// lands on an address something else may already hold.
    pub async fn allocate_invoice(
        &self,
        counter: &dyn InvoiceCounter,
        merchant_id: &str,
        seed: &[u8],
        base: &DerivationPath,
    ) -> Result<InvoiceKey, SettlementError> {
        let index = counter.next_index(merchant_id).await?;
        let key = self.derive_invoice(seed, base, index)?;
        debug!(merchant = merchant_id, index, address = %key.address, "allocated invoice address");
        Ok(InvoiceKey { index, key })
    }
}

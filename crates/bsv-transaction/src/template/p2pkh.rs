//! Pay-to-public-key-hash unlocking: `<sig> <pubkey>`.
//!
//! Each settlement input is signed with the key derived for the address
//! that owns it, so one `P2PKH` template exists per distinct key.

use bsv_primitives::ec::PrivateKey;
use bsv_script::Script;

use crate::sighash::SIGHASH_ALL_FORKID;
use crate::template::UnlockingScriptTemplate;
use crate::transaction::Transaction;
use crate::TransactionError;

/// Largest P2PKH unlocking script for a low-S signature: push(1) +
/// DER(<=71) + flag(1) + push(1) + compressed key(33).
pub const UNLOCKING_SCRIPT_MAX_LEN: usize = 107;

/// Build a P2PKH template for `private_key`. `sighash_flag` defaults to
/// `SIGHASH_ALL_FORKID`.
pub fn unlock(private_key: PrivateKey, sighash_flag: Option<u32>) -> P2PKH {
    P2PKH {
        private_key,
        sighash_flag: sighash_flag.unwrap_or(SIGHASH_ALL_FORKID),
    }
}

pub struct P2PKH {
    private_key: PrivateKey,
    sighash_flag: u32,
}

impl P2PKH {
    /// The locking script this template can spend.
    pub fn locking_script(&self) -> Script {
        Script::p2pkh(&self.private_key.pub_key().hash160())
    }
}

impl UnlockingScriptTemplate for P2PKH {
    fn sign(&self, tx: &Transaction, input_index: usize) -> Result<Script, TransactionError> {
        let input = tx.inputs.get(input_index).ok_or_else(|| {
            TransactionError::SigningError(format!(
                "input index {} out of range (tx has {} inputs)",
                input_index,
                tx.inputs.len()
            ))
        })?;
        let source = input.source_output().ok_or_else(|| {
            TransactionError::SigningError(format!("input {} has no source output", input_index))
        })?;
        if source.locking_script != self.locking_script() {
            return Err(TransactionError::SigningError(format!(
                "input {} is not locked to this key",
                input_index
            )));
        }

        let sig_hash = tx.calc_input_signature_hash(input_index, self.sighash_flag)?;
        let signature = self.private_key.sign(&sig_hash)?;

        let der_sig = signature.to_der();
        let mut sig_buf = Vec::with_capacity(der_sig.len() + 1);
        sig_buf.extend_from_slice(&der_sig);
        sig_buf.push(self.sighash_flag as u8);

        let mut script = Script::new();
        script.append_push_data(&sig_buf)?;
        script.append_push_data(&self.private_key.pub_key().to_compressed())?;
        Ok(script)
    }

    fn estimate_length(&self) -> usize {
        UNLOCKING_SCRIPT_MAX_LEN
    }
}

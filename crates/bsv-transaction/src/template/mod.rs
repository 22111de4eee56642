//! Unlocking script templates.

pub mod p2pkh;

use bsv_script::Script;

use crate::transaction::Transaction;
use crate::TransactionError;

/// Produces the unlocking script for one input of a transaction.
pub trait UnlockingScriptTemplate {
    /// Sign `input_index` of `tx`. The input must carry its source output.
    fn sign(&self, tx: &Transaction, input_index: usize) -> Result<Script, TransactionError>;

    /// Upper bound on the unlocking script's length, used for fee sizing
    /// before signatures exist.
    fn estimate_length(&self) -> usize;
}

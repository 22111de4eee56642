//! Transaction wire format, BIP-143 FORKID signing and fee sizing.
//!
//! The settlement builder assembles transactions whose inputs come from
//! many derived P2PKH addresses; this crate supplies the pieces it needs:
//! serialization, per-input signature hashes, the P2PKH unlocking
//! template, and byte-size estimates for fee convergence.

pub mod transaction;
pub mod input;
pub mod output;
pub mod sighash;
pub mod template;
pub mod fee;

mod error;
pub use error::TransactionError;
pub use transaction::Transaction;
pub use input::TransactionInput;
pub use output::TransactionOutput;

#[cfg(test)]
mod tests;

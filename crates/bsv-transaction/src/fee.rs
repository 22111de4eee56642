//! Byte-size and fee estimates for P2PKH-funded transactions.
//!
//! Fees are `size * rate` with the rate in satoshis per byte. Sizes are upper
//! bounds: every input is assumed to carry a maximal P2PKH unlocking script
//! and every output a P2PKH locking script (P2SH outputs are two bytes
//! smaller).

use bsv_primitives::util::VarInt;

use crate::template::p2pkh::UNLOCKING_SCRIPT_MAX_LEN;

/// outpoint(36) + script length(1) + script + sequence(4).
pub const P2PKH_INPUT_SIZE: usize = 36 + 1 + UNLOCKING_SCRIPT_MAX_LEN + 4;

/// value(8) + script length(1) + 25-byte P2PKH script.
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 1 + 25;

/// Estimated size of a transaction with `inputs` P2PKH inputs and
/// `outputs` outputs.
pub fn estimate_size(inputs: usize, outputs: usize) -> usize {
    4 + VarInt::from(inputs).length()
        + inputs * P2PKH_INPUT_SIZE
        + VarInt::from(outputs).length()
        + outputs * P2PKH_OUTPUT_SIZE
        + 4
}

/// Fee for `size` bytes at `sat_per_byte`.
pub fn fee_for_size(size: usize, sat_per_byte: u64) -> u64 {
    (size as u64).saturating_mul(sat_per_byte)
}

/// Fee for a transaction of the given shape.
pub fn estimate_fee(inputs: usize, outputs: usize, sat_per_byte: u64) -> u64 {
    fee_for_size(estimate_size(inputs, outputs), sat_per_byte)
}

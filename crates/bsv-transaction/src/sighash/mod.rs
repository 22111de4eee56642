//! BIP-143 style signature hashes with the BSV FORKID flag.
//!
//! Every input the settlement core signs commits to all inputs and all
//! outputs, so only `SIGHASH_ALL | SIGHASH_FORKID` is supported; other
//! base types are rejected rather than silently hashed wrong.
//!
//! See <https://github.com/bitcoin-sv/bitcoin-sv/blob/master/doc/abc/replay-protected-sighash.md#digest-algorithm>

use bsv_primitives::hash::sha256d;
use bsv_primitives::util::{BsvWriter, VarInt};

use crate::transaction::Transaction;
use crate::TransactionError;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ALL_FORKID: u32 = SIGHASH_ALL | SIGHASH_FORKID;

/// The digest ECDSA signs for `input_index`.
///
/// # Arguments
/// * `prev_output_script` - Locking script of the output being spent.
/// * `sighash_type` - Must be `SIGHASH_ALL_FORKID`.
/// * `satoshis` - Value of the output being spent.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    prev_output_script: &[u8],
    sighash_type: u32,
    satoshis: u64,
) -> Result<[u8; 32], TransactionError> {
    let preimage = calc_preimage(tx, input_index, prev_output_script, sighash_type, satoshis)?;
    Ok(sha256d(&preimage))
}

/// The unhashed preimage behind [`signature_hash`].
pub fn calc_preimage(
    tx: &Transaction,
    input_index: usize,
    prev_output_script: &[u8],
    sighash_type: u32,
    satoshis: u64,
) -> Result<Vec<u8>, TransactionError> {
    if sighash_type != SIGHASH_ALL_FORKID {
        return Err(TransactionError::SigningError(format!(
            "unsupported sighash type {:#04x}",
            sighash_type
        )));
    }
    let input = tx.inputs.get(input_index).ok_or_else(|| {
        TransactionError::InvalidTransaction(format!(
            "input index {} out of range (tx has {} inputs)",
            input_index,
            tx.inputs.len()
        ))
    })?;

    let mut writer = BsvWriter::with_capacity(160 + prev_output_script.len());
    writer.write_u32_le(tx.version);
    writer.write_bytes(&prevouts_hash(tx));
    writer.write_bytes(&sequence_hash(tx));
    writer.write_bytes(&input.source_txid);
    writer.write_u32_le(input.source_tx_out_index);
    writer.write_varint(VarInt::from(prev_output_script.len()));
    writer.write_bytes(prev_output_script);
    writer.write_u64_le(satoshis);
    writer.write_u32_le(input.sequence_number);
    writer.write_bytes(&outputs_hash(tx));
    writer.write_u32_le(tx.lock_time);
    writer.write_u32_le(sighash_type);

    Ok(writer.into_bytes())
}

fn prevouts_hash(tx: &Transaction) -> [u8; 32] {
    let mut writer = BsvWriter::with_capacity(tx.inputs.len() * 36);
    for input in &tx.inputs {
        writer.write_bytes(&input.source_txid);
        writer.write_u32_le(input.source_tx_out_index);
    }
    sha256d(writer.as_bytes())
}

fn sequence_hash(tx: &Transaction) -> [u8; 32] {
    let mut writer = BsvWriter::with_capacity(tx.inputs.len() * 4);
    for input in &tx.inputs {
        writer.write_u32_le(input.sequence_number);
    }
    sha256d(writer.as_bytes())
}

fn outputs_hash(tx: &Transaction) -> [u8; 32] {
    let mut writer = BsvWriter::new();
    for output in &tx.outputs {
        output.write_to(&mut writer);
    }
    sha256d(writer.as_bytes())
}

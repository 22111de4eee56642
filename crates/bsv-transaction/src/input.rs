//! Transaction inputs.
//!
//! An input names the output it spends and, once signed, carries the
//! unlocking script. Inputs built for signing also remember the spent
//! output itself, since the FORKID sighash commits to its value and script.

use bsv_primitives::util::{BsvReader, BsvWriter, VarInt};
use bsv_script::Script;

use crate::output::TransactionOutput;
use crate::TransactionError;

/// Final sequence number; lock time is not used by the settlement core.
pub const DEFAULT_SEQUENCE_NUMBER: u32 = 0xFFFF_FFFF;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInput {
    /// Txid of the funding transaction, internal byte order.
    pub source_txid: [u8; 32],
    pub source_tx_out_index: u32,
    pub sequence_number: u32,
    /// `None` until signed.
    pub unlocking_script: Option<Script>,
    source_output: Option<TransactionOutput>,
}

impl TransactionInput {
    /// An unsigned input spending `source_txid:vout`.
    pub fn new(source_txid: [u8; 32], vout: u32) -> Self {
        TransactionInput {
            source_txid,
            source_tx_out_index: vout,
            sequence_number: DEFAULT_SEQUENCE_NUMBER,
            unlocking_script: None,
            source_output: None,
        }
    }

    pub fn read_from(reader: &mut BsvReader) -> Result<Self, TransactionError> {
        let txid_bytes = reader.read_bytes(32).map_err(|e| {
            TransactionError::SerializationError(format!("reading source txid: {}", e))
        })?;
        let mut source_txid = [0u8; 32];
        source_txid.copy_from_slice(txid_bytes);

        let source_tx_out_index = reader.read_u32_le().map_err(|e| {
            TransactionError::SerializationError(format!("reading output index: {}", e))
        })?;

        let script_len = reader.read_varint().map_err(|e| {
            TransactionError::SerializationError(format!("reading script length: {}", e))
        })?;
        let script_bytes = reader.read_bytes(script_len.value() as usize).map_err(|e| {
            TransactionError::SerializationError(format!("reading unlocking script: {}", e))
        })?;

        let sequence_number = reader.read_u32_le().map_err(|e| {
            TransactionError::SerializationError(format!("reading sequence number: {}", e))
        })?;

        Ok(TransactionInput {
            source_txid,
            source_tx_out_index,
            sequence_number,
            unlocking_script: (!script_bytes.is_empty()).then(|| Script::from_bytes(script_bytes)),
            source_output: None,
        })
    }

    /// Write the outpoint, unlocking script (empty if unsigned) and sequence.
    pub fn write_to(&self, writer: &mut BsvWriter) {
        writer.write_bytes(&self.source_txid);
        writer.write_u32_le(self.source_tx_out_index);
        match &self.unlocking_script {
            Some(script) => {
                writer.write_varint(VarInt::from(script.len()));
                writer.write_bytes(script.to_bytes());
            }
            None => writer.write_varint(VarInt(0)),
        }
        writer.write_u32_le(self.sequence_number);
    }

    /// The funding txid in display order, as index servers report it.
    pub fn source_txid_hex(&self) -> String {
        let mut id = self.source_txid;
        id.reverse();
        hex::encode(id)
    }

    /// Record the output this input spends.
    pub fn set_source_output(&mut self, output: TransactionOutput) {
        self.source_output = Some(output);
    }

    pub fn source_output(&self) -> Option<&TransactionOutput> {
        self.source_output.as_ref()
    }
}

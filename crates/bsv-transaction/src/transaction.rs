//! The transaction type: version, inputs, outputs and lock time.
//!
//! Raw transactions fetched from index servers are decoded here for
//! classification, and transactions built for a send are serialized here
//! for broadcast.

use bsv_primitives::chainhash::Hash;
use bsv_primitives::hash::sha256d;
use bsv_primitives::util::{BsvReader, BsvWriter, VarInt};
use bsv_script::Script;

use crate::input::TransactionInput;
use crate::output::TransactionOutput;
use crate::sighash;
use crate::TransactionError;

/// A BSV transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Format version, 1 for everything this crate builds.
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// An empty version-1 transaction with lock time 0.
    pub fn new() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// Decode a transaction from hex.
    pub fn from_hex(hex_str: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(hex_str).map_err(|e| {
            TransactionError::SerializationError(format!("invalid hex: {}", e))
        })?;
        Self::from_bytes(&bytes)
    }

    /// Decode a transaction, rejecting trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = BsvReader::new(bytes);
        let tx = Self::read_from(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(TransactionError::SerializationError(format!(
                "trailing {} bytes after transaction",
                reader.remaining()
            )));
        }
        Ok(tx)
    }

    /// Decode one transaction from the reader's current position.
    pub fn read_from(reader: &mut BsvReader) -> Result<Self, TransactionError> {
        let version = reader.read_u32_le().map_err(|e| {
            TransactionError::SerializationError(format!("reading version: {}", e))
        })?;

        let input_count = read_count(reader, "input")?;
        let mut inputs = Vec::with_capacity(input_count.min(reader.remaining() / 41));
        for _ in 0..input_count {
            inputs.push(TransactionInput::read_from(reader)?);
        }

        let output_count = read_count(reader, "output")?;
        let mut outputs = Vec::with_capacity(output_count.min(reader.remaining() / 9));
        for _ in 0..output_count {
            outputs.push(TransactionOutput::read_from(reader)?);
        }

        let lock_time = reader.read_u32_le().map_err(|e| {
            TransactionError::SerializationError(format!("reading lock time: {}", e))
        })?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BsvWriter::with_capacity(10 + self.inputs.len() * 148 + self.outputs.len() * 34);
        writer.write_u32_le(self.version);

        writer.write_varint(VarInt::from(self.inputs.len()));
        for input in &self.inputs {
            input.write_to(&mut writer);
        }

        writer.write_varint(VarInt::from(self.outputs.len()));
        for output in &self.outputs {
            output.write_to(&mut writer);
        }

        writer.write_u32_le(self.lock_time);
        writer.into_bytes()
    }

    /// Serialize to lowercase hex, the form `blockchain.transaction.broadcast` takes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Double SHA-256 of the wire bytes, in internal byte order.
    pub fn tx_id(&self) -> Hash {
        Hash::new(sha256d(&self.to_bytes()))
    }

    /// The txid as displayed by explorers and index servers.
    pub fn tx_id_hex(&self) -> String {
        self.tx_id().to_string()
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn add_input(&mut self, input: TransactionInput) {
        self.inputs.push(input);
    }

    pub fn add_output(&mut self, output: TransactionOutput) {
        self.outputs.push(output);
    }

    /// Append an unsigned input spending `txid:vout`, remembering the
    /// spent output so the input can be signed later.
    ///
    /// # Arguments
    /// * `txid` - Display-order hex txid of the funding transaction.
    /// * `vout` - Output index within it.
    /// * `locking_script` - The spent output's locking script.
    /// * `satoshis` - The spent output's value.
    pub fn add_input_from(
        &mut self,
        txid: &str,
        vout: u32,
        locking_script: Script,
        satoshis: u64,
    ) -> Result<(), TransactionError> {
        let hash = Hash::from_hex(txid)?;
        let mut input = TransactionInput::new(*hash.as_bytes(), vout);
        input.set_source_output(TransactionOutput::new(satoshis, locking_script));
        self.inputs.push(input);
        Ok(())
    }

    pub fn total_output_satoshis(&self) -> u64 {
        self.outputs.iter().map(|o| o.satoshis).sum()
    }

    /// Sum of the spent outputs' values; fails if any input lacks one.
    pub fn total_input_satoshis(&self) -> Result<u64, TransactionError> {
        self.inputs.iter().try_fold(0u64, |total, input| {
            let sats = input.source_output().map(|o| o.satoshis).ok_or_else(|| {
                TransactionError::InvalidTransaction("missing source output on input".to_string())
            })?;
            Ok(total + sats)
        })
    }

    /// A coinbase has a single input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        match self.inputs.as_slice() {
            [input] => input.source_txid == [0u8; 32] && input.source_tx_out_index == u32::MAX,
            _ => false,
        }
    }

    /// The FORKID signature hash for `input_index`, using the spent output
    /// recorded on that input.
    pub fn calc_input_signature_hash(
        &self,
        input_index: usize,
        sighash_flag: u32,
    ) -> Result<[u8; 32], TransactionError> {
        let input = self.inputs.get(input_index).ok_or_else(|| {
            TransactionError::InvalidTransaction(format!(
                "input index {} out of range (tx has {} inputs)",
                input_index,
                self.inputs.len()
            ))
        })?;
        let source = input.source_output().ok_or_else(|| {
            TransactionError::SigningError(format!("input {} has no source output", input_index))
        })?;

        sighash::signature_hash(
            self,
            input_index,
            source.locking_script.to_bytes(),
            sighash_flag,
            source.satoshis,
        )
    }
}

fn read_count(reader: &mut BsvReader, what: &str) -> Result<usize, TransactionError> {
    let count = reader.read_varint().map_err(|e| {
        TransactionError::SerializationError(format!("reading {} count: {}", what, e))
    })?;
    usize::try_from(count.value()).map_err(|_| {
        TransactionError::SerializationError(format!("{} count {} too large", what, count.value()))
    })
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

//! Script chunk parsing and push encoding.
//!
//! A chunk is either a bare opcode or a push with its payload.

use crate::opcodes::*;
use crate::ScriptError;

/// One parsed element of a script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptChunk {
    /// The opcode byte. For direct pushes this is the payload length.
    pub op: u8,
    /// The pushed bytes; `OP_RETURN` carries the remainder of the script.
    pub data: Option<Vec<u8>>,
}

impl ScriptChunk {
    /// ASM token: hex for pushes, the opcode name otherwise.
    pub fn to_asm_string(&self) -> String {
        match (&self.data, is_push_op(self.op)) {
            (Some(data), true) => hex::encode(data),
            _ => opcode_name(self.op),
        }
    }
}

/// Decode raw script bytes into chunks.
///
/// `OP_RETURN` swallows everything after it as data, since data carrier
/// outputs are never parsed further.
///
/// # Returns
/// The chunks, or `DataTooSmall` if a push runs past the end.
pub fn decode_script(bytes: &[u8]) -> Result<Vec<ScriptChunk>, ScriptError> {
    let mut chunks = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let op = bytes[pos];
        let (header, length) = match op {
            OP_DATA_1..=OP_DATA_75 => (1, op as usize),
            OP_PUSHDATA1 => (2, read_len(bytes, pos + 1, 1)?),
            OP_PUSHDATA2 => (3, read_len(bytes, pos + 1, 2)?),
            OP_PUSHDATA4 => (5, read_len(bytes, pos + 1, 4)?),
            OP_RETURN => {
                chunks.push(ScriptChunk { op, data: Some(bytes[pos..].to_vec()) });
                break;
            }
            _ => {
                chunks.push(ScriptChunk { op, data: None });
                pos += 1;
                continue;
            }
        };
        let start = pos + header;
        let end = start.checked_add(length).ok_or(ScriptError::DataTooSmall)?;
        if end > bytes.len() {
            return Err(ScriptError::DataTooSmall);
        }
        chunks.push(ScriptChunk { op, data: Some(bytes[start..end].to_vec()) });
        pos = end;
    }

    Ok(chunks)
}

fn read_len(bytes: &[u8], at: usize, width: usize) -> Result<usize, ScriptError> {
    let field = bytes.get(at..at + width).ok_or(ScriptError::DataTooSmall)?;
    let mut le = [0u8; 4];
    le[..width].copy_from_slice(field);
    Ok(u32::from_le_bytes(le) as usize)
}

/// The minimal push prefix for a payload of `data_len` bytes.
///
/// # Returns
/// The prefix bytes, or `DataTooBig` beyond the 4-byte length limit.
pub fn push_data_prefix(data_len: usize) -> Result<Vec<u8>, ScriptError> {
    if data_len <= OP_DATA_75 as usize {
        Ok(vec![data_len as u8])
    } else if data_len <= 0xff {
        Ok(vec![OP_PUSHDATA1, data_len as u8])
    } else if data_len <= 0xffff {
        let mut buf = vec![OP_PUSHDATA2];
        buf.extend_from_slice(&(data_len as u16).to_le_bytes());
        Ok(buf)
    } else if data_len <= 0xffff_ffff {
        let mut buf = vec![OP_PUSHDATA4];
        buf.extend_from_slice(&(data_len as u32).to_le_bytes());
        Ok(buf)
    } else {
        Err(ScriptError::DataTooBig)
    }
}

//! Opcode constants for the script shapes this crate builds and recognises.

/// Push an empty byte vector.
pub const OP_0: u8 = 0x00;
/// Alias of `OP_0`.
pub const OP_FALSE: u8 = 0x00;
/// Direct push of one byte; `0x01..=0x4b` push that many bytes.
pub const OP_DATA_1: u8 = 0x01;
/// Direct push of 20 bytes (a hash160).
pub const OP_DATA_20: u8 = 0x14;
/// Direct push of 33 bytes (a compressed public key).
pub const OP_DATA_33: u8 = 0x21;
/// Direct push of 75 bytes, the largest direct push.
pub const OP_DATA_75: u8 = 0x4b;
/// Next byte is the push length.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// Next two bytes (LE) are the push length.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// Next four bytes (LE) are the push length.
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Human-readable name for an opcode, used when rendering ASM.
///
/// Opcodes outside the set above render as `OP_UNKNOWN<n>`; the core never
/// needs to interpret them.
pub fn opcode_name(op: u8) -> String {
    match op {
        OP_0 => "OP_0".to_string(),
        OP_PUSHDATA1 => "OP_PUSHDATA1".to_string(),
        OP_PUSHDATA2 => "OP_PUSHDATA2".to_string(),
        OP_PUSHDATA4 => "OP_PUSHDATA4".to_string(),
        OP_RETURN => "OP_RETURN".to_string(),
        OP_DUP => "OP_DUP".to_string(),
        OP_EQUAL => "OP_EQUAL".to_string(),
        OP_EQUALVERIFY => "OP_EQUALVERIFY".to_string(),
        OP_HASH160 => "OP_HASH160".to_string(),
        OP_CHECKSIG => "OP_CHECKSIG".to_string(),
        OP_DATA_1..=OP_DATA_75 => format!("OP_DATA_{}", op),
        _ => format!("OP_UNKNOWN{}", op),
    }
}

/// Whether `op` introduces a data push.
pub fn is_push_op(op: u8) -> bool {
    (OP_DATA_1..=OP_PUSHDATA4).contains(&op)
}

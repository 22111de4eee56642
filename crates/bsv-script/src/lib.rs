//! Locking scripts, addresses and the index-server script-hash codec.
//!
//! The settlement core only pays to and from the two standard pay-to-hash
//! forms, so script handling here is limited to building those shapes,
//! recognising them in raw outputs, and translating between addresses and
//! the reversed-SHA-256 script hashes ElectrumX servers index by.

pub mod opcodes;
pub mod chunk;
pub mod script;
pub mod address;
pub mod script_hash;

mod error;
pub use error::ScriptError;
pub use script::Script;
pub use address::{Address, AddressKind, Network};
pub use chunk::ScriptChunk;
pub use script_hash::{address_to_script_hash, script_to_address, ScriptHash, ScriptKind};

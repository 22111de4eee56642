#![deny(missing_docs)]

//! BSV merchant settlement core.
//!
//! Re-exports every workspace crate for single-crate usage, plus the
//! settlement entry points at the top level.

pub use bsv_electrum as electrum;
pub use bsv_primitives as primitives;
pub use bsv_script as script;
pub use bsv_settlement as settlement;
pub use bsv_transaction as transaction;

pub use bsv_settlement::{
    Collaborators, SendReceipt, SendRequest, SettlementConfig, SettlementError, SettlementService,
};

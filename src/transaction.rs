//! Transaction module split into types, signature hashing, validation and the
//! shielding builder

pub mod builder;
pub mod sighash;
pub mod types;
pub mod validation;

pub use builder::{BuilderError, ShieldingBuilder};
pub use sighash::{signature_hash, SighashError, NOT_AN_INPUT};
pub use types::*;
pub use validation::{check_joinsplits, check_transaction, SigningContext};

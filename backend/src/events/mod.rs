pub mod decoder;
pub mod schema;

pub use decoder::{decode, validate_grant, LedgerEvent};

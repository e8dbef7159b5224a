pub mod envelope;
pub mod kms;
pub mod pii;
pub mod time;

pub use envelope::EnvelopeEncryptor;
pub use kms::{transit_backend_from_config, TransitBackend};

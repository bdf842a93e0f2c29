//! Persistence tiers: opaque key/value backends, the encrypting wrapper the
//! durable and session tiers go through, and the bulk re-encryption toggle.

pub mod backend;
pub mod encrypted;
pub mod toggle;

use thiserror::Error;

use crate::crypto::CryptoError;

pub use backend::{FileStore, KeyValueStore, MemoryStore};
pub use encrypted::{Conversion, EncryptableStore, KeySlot};
pub use toggle::{ConversionError, StorageToggle};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("value under {0} is encrypted and no matching key is loaded")]
    Locked(String),
    #[error("value under {key} has an invalid envelope: {reason}")]
    InvalidEnvelope { key: String, reason: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

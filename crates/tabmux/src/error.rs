use thiserror::Error;

use crate::account::StateError;
use crate::channel::ChannelError;
use crate::crypto::CryptoError;
use crate::hls::HlsError;
use crate::passcode::PasscodeError;
use crate::storage::{ConversionError, StorageError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Passcode(#[from] PasscodeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Hls(#[from] HlsError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl WorkerError {
    /// Message sent back to a tab. Details stay in the worker log.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Passcode(PasscodeError::Invalid(_)) => "invalid passcode",
            Self::Passcode(PasscodeError::NotConfigured) => "passcode not configured",
            Self::Storage(StorageError::Locked(_)) => "storage locked",
            Self::State(StateError::NotReady(_)) => "state not ready",
            Self::State(StateError::InvalidAccount(_)) | Self::InvalidRequest(_) => "invalid request",
            Self::Channel(_) => "delivery failed",
            Self::Conversion(_) => "storage conversion failed",
            _ => "request failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

//! Crypto primitive engine boundary and the stateless relay tabs call into.

use std::sync::Arc;

use async_trait::async_trait;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::encoding::{base64_bytes, base64_nonce};
use crate::secret::StorageKey;

pub const DIGEST_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("invalid crypto input: {0}")]
    InvalidInput(String),
}

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "base64_nonce")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Hash and symmetric cipher operations consumed by the core.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    async fn digest(&self, input: &[u8]) -> Result<[u8; DIGEST_LEN], CryptoError>;

    async fn seal(&self, key: &StorageKey, plaintext: &[u8]) -> Result<Sealed, CryptoError>;

    async fn open(&self, key: &StorageKey, sealed: &Sealed) -> Result<Vec<u8>, CryptoError>;
}

/// SHA-256 digests and ChaCha20-Poly1305 sealing, computed in-process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCryptoEngine;

impl LocalCryptoEngine {
    pub fn shared() -> Arc<dyn CryptoEngine> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CryptoEngine for LocalCryptoEngine {
    async fn digest(&self, input: &[u8]) -> Result<[u8; DIGEST_LEN], CryptoError> {
        Ok(Sha256::digest(input).into())
    }

    async fn seal(&self, key: &StorageKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let aead = ChaCha20Poly1305::new_from_slice(key.bytes())
            .map_err(|error| CryptoError::Cipher(format!("failed to initialize cipher: {error}")))?;
        let ciphertext = aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|error| CryptoError::Cipher(format!("failed to seal payload: {error}")))?;
        Ok(Sealed {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    async fn open(&self, key: &StorageKey, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
        let aead = ChaCha20Poly1305::new_from_slice(key.bytes())
            .map_err(|error| CryptoError::Cipher(format!("failed to initialize cipher: {error}")))?;
        aead.decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|error| CryptoError::Cipher(format!("failed to open payload: {error}")))
    }
}

/// Crypto operations a tab may ask the shared process to run for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum CryptoCall {
    Digest {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Seal {
        key: StorageKey,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Open {
        key: StorageKey,
        sealed: Sealed,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CryptoReply {
    Digest {
        #[serde(with = "base64_bytes")]
        hash: Vec<u8>,
    },
    Sealed(Sealed),
    Opened {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

/// Forwards crypto calls to the engine without keeping any state.
#[derive(Clone)]
pub struct CryptoDelegate {
    engine: Arc<dyn CryptoEngine>,
}

impl CryptoDelegate {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Arc<dyn CryptoEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn invoke(&self, call: CryptoCall) -> Result<CryptoReply, CryptoError> {
        match call {
            CryptoCall::Digest { data } => {
                debug!(bytes = data.len(), "relaying digest");
                let hash = self.engine.digest(&data).await?;
                Ok(CryptoReply::Digest {
                    hash: hash.to_vec(),
                })
            }
            CryptoCall::Seal { key, data } => {
                debug!(key_id = key.id(), bytes = data.len(), "relaying seal");
                let sealed = self.engine.seal(&key, &data).await?;
                Ok(CryptoReply::Sealed(sealed))
            }
            CryptoCall::Open { key, sealed } => {
                debug!(key_id = key.id(), "relaying open");
                let data = self.engine.open(&key, &sealed).await?;
                Ok(CryptoReply::Opened { data })
            }
        }
    }
}

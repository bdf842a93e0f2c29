//! Encrypting wrapper around a [`KeyValueStore`].
//!
//! Sealed values are stored as a single JSON string
//! `enc:v1:<key_id>:<nonce_b64>:<ciphertext_b64>`. Carrying the key id in the
//! envelope makes bulk conversion resumable: a pass that was interrupted can
//! be rerun and skips entries already sealed under the current key.
//!
//! Plaintext strings that start with `enc:` are stored behind
//! [`PLAINTEXT_ESCAPE`] so they can never be mistaken for an envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{KeyValueStore, StorageError};
use crate::crypto::{CryptoEngine, NONCE_LEN, Sealed};
use crate::secret::StorageKey;

pub const ENVELOPE_PREFIX: &str = "enc:v1:";
/// Prefix added to stored plaintext strings that start with `enc:`.
pub const PLAINTEXT_ESCAPE: &str = "enc:raw:";
const RESERVED_PREFIX: &str = "enc:";

/// Contents of a [`KeySlot`], captured so a failed conversion can put them back.
#[derive(Clone, Default)]
pub struct KeyRing {
    current: Option<StorageKey>,
    previous: Option<StorageKey>,
}

/// In-memory holder of the storage key currently used for sealing.
///
/// During a passcode change the outgoing key stays reachable as `previous`
/// until every tier has been resealed.
#[derive(Default)]
pub struct KeySlot {
    ring: RwLock<KeyRing>,
}

impl KeySlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, key: StorageKey) {
        let mut ring = self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match ring.current.take() {
            Some(current) if current.id() != key.id() => ring.previous = Some(current),
            _ => {}
        }
        ring.current = Some(key);
    }

    pub fn forget_previous(&self) {
        let mut ring = self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.previous = None;
    }

    pub fn clear(&self) {
        let mut ring = self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.current = None;
        ring.previous = None;
    }

    pub fn snapshot(&self) -> KeyRing {
        self.ring
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn restore(&self, ring: KeyRing) {
        *self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = ring;
    }

    pub fn current(&self) -> Option<StorageKey> {
        let ring = self.ring.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.current.clone()
    }

    pub fn is_loaded(&self) -> bool {
        let ring = self.ring.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.current.is_some()
    }

    pub fn find(&self, key_id: &str) -> Option<StorageKey> {
        let ring = self.ring.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        [ring.current.as_ref(), ring.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|key| key.id() == key_id)
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    SealAll,
    OpenAll,
}

struct Envelope {
    key_id: String,
    sealed: Sealed,
}

/// A backend value decoded into what the tier actually holds.
enum Stored {
    Sealed(Envelope),
    Plain(Value),
}

/// One persistence tier as seen by the rest of the worker.
pub struct EncryptableStore {
    name: String,
    backend: Arc<dyn KeyValueStore>,
    keys: Arc<KeySlot>,
    crypto: Arc<dyn CryptoEngine>,
    encrypting: AtomicBool,
    writable: AtomicBool,
    /// Serializes writers with the per-key read-convert-write of [`Self::convert`].
    write_gate: Mutex<()>,
}

impl EncryptableStore {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn KeyValueStore>,
        keys: Arc<KeySlot>,
        crypto: Arc<dyn CryptoEngine>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            keys,
            crypto,
            encrypting: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            write_gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_encrypting(&self) -> bool {
        self.encrypting.load(Ordering::SeqCst)
    }

    pub fn set_encrypting(&self, encrypting: bool) {
        self.encrypting.store(encrypting, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Reads through the decrypting path.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let Some(stored) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match decode_stored(key, stored)? {
            Stored::Sealed(envelope) => self.open_envelope(key, &envelope).await.map(Some),
            Stored::Plain(value) => Ok(Some(value)),
        }
    }

    /// Reads the stored form without decrypting.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.backend.get(key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        if !self.is_writable() {
            debug!(tier = %self.name, key, "writes disabled, dropping set");
            return Ok(());
        }
        let _write = self.write_gate.lock().await;
        let stored = if self.is_encrypting() {
            let current = self
                .keys
                .current()
                .ok_or_else(|| StorageError::Locked(key.to_string()))?;
            self.seal_value(&current, &value).await?
        } else {
            escape_plain(value)
        };
        self.backend.set(key, stored).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if !self.is_writable() {
            debug!(tier = %self.name, key, "writes disabled, dropping delete");
            return Ok(());
        }
        let _write = self.write_gate.lock().await;
        self.backend.delete(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.backend.keys().await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let _write = self.write_gate.lock().await;
        self.backend.clear().await
    }

    /// Rewrites every entry of the tier in the requested form and returns the
    /// number of entries that changed. Safe to rerun after a failure.
    pub async fn convert(&self, conversion: Conversion) -> Result<usize, StorageError> {
        let current = match conversion {
            Conversion::SealAll => Some(
                self.keys
                    .current()
                    .ok_or_else(|| StorageError::Locked(format!("tier {}", self.name)))?,
            ),
            Conversion::OpenAll => None,
        };

        let mut converted = 0usize;
        for key in self.backend.keys().await? {
            // a concurrent set either lands before this read or after the write-back
            let _write = self.write_gate.lock().await;
            let Some(stored) = self.backend.get(&key).await? else {
                continue;
            };
            let rewritten = match (&current, decode_stored(&key, stored)?) {
                (Some(current), Stored::Sealed(envelope)) if envelope.key_id == current.id() => {
                    continue;
                }
                (Some(current), Stored::Sealed(envelope)) => {
                    let plain = self.open_envelope(&key, &envelope).await?;
                    self.seal_value(current, &plain).await?
                }
                (Some(current), Stored::Plain(value)) => self.seal_value(current, &value).await?,
                (None, Stored::Sealed(envelope)) => {
                    escape_plain(self.open_envelope(&key, &envelope).await?)
                }
                (None, Stored::Plain(_)) => continue,
            };
            self.backend.set(&key, rewritten).await?;
            converted += 1;
        }

        info!(
            target: "tabmux.storage",
            tier = %self.name,
            ?conversion,
            converted,
            "storage tier converted"
        );
        Ok(converted)
    }

    async fn seal_value(&self, key: &StorageKey, value: &Value) -> Result<Value, StorageError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = self.crypto.seal(key, &plaintext).await?;
        Ok(Value::String(format!(
            "{ENVELOPE_PREFIX}{}:{}:{}",
            key.id(),
            URL_SAFE_NO_PAD.encode(sealed.nonce),
            URL_SAFE_NO_PAD.encode(&sealed.ciphertext)
        )))
    }

    async fn open_envelope(&self, key: &str, envelope: &Envelope) -> Result<Value, StorageError> {
        let storage_key = self
            .keys
            .find(&envelope.key_id)
            .ok_or_else(|| StorageError::Locked(key.to_string()))?;
        let plaintext = self.crypto.open(&storage_key, &envelope.sealed).await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

pub fn is_envelope(value: &Value) -> bool {
    matches!(value, Value::String(text) if text.starts_with(ENVELOPE_PREFIX))
}

fn escape_plain(value: Value) -> Value {
    match value {
        Value::String(text) if text.starts_with(RESERVED_PREFIX) => {
            Value::String(format!("{PLAINTEXT_ESCAPE}{text}"))
        }
        other => other,
    }
}

fn decode_stored(key: &str, stored: Value) -> Result<Stored, StorageError> {
    if let Some(plain) = stored.as_str().and_then(|text| text.strip_prefix(PLAINTEXT_ESCAPE)) {
        return Ok(Stored::Plain(Value::String(plain.to_string())));
    }
    Ok(match parse_envelope(key, &stored)? {
        Some(envelope) => Stored::Sealed(envelope),
        None => Stored::Plain(stored),
    })
}

fn parse_envelope(key: &str, stored: &Value) -> Result<Option<Envelope>, StorageError> {
    let Value::String(text) = stored else {
        return Ok(None);
    };
    let Some(rest) = text.strip_prefix(ENVELOPE_PREFIX) else {
        return Ok(None);
    };
    let invalid = |reason: &str| StorageError::InvalidEnvelope {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = rest.split(':');
    let key_id = parts.next().unwrap_or_default();
    let nonce_b64 = parts.next().unwrap_or_default();
    let ciphertext_b64 = parts.next().unwrap_or_default();
    if key_id.is_empty() || parts.next().is_some() {
        return Err(invalid("unexpected envelope layout"));
    }

    let nonce_raw = URL_SAFE_NO_PAD
        .decode(nonce_b64.as_bytes())
        .map_err(|_| invalid("nonce is not base64"))?;
    let nonce: [u8; NONCE_LEN] = nonce_raw
        .as_slice()
        .try_into()
        .map_err(|_| invalid("nonce length is invalid"))?;
    let ciphertext = URL_SAFE_NO_PAD
        .decode(ciphertext_b64.as_bytes())
        .map_err(|_| invalid("payload is not base64"))?;

    Ok(Some(Envelope {
        key_id: key_id.to_string(),
        sealed: Sealed { nonce, ciphertext },
    }))
}

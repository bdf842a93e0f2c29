//! Passcode lifecycle: salted hash derivation, verification, storage key
//! derivation and the lock flag round trips to the shared process.
//!
//! Raw passcodes arrive as [`Passcode`] values and are moved into the
//! operation that uses them, so they are wiped as soon as that operation
//! returns, on success and on every error path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::account::AccountNumber;
use crate::crypto::{CryptoEngine, DIGEST_LEN};
use crate::encoding::base64_bytes;
use crate::error::Result;
use crate::message::{PasscodeChange, UsingPasscode};
use crate::secret::{Passcode, STORAGE_KEY_LEN, StorageKey};
use crate::storage::{KeyValueStore, StorageError};

/// Common-store key holding the [`PasscodeRecord`].
pub const PASSCODE_STORAGE_KEY: &str = "passcode";

/// State path of the "passcode enabled" setting on the primary account.
pub const PASSCODE_ENABLED_PATH: &str = "settings.passcode.enabled";

pub const SALT_LEN: usize = 16;

const STORAGE_KEY_CONTEXT: &[u8] = b"tabmux/storage-key";
const KEY_ID_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum PasscodeError {
    #[error("invalid passcode: {0}")]
    Invalid(String),
    #[error("no passcode is configured")]
    NotConfigured,
}

/// Salt and hash of the configured passcode. Never the passcode itself.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasscodeRecord {
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    hash: Vec<u8>,
}

impl PasscodeRecord {
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

impl fmt::Debug for PasscodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasscodeRecord")
            .field("salt_len", &self.salt.len())
            .field("hash_len", &self.hash.len())
            .finish()
    }
}

/// Evidence that a candidate matched the stored hash, carrying the storage
/// key derived from it.
pub struct PasscodeProof {
    key: StorageKey,
}

impl PasscodeProof {
    pub fn key_id(&self) -> &str {
        self.key.id()
    }
}

impl fmt::Debug for PasscodeProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasscodeProof")
            .field("key_id", &self.key.id())
            .finish()
    }
}

#[derive(Debug)]
pub enum Verification {
    NotConfigured,
    Mismatch,
    Match(PasscodeProof),
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    pub fn into_proof(self) -> Option<PasscodeProof> {
        match self {
            Self::Match(proof) => Some(proof),
            Self::NotConfigured | Self::Mismatch => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasscodeEvent {
    UsingPasscodeToggled(bool),
    LockToggled(bool),
}

/// Operations the passcode subsystem needs from the shared process.
#[async_trait]
pub trait SharedProcess: Send + Sync {
    /// Completes only after both persistence tiers have been converted.
    async fn toggle_using_passcode(&self, toggle: UsingPasscode) -> Result<()>;

    async fn change_passcode(&self, change: PasscodeChange) -> Result<()>;

    async fn save_encryption_key(&self, key: StorageKey) -> Result<()>;

    async fn is_locked(&self) -> Result<bool>;

    async fn toggle_lock_others(&self, locked: bool) -> Result<()>;

    async fn set_state_by_path(&self, account: AccountNumber, path: &str, value: Value) -> Result<()>;
}

pub struct PasscodeService {
    common: Arc<dyn KeyValueStore>,
    crypto: Arc<dyn CryptoEngine>,
    shared: Arc<dyn SharedProcess>,
    events: broadcast::Sender<PasscodeEvent>,
}

impl PasscodeService {
    pub fn new(
        common: Arc<dyn KeyValueStore>,
        crypto: Arc<dyn CryptoEngine>,
        shared: Arc<dyn SharedProcess>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            common,
            crypto,
            shared,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PasscodeEvent> {
        self.events.subscribe()
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        Ok(self.load_record().await?.is_some())
    }

    pub async fn enable(&self, passcode: Passcode) -> Result<()> {
        passcode.validate()?;
        let (record, key) = self.derive(passcode).await?;
        self.store_record(&record).await?;

        self.shared
            .set_state_by_path(AccountNumber::PRIMARY, PASSCODE_ENABLED_PATH, Value::Bool(true))
            .await?;
        self.emit(PasscodeEvent::UsingPasscodeToggled(true));
        let toggled = self
            .shared
            .toggle_using_passcode(UsingPasscode {
                enabled: true,
                key: Some(key),
            })
            .await;
        if let Err(error) = toggled {
            self.revert_enabled_flag(false).await;
            self.common.delete(PASSCODE_STORAGE_KEY).await?;
            return Err(error);
        }
        info!(target: "tabmux.passcode", "passcode enabled");
        Ok(())
    }

    pub async fn disable(&self) -> Result<()> {
        self.shared
            .set_state_by_path(AccountNumber::PRIMARY, PASSCODE_ENABLED_PATH, Value::Bool(false))
            .await?;
        self.emit(PasscodeEvent::UsingPasscodeToggled(false));
        let toggled = self
            .shared
            .toggle_using_passcode(UsingPasscode {
                enabled: false,
                key: None,
            })
            .await;
        if let Err(error) = toggled {
            self.revert_enabled_flag(true).await;
            return Err(error);
        }
        self.common.delete(PASSCODE_STORAGE_KEY).await?;
        info!(target: "tabmux.passcode", "passcode disabled");
        Ok(())
    }

    /// Puts the settings flag back after the shared process refused a toggle.
    async fn revert_enabled_flag(&self, enabled: bool) {
        let reverted = self
            .shared
            .set_state_by_path(AccountNumber::PRIMARY, PASSCODE_ENABLED_PATH, Value::Bool(enabled))
            .await;
        if let Err(error) = reverted {
            warn!(target: "tabmux.passcode", %error, "could not restore passcode setting");
        }
        self.emit(PasscodeEvent::UsingPasscodeToggled(enabled));
    }

    pub async fn verify(&self, candidate: Passcode) -> Result<Verification> {
        let Some(record) = self.load_record().await? else {
            return Ok(Verification::NotConfigured);
        };
        let hash = self.hash_with_salt(&candidate, &record.salt).await?;
        let key = self.derive_key(&candidate, &record.salt).await?;
        drop(candidate);

        if digests_match(&hash[..], &record.hash) {
            Ok(Verification::Match(PasscodeProof { key }))
        } else {
            debug!(target: "tabmux.passcode", "passcode verification mismatch");
            Ok(Verification::Mismatch)
        }
    }

    pub async fn is_my_passcode(&self, candidate: Passcode) -> Result<bool> {
        Ok(self.verify(candidate).await?.is_match())
    }

    /// Replaces the passcode. The caller proves the old one via [`Self::verify`].
    pub async fn change(&self, proof: PasscodeProof, passcode: Passcode) -> Result<()> {
        passcode.validate()?;
        if self.load_record().await?.is_none() {
            return Err(PasscodeError::NotConfigured.into());
        }
        let (record, key) = self.derive(passcode).await?;
        self.store_record(&record).await?;
        self.shared
            .change_passcode(PasscodeChange { record, key })
            .await?;
        info!(target: "tabmux.passcode", old_key_id = proof.key_id(), "passcode changed");
        Ok(())
    }

    /// Verifies `old` and, when it matches, replaces it with `new`. A wrong
    /// old passcode is reported as `false`, not as an error.
    pub async fn change_verified(&self, old: Passcode, new: Passcode) -> Result<bool> {
        match self.verify(old).await? {
            Verification::Match(proof) => {
                self.change(proof, new).await?;
                Ok(true)
            }
            Verification::Mismatch => Ok(false),
            Verification::NotConfigured => Err(PasscodeError::NotConfigured.into()),
        }
    }

    /// Hands the verified key to the shared process and unlocks other tabs.
    pub async fn unlock(&self, proof: PasscodeProof) -> Result<()> {
        self.shared.save_encryption_key(proof.key).await?;
        self.shared.toggle_lock_others(false).await?;
        self.emit(PasscodeEvent::LockToggled(false));
        Ok(())
    }

    pub async fn lock(&self) -> Result<()> {
        self.shared.toggle_lock_others(true).await?;
        self.emit(PasscodeEvent::LockToggled(true));
        Ok(())
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.shared.is_locked().await
    }

    async fn derive(&self, passcode: Passcode) -> Result<(PasscodeRecord, StorageKey)> {
        let salt: [u8; SALT_LEN] = rand::random();
        let hash = self.hash_with_salt(&passcode, &salt).await?;
        let key = self.derive_key(&passcode, &salt).await?;
        Ok((
            PasscodeRecord {
                salt: salt.to_vec(),
                hash: hash.to_vec(),
            },
            key,
        ))
    }

    async fn hash_with_salt(
        &self,
        passcode: &Passcode,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; DIGEST_LEN]>> {
        let mut salted = Zeroizing::new(Vec::with_capacity(passcode.as_bytes().len() + salt.len()));
        salted.extend_from_slice(passcode.as_bytes());
        salted.extend_from_slice(salt);
        Ok(Zeroizing::new(self.crypto.digest(&salted).await?))
    }

    async fn derive_key(&self, passcode: &Passcode, salt: &[u8]) -> Result<StorageKey> {
        let mut material = Zeroizing::new(Vec::with_capacity(
            STORAGE_KEY_CONTEXT.len() + passcode.as_bytes().len() + salt.len(),
        ));
        material.extend_from_slice(STORAGE_KEY_CONTEXT);
        material.extend_from_slice(passcode.as_bytes());
        material.extend_from_slice(salt);
        let bytes: Zeroizing<[u8; STORAGE_KEY_LEN]> =
            Zeroizing::new(self.crypto.digest(&material).await?);
        let fingerprint = self.crypto.digest(&bytes[..]).await?;
        let key_id = hex::encode(&fingerprint[..KEY_ID_BYTES]);
        Ok(StorageKey::new(key_id, bytes))
    }

    async fn load_record(&self) -> Result<Option<PasscodeRecord>> {
        let Some(value) = self.common.get(PASSCODE_STORAGE_KEY).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(value).map_err(StorageError::from)?;
        Ok(Some(record))
    }

    async fn store_record(&self, record: &PasscodeRecord) -> Result<()> {
        let value = serde_json::to_value(record).map_err(StorageError::from)?;
        self.common.set(PASSCODE_STORAGE_KEY, value).await?;
        Ok(())
    }

    fn emit(&self, event: PasscodeEvent) {
        let _ = self.events.send(event);
    }
}

/// Length check, then a comparison that touches every byte.
pub fn digests_match(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

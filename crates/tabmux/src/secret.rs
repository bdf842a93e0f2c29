//! Secret material whose memory is wiped when it goes out of scope.
//!
//! A [`Passcode`] is moved into the operation that consumes it and dropped
//! there, so every exit path (including `?` returns) zeroes the buffer.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::passcode::PasscodeError;

/// Longest passcode accepted by enable/change, counted in characters.
pub const MAX_PASSCODE_LENGTH: usize = 12;

/// Length in bytes of a storage encryption key.
pub const STORAGE_KEY_LEN: usize = 32;

/// A raw passcode as typed by the user.
///
/// Deliberately neither `Clone` nor `Serialize`: it never crosses the tab
/// boundary and never outlives the call that received it.
pub struct Passcode(Zeroizing<String>);

impl Passcode {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Checks the length rules applied when a passcode is being set.
    pub fn validate(&self) -> Result<(), PasscodeError> {
        let length = self.0.chars().count();
        if length == 0 {
            return Err(PasscodeError::Invalid("passcode is empty".to_string()));
        }
        if length > MAX_PASSCODE_LENGTH {
            return Err(PasscodeError::Invalid(format!(
                "passcode exceeds {MAX_PASSCODE_LENGTH} characters"
            )));
        }
        Ok(())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<String> for Passcode {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Passcode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passcode(<redacted>)")
    }
}

/// Symmetric key used to seal persisted values, plus a short public id so
/// sealed entries can name the key that produced them.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageKey {
    id: String,
    #[serde(with = "key_bytes")]
    bytes: Zeroizing<[u8; STORAGE_KEY_LEN]>,
}

impl StorageKey {
    pub fn new(id: impl Into<String>, bytes: Zeroizing<[u8; STORAGE_KEY_LEN]>) -> Self {
        Self {
            id: id.into(),
            bytes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn bytes(&self) -> &[u8; STORAGE_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

mod key_bytes {
    use super::*;
    use base64::Engine as _;
    use serde::de::Error as _;

    pub fn serialize<S>(
        bytes: &Zeroizing<[u8; STORAGE_KEY_LEN]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = Zeroizing::new(STANDARD.encode(&bytes[..]));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Zeroizing<[u8; STORAGE_KEY_LEN]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(D::Error::custom)?,
        );
        if decoded.len() != STORAGE_KEY_LEN {
            return Err(D::Error::custom(format!(
                "storage key must be {STORAGE_KEY_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; STORAGE_KEY_LEN]);
        key.copy_from_slice(&decoded);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn passcode_length_rules() {
        assert!(Passcode::from("1234").validate().is_ok());
        assert!(Passcode::from("").validate().is_err());
        assert!(Passcode::from("abcdefghijkl").validate().is_ok());
        assert!(Passcode::from("abcdefghijklm").validate().is_err());
        // multi-byte characters count once
        assert!(Passcode::from("ключключключ").validate().is_ok());
    }

    #[test]
    fn debug_output_never_contains_secret() {
        let passcode = Passcode::from("hunter2");
        assert!(!format!("{passcode:?}").contains("hunter2"));

        let key = StorageKey::new("k1", Zeroizing::new([7u8; STORAGE_KEY_LEN]));
        let rendered = format!("{key:?}");
        assert!(rendered.contains("k1"));
        assert!(!rendered.contains('7'));
    }

    #[test]
    fn storage_key_wire_form_round_trips() {
        let key = StorageKey::new("abcd", Zeroizing::new([3u8; STORAGE_KEY_LEN]));
        let json = serde_json::to_value(&key).unwrap();
        let decoded: StorageKey = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.id(), "abcd");
        assert_eq!(decoded.bytes(), key.bytes());
    }

    #[test]
    fn storage_key_rejects_short_material() {
        let json = serde_json::json!({ "id": "x", "bytes": STANDARD.encode([1u8; 8]) });
        assert!(serde_json::from_value::<StorageKey>(json).is_err());
    }
}

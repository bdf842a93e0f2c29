use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tabmux::secret::STORAGE_KEY_LEN;
use tabmux::storage::encrypted::is_envelope;
use tabmux::storage::{ConversionError, KeySlot, StorageError, backend};
use tabmux::{EncryptableStore, KeyValueStore, LocalCryptoEngine, StorageKey, StorageToggle};
use zeroize::Zeroizing;

/// Memory store whose first `failures` writes are refused.
struct FlakyStore {
    inner: Arc<dyn KeyValueStore>,
    failures: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: backend::memory(),
            failures: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StorageError::Backend(format!("write of {key} refused")));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}

fn key(id: &str, fill: u8) -> StorageKey {
    StorageKey::new(id, Zeroizing::new([fill; STORAGE_KEY_LEN]))
}

fn tier(name: &str, backend: Arc<dyn KeyValueStore>, keys: &Arc<KeySlot>) -> Arc<EncryptableStore> {
    Arc::new(EncryptableStore::new(
        name,
        backend,
        Arc::clone(keys),
        LocalCryptoEngine::shared(),
    ))
}

async fn seed(store: &dyn KeyValueStore) -> Result<()> {
    store.set("a1/state/theme", json!("night")).await?;
    store.set("a1/state/volume", json!(7)).await?;
    store.set("a1/storage/peers/5", json!({ "name": "Ann" })).await?;
    Ok(())
}

#[tokio::test]
async fn enabling_seals_every_entry_of_both_tiers() -> Result<()> {
    let keys = KeySlot::new();
    keys.install(key("k1", 3));
    let durable_backend = backend::memory();
    let session_backend = backend::memory();
    seed(durable_backend.as_ref()).await?;
    session_backend.set("scroll", json!(120)).await?;

    let durable = tier("durable", Arc::clone(&durable_backend), &keys);
    let session = tier("session", Arc::clone(&session_backend), &keys);
    let toggle = StorageToggle::new(vec![Arc::clone(&durable), Arc::clone(&session)], 3);

    toggle.apply(true).await?;

    let expected = [
        ("a1/state/theme", json!("night")),
        ("a1/state/volume", json!(7)),
        ("a1/storage/peers/5", json!({ "name": "Ann" })),
    ];
    for (name, value) in &expected {
        let raw = durable_backend.get(name).await?.unwrap_or(Value::Null);
        assert!(is_envelope(&raw), "{name} should be sealed");
        assert_ne!(&raw, value);
        assert_eq!(durable.get(name).await?.as_ref(), Some(value));
    }
    assert!(session_backend.get("scroll").await?.as_ref().is_some_and(is_envelope));

    toggle.apply(false).await?;
    for (name, value) in &expected {
        assert_eq!(durable_backend.get(name).await?.as_ref(), Some(value));
    }
    assert_eq!(session_backend.get("scroll").await?, Some(json!(120)));
    Ok(())
}

#[tokio::test]
async fn interrupted_conversion_is_rerun_to_completion() -> Result<()> {
    let keys = KeySlot::new();
    keys.install(key("k1", 9));
    let flaky = FlakyStore::new(2);
    seed(flaky.inner.as_ref()).await?;

    let durable = tier("durable", Arc::clone(&flaky) as Arc<dyn KeyValueStore>, &keys);
    let toggle = StorageToggle::new(vec![Arc::clone(&durable)], 3);

    toggle.apply(true).await?;
    for name in durable.keys().await? {
        let raw = durable.get_raw(&name).await?.unwrap_or(Value::Null);
        assert!(is_envelope(&raw), "{name} should be sealed");
    }
    Ok(())
}

#[tokio::test]
async fn conversion_failing_every_pass_is_reported() -> Result<()> {
    let keys = KeySlot::new();
    keys.install(key("k1", 9));
    let flaky = FlakyStore::new(u32::MAX);
    seed(flaky.inner.as_ref()).await?;

    let durable = tier("durable", Arc::clone(&flaky) as Arc<dyn KeyValueStore>, &keys);
    let toggle = StorageToggle::new(vec![durable], 2);

    let result = toggle.apply(true).await;
    assert!(matches!(
        result,
        Err(ConversionError::PartialConversion { ref tier, attempts: 2, .. }) if tier == "durable"
    ));
    Ok(())
}

#[tokio::test]
async fn failed_toggle_restores_every_write_mode() -> Result<()> {
    let keys = KeySlot::new();
    keys.install(key("k1", 4));
    let flaky = FlakyStore::new(u32::MAX);
    seed(flaky.inner.as_ref()).await?;

    let durable = tier("durable", Arc::clone(&flaky) as Arc<dyn KeyValueStore>, &keys);
    let session = tier("session", backend::memory(), &keys);
    let toggle = StorageToggle::new(vec![Arc::clone(&durable), Arc::clone(&session)], 1);

    assert!(toggle.apply(true).await.is_err());
    assert!(!durable.is_encrypting());
    assert!(!session.is_encrypting());

    // plaintext writes keep landing as plaintext
    session.set("scroll", json!(40)).await?;
    assert_eq!(session.get_raw("scroll").await?, Some(json!(40)));
    Ok(())
}

#[tokio::test]
async fn reencrypt_moves_entries_to_the_new_key() -> Result<()> {
    let keys = KeySlot::new();
    keys.install(key("old", 1));
    let raw = backend::memory();
    seed(raw.as_ref()).await?;
    let durable = tier("durable", Arc::clone(&raw), &keys);
    let toggle = StorageToggle::new(vec![Arc::clone(&durable)], 1);
    toggle.apply(true).await?;

    keys.install(key("new", 2));
    toggle.reencrypt().await?;
    keys.forget_previous();

    let sealed = raw.get("a1/state/theme").await?.unwrap_or(Value::Null);
    assert!(sealed.as_str().is_some_and(|text| text.contains(":new:")));
    assert_eq!(durable.get("a1/state/volume").await?, Some(json!(7)));
    Ok(())
}

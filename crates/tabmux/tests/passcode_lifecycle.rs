use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tabmux::message::{TabCall, UsingPasscode};
use tabmux::passcode::{PasscodeEvent, Verification};
use tabmux::port::{self, TabClient, TabHandler};
use tabmux::storage::backend;
use tabmux::storage::encrypted::is_envelope;
use tabmux::{
    Backends, Coordinator, CoordinatorConfig, KeyValueStore, LocalCryptoEngine, Passcode,
    PasscodeService,
};

async fn started() -> Result<Arc<Coordinator>> {
    let coordinator = Coordinator::new(
        CoordinatorConfig::default(),
        Backends::memory(),
        LocalCryptoEngine::shared(),
    )?;
    coordinator.start().await?;
    Ok(coordinator)
}

fn service(coordinator: &Arc<Coordinator>) -> PasscodeService {
    PasscodeService::new(
        coordinator.common(),
        coordinator.crypto_engine(),
        coordinator.local_shared(None),
    )
}

fn backends_over(durable: &Arc<dyn KeyValueStore>, common: &Arc<dyn KeyValueStore>) -> Backends {
    Backends {
        durable: Arc::clone(durable),
        session: backend::memory(),
        common: Arc::clone(common),
        hls_cache: backend::memory(),
    }
}

/// Durable and common stores left behind by a process that enabled `passcode`
/// after writing a draft.
async fn enabled_backends(passcode: &str) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn KeyValueStore>)> {
    let durable = backend::memory();
    let common = backend::memory();
    let first = Coordinator::new(
        CoordinatorConfig::default(),
        backends_over(&durable, &common),
        LocalCryptoEngine::shared(),
    )?;
    first.start().await?;
    first.durable().set("a1/state/draft", json!("secret")).await?;
    service(&first).enable(Passcode::new(passcode)).await?;
    Ok((durable, common))
}

#[derive(Default)]
struct LockRecorder {
    seen: Mutex<Vec<bool>>,
}

impl LockRecorder {
    fn seen(&self) -> Vec<bool> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TabHandler for LockRecorder {
    async fn handle(&self, call: TabCall) -> Result<Value, String> {
        if let TabCall::ToggleLock { locked } = call {
            self.seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(locked);
        }
        Ok(Value::Null)
    }
}

async fn connect(coordinator: &Arc<Coordinator>, handler: Arc<LockRecorder>) -> Result<TabClient> {
    let (tab, worker) = port::pair();
    let serving = Arc::clone(coordinator);
    tokio::spawn(async move { serving.serve(worker).await });
    let client = TabClient::connect(tab, handler);
    // the answer proves the tab is registered
    client.request(tabmux::WorkerRequest::IsLocked).await?;
    Ok(client)
}

async fn eventually(mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("condition not reached in time"));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn enable_then_verify_then_disable() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);
    let mut events = passcodes.subscribe();

    assert!(matches!(
        passcodes.verify(Passcode::new("1234")).await?,
        Verification::NotConfigured
    ));

    passcodes.enable(Passcode::new("1234")).await?;
    assert!(passcodes.is_enabled().await?);
    assert!(passcodes.verify(Passcode::new("1234")).await?.is_match());
    assert_eq!(events.recv().await?, PasscodeEvent::UsingPasscodeToggled(true));

    let settings = coordinator.durable().get("a1/state/settings").await?;
    assert_eq!(settings, Some(json!({ "passcode": { "enabled": true } })));

    passcodes.disable().await?;
    assert!(!passcodes.is_enabled().await?);
    assert!(matches!(
        passcodes.verify(Passcode::new("1234")).await?,
        Verification::NotConfigured
    ));
    assert!(!passcodes.is_my_passcode(Passcode::new("1234")).await?);
    Ok(())
}

#[tokio::test]
async fn different_passcode_is_a_plain_mismatch() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);
    passcodes.enable(Passcode::new("2580")).await?;

    for wrong in ["2581", "0852", "25800", "a"] {
        assert!(matches!(
            passcodes.verify(Passcode::new(wrong)).await?,
            Verification::Mismatch
        ));
    }
    Ok(())
}

#[tokio::test]
async fn passcode_length_is_bounded() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);

    assert!(passcodes.enable(Passcode::new("")).await.is_err());
    assert!(passcodes.enable(Passcode::new("1234567890123")).await.is_err());
    assert!(!passcodes.is_enabled().await?);

    passcodes.enable(Passcode::new("123456789012")).await?;
    assert!(passcodes.is_enabled().await?);
    Ok(())
}

#[tokio::test]
async fn change_swaps_passcode_and_keeps_data_readable() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);
    coordinator
        .durable()
        .set("a1/state/draft", json!({ "text": "hi" }))
        .await?;

    passcodes.enable(Passcode::new("1111")).await?;
    let before = coordinator.durable().get_raw("a1/state/draft").await?;
    assert!(before.as_ref().is_some_and(is_envelope));

    let proof = passcodes
        .verify(Passcode::new("1111"))
        .await?
        .into_proof()
        .ok_or_else(|| anyhow!("old passcode should verify"))?;
    passcodes.change(proof, Passcode::new("2222")).await?;

    assert!(passcodes.verify(Passcode::new("2222")).await?.is_match());
    assert!(!passcodes.verify(Passcode::new("1111")).await?.is_match());

    let after = coordinator.durable().get_raw("a1/state/draft").await?;
    assert!(after.as_ref().is_some_and(is_envelope));
    assert_ne!(before, after);
    assert_eq!(
        coordinator.durable().get("a1/state/draft").await?,
        Some(json!({ "text": "hi" }))
    );
    Ok(())
}

#[tokio::test]
async fn change_requires_the_current_passcode() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);
    assert!(
        passcodes
            .change_verified(Passcode::new("1"), Passcode::new("2"))
            .await
            .is_err()
    );

    passcodes.enable(Passcode::new("1357")).await?;
    assert!(
        !passcodes
            .change_verified(Passcode::new("0000"), Passcode::new("2468"))
            .await?
    );
    assert!(passcodes.verify(Passcode::new("1357")).await?.is_match());

    assert!(
        passcodes
            .change_verified(Passcode::new("1357"), Passcode::new("2468"))
            .await?
    );
    assert!(passcodes.verify(Passcode::new("2468")).await?.is_match());
    assert!(!passcodes.verify(Passcode::new("1357")).await?.is_match());
    Ok(())
}

#[tokio::test]
async fn lock_flag_follows_passcode_mode() -> Result<()> {
    let coordinator = started().await?;
    let passcodes = service(&coordinator);

    // without a passcode nothing is ever locked
    assert!(!passcodes.is_locked().await?);

    passcodes.enable(Passcode::new("9999")).await?;
    assert!(!passcodes.is_locked().await?);

    passcodes.lock().await?;
    assert!(passcodes.is_locked().await?);

    let proof = passcodes
        .verify(Passcode::new("9999"))
        .await?
        .into_proof()
        .ok_or_else(|| anyhow!("passcode should verify"))?;
    passcodes.unlock(proof).await?;
    assert!(!passcodes.is_locked().await?);
    Ok(())
}

#[tokio::test]
async fn repeated_lock_broadcast_converges() -> Result<()> {
    let coordinator = started().await?;
    let first = Arc::new(LockRecorder::default());
    let second = Arc::new(LockRecorder::default());
    let _first_client = connect(&coordinator, Arc::clone(&first)).await?;
    let _second_client = connect(&coordinator, Arc::clone(&second)).await?;

    assert_eq!(coordinator.set_locked(true, None), 2);
    assert_eq!(coordinator.set_locked(true, None), 2);

    eventually(|| first.seen().len() == 2 && second.seen().len() == 2).await?;
    assert_eq!(first.seen().last(), Some(&true));
    assert_eq!(second.seen().last(), Some(&true));
    Ok(())
}

#[tokio::test]
async fn unlock_from_a_tab_skips_that_tab() -> Result<()> {
    let coordinator = started().await?;
    let origin = Arc::new(LockRecorder::default());
    let other = Arc::new(LockRecorder::default());
    let origin_client = Arc::new(connect(&coordinator, Arc::clone(&origin)).await?);
    let _other_client = connect(&coordinator, Arc::clone(&other)).await?;

    let passcodes = PasscodeService::new(
        coordinator.common(),
        coordinator.crypto_engine(),
        Arc::clone(&origin_client) as Arc<dyn tabmux::SharedProcess>,
    );
    passcodes.enable(Passcode::new("4321")).await?;
    passcodes.lock().await?;
    assert!(passcodes.is_locked().await?);

    eventually(|| other.seen() == vec![true]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(origin.seen().is_empty());
    Ok(())
}

#[tokio::test]
async fn restart_with_a_passcode_comes_up_locked() -> Result<()> {
    let (durable, common) = enabled_backends("1234").await?;
    assert!(durable.get("a1/state/draft").await?.as_ref().is_some_and(is_envelope));

    let restarted = Coordinator::new(
        CoordinatorConfig::default(),
        backends_over(&durable, &common),
        LocalCryptoEngine::shared(),
    )?;
    restarted.start().await?;
    let passcodes = service(&restarted);
    assert!(passcodes.is_enabled().await?);
    assert!(restarted.is_locked().await);
    assert!(restarted.durable().get("a1/state/draft").await.is_err());

    let proof = passcodes
        .verify(Passcode::new("1234"))
        .await?
        .into_proof()
        .ok_or_else(|| anyhow!("stored passcode should verify"))?;
    passcodes.unlock(proof).await?;
    assert!(!restarted.is_locked().await);
    assert_eq!(
        restarted.durable().get("a1/state/draft").await?,
        Some(json!("secret"))
    );
    Ok(())
}

#[tokio::test]
async fn lock_state_is_answered_before_start() -> Result<()> {
    let fresh = Coordinator::new(
        CoordinatorConfig::default(),
        Backends::memory(),
        LocalCryptoEngine::shared(),
    )?;
    assert!(!tokio::time::timeout(Duration::from_secs(1), fresh.is_locked()).await?);

    let (durable, common) = enabled_backends("8642").await?;
    let unstarted = Coordinator::new(
        CoordinatorConfig::default(),
        backends_over(&durable, &common),
        LocalCryptoEngine::shared(),
    )?;
    assert!(tokio::time::timeout(Duration::from_secs(1), unstarted.is_locked()).await?);
    Ok(())
}

#[tokio::test]
async fn failed_disable_keeps_passcode_mode() -> Result<()> {
    let (durable, common) = enabled_backends("1234").await?;
    let restarted = Coordinator::new(
        CoordinatorConfig::default(),
        backends_over(&durable, &common),
        LocalCryptoEngine::shared(),
    )?;
    restarted.start().await?;

    // no key is loaded, so sealed entries cannot be opened
    let disabled = restarted
        .toggle_using_passcode(
            UsingPasscode {
                enabled: false,
                key: None,
            },
            None,
        )
        .await;
    assert!(disabled.is_err());

    assert!(restarted.is_using_passcode());
    assert!(restarted.is_locked().await);
    assert!(restarted.durable().is_encrypting());
    assert!(restarted.session().is_encrypting());
    assert!(durable.get("a1/state/draft").await?.as_ref().is_some_and(is_envelope));
    Ok(())
}

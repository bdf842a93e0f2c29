//! The shared process: one explicitly constructed object owning the tab
//! registry, account states, lock flag and storage tiers. Every tab port is
//! served by [`Coordinator::serve`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::account::{AccountNumber, AccountState, StateError, StatePush};
use crate::channel::Hub;
use crate::config::CoordinatorConfig;
use crate::crypto::{CryptoDelegate, CryptoEngine};
use crate::error::{Result, WorkerError};
use crate::hls::{DocumentSource, QualityFileRewriter, TabDocumentSource};
use crate::message::{
    Frame, MirrorBatch, Outcome, PasscodeChange, SessionStorageOp, StateChange, TabCall,
    UsingPasscode, WorkerRequest,
};
use crate::passcode::{PASSCODE_STORAGE_KEY, PasscodeError, SharedProcess};
use crate::port::PortIo;
use crate::registry::{EndpointId, Registration, TabRegistry};
use crate::secret::StorageKey;
use crate::storage::{EncryptableStore, KeySlot, KeyValueStore, StorageToggle, backend};

/// Common-store key reset when the first tab of the process connects.
pub const NOTIFICATIONS_COUNT_KEY: &str = "notificationsCount";

/// Raw backends behind the coordinator's storage tiers.
pub struct Backends {
    pub durable: Arc<dyn KeyValueStore>,
    pub session: Arc<dyn KeyValueStore>,
    /// Plaintext settings shared by all accounts, including the passcode record.
    pub common: Arc<dyn KeyValueStore>,
    /// Fetched HLS quality playlists.
    pub hls_cache: Arc<dyn KeyValueStore>,
}

impl Backends {
    pub fn memory() -> Self {
        Self {
            durable: backend::memory(),
            session: backend::memory(),
            common: backend::memory(),
            hls_cache: backend::memory(),
        }
    }
}

struct IntervalTask {
    owner: EndpointId,
    task: JoinHandle<()>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<TabRegistry>,
    hub: Hub,
    durable: Arc<EncryptableStore>,
    session: Arc<EncryptableStore>,
    common: Arc<dyn KeyValueStore>,
    keys: Arc<KeySlot>,
    toggle: StorageToggle,
    crypto: CryptoDelegate,
    rewriter: Option<Arc<QualityFileRewriter>>,
    accounts: StdMutex<BTreeMap<AccountNumber, Arc<AccountState>>>,
    changes: broadcast::Sender<StateChange>,
    using_passcode: watch::Sender<Option<bool>>,
    locked: AtomicBool,
    passcode_ops: Mutex<()>,
    intervals: StdMutex<HashMap<u64, IntervalTask>>,
    interval_counter: AtomicU64,
    environment: StdMutex<Option<Value>>,
    service_worker_online: AtomicBool,
    last_activity: StdMutex<Instant>,
    shutdown: watch::Sender<bool>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds a coordinator whose HLS documents are fetched through tabs.
    pub fn new(
        config: CoordinatorConfig,
        backends: Backends,
        crypto: Arc<dyn CryptoEngine>,
    ) -> Result<Arc<Self>> {
        Self::build(config, backends, crypto, None)
    }

    pub fn with_documents(
        config: CoordinatorConfig,
        backends: Backends,
        crypto: Arc<dyn CryptoEngine>,
        documents: Arc<dyn DocumentSource>,
    ) -> Result<Arc<Self>> {
        Self::build(config, backends, crypto, Some(documents))
    }

    fn build(
        config: CoordinatorConfig,
        backends: Backends,
        crypto: Arc<dyn CryptoEngine>,
        documents: Option<Arc<dyn DocumentSource>>,
    ) -> Result<Arc<Self>> {
        let registry = TabRegistry::new();
        let hub = Hub::new(Arc::clone(&registry), config.call_timeout);
        let keys = KeySlot::new();
        let durable = Arc::new(EncryptableStore::new(
            "durable",
            backends.durable,
            Arc::clone(&keys),
            Arc::clone(&crypto),
        ));
        let session = Arc::new(EncryptableStore::new(
            "session",
            backends.session,
            Arc::clone(&keys),
            Arc::clone(&crypto),
        ));
        let toggle = StorageToggle::new(
            vec![Arc::clone(&durable), Arc::clone(&session)],
            config.conversion_max_attempts,
        );
        let rewriter = match &config.stream_origin {
            Some(origin) => {
                let documents = documents.unwrap_or_else(|| {
                    Arc::new(TabDocumentSource::new(hub.clone())) as Arc<dyn DocumentSource>
                });
                Some(Arc::new(QualityFileRewriter::new(
                    documents,
                    backends.hls_cache,
                    origin,
                )?))
            }
            None => None,
        };
        let (changes, _) = broadcast::channel(256);
        let (using_passcode, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            registry,
            hub,
            durable,
            session,
            common: backends.common,
            keys,
            toggle,
            crypto: CryptoDelegate::new(crypto),
            rewriter,
            accounts: StdMutex::new(BTreeMap::new()),
            changes,
            using_passcode,
            locked: AtomicBool::new(true),
            passcode_ops: Mutex::new(()),
            intervals: StdMutex::new(HashMap::new()),
            interval_counter: AtomicU64::new(1),
            environment: StdMutex::new(None),
            service_worker_online: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
            shutdown,
            background: StdMutex::new(Vec::new()),
        }))
    }

    /// Resolves passcode mode from the stored record and starts the
    /// background tasks.
    ///
    /// Until this runs, [`Self::is_locked`] reads the record directly.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let using_passcode = self.common.get(PASSCODE_STORAGE_KEY).await?.is_some();
        for tier in self.toggle.tiers() {
            tier.set_encrypting(using_passcode);
        }
        self.using_passcode.send_replace(Some(using_passcode));
        info!(using_passcode, "coordinator started");

        let mut background = lock_std(&self.background);
        background.push(self.spawn_change_relay());
        if let Some(timeout) = self.config.auto_lock.timeout() {
            background.push(self.spawn_auto_lock(timeout));
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn durable(&self) -> &Arc<EncryptableStore> {
        &self.durable
    }

    pub fn session(&self) -> &Arc<EncryptableStore> {
        &self.session
    }

    pub fn common(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.common)
    }

    pub fn crypto_engine(&self) -> Arc<dyn CryptoEngine> {
        self.crypto.engine()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn environment(&self) -> Option<Value> {
        lock_std(&self.environment).clone()
    }

    pub fn is_service_worker_online(&self) -> bool {
        self.service_worker_online.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("coordinator shutting down");
        for task in lock_std(&self.background).drain(..) {
            task.abort();
        }
        for (_, interval) in lock_std(&self.intervals).drain() {
            interval.task.abort();
        }
    }

    /// In-process handle for a passcode service running next to the
    /// coordinator, acting on behalf of `origin`.
    pub fn local_shared(self: &Arc<Self>, origin: Option<EndpointId>) -> Arc<dyn SharedProcess> {
        Arc::new(LocalShared {
            coordinator: Arc::clone(self),
            origin,
        })
    }

    /// The state store of `number`, created on first use.
    pub fn account(&self, number: AccountNumber) -> Arc<AccountState> {
        let mut accounts = lock_std(&self.accounts);
        Arc::clone(accounts.entry(number).or_insert_with(|| {
            debug!(account = number.get(), "account state created");
            Arc::new(AccountState::new(
                number,
                Arc::clone(&self.durable),
                self.changes.clone(),
            ))
        }))
    }

    fn known_accounts(&self) -> Vec<Arc<AccountState>> {
        lock_std(&self.accounts).values().cloned().collect()
    }

    /// Serves one tab until its port closes or the coordinator shuts down.
    pub async fn serve(self: &Arc<Self>, io: PortIo) {
        let PortIo {
            outbound,
            mut inbound,
        } = io;
        let registration = self.registry.add_tab(outbound);
        let _lease = self.registry.lease(registration.id);
        self.on_connect(&registration).await;

        let mut shutdown = self.shutdown.subscribe();
        while !self.is_shutting_down() {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    self.on_frame(&registration, frame).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.clear_intervals_of(registration.id);
        registration.sender.fail_pending().await;
        debug!(endpoint = %registration.id, "tab port closed");
    }

    async fn on_connect(&self, registration: &Registration) {
        if registration.first {
            if let Err(error) = self
                .common
                .set(NOTIFICATIONS_COUNT_KEY, Value::Object(Map::new()))
                .await
            {
                warn!(%error, "failed to reset notifications count");
            }
            return;
        }
        for account in self.known_accounts() {
            self.mirror_account(registration.id, &account).await;
        }
    }

    async fn mirror_account(&self, target: EndpointId, account: &AccountState) {
        for category in &self.config.mirrored_categories {
            let entries = match account.entries(category).await {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(account = account.number().get(), category = %category, %error, "mirror read failed");
                    continue;
                }
            };
            if entries.is_empty() {
                continue;
            }
            let batch = MirrorBatch {
                account: account.number(),
                category: category.clone(),
                entries,
            };
            if let Err(error) = self.hub.invoke_void(target, TabCall::Mirror(batch)) {
                warn!(endpoint = %target, %error, "mirror delivery failed");
                return;
            }
        }
    }

    async fn on_frame(self: &Arc<Self>, registration: &Registration, frame: Frame) {
        match frame {
            Frame::Request {
                id,
                request: WorkerRequest::State(push),
            } => {
                // plans are ordered by arrival, only the apply runs detached
                self.touch();
                self.handle_state(push);
                if let Err(error) = registration.sender.respond(id, Outcome::Ok(Value::Null)) {
                    debug!(endpoint = %registration.id, request = "state", %error, "response dropped");
                }
            }
            Frame::Request { id, request } => {
                self.touch();
                let coordinator = Arc::clone(self);
                let sender = Arc::clone(&registration.sender);
                let origin = registration.id;
                tokio::spawn(async move {
                    let name = request.name();
                    let outcome = match coordinator.dispatch(origin, request).await {
                        Ok(value) => Outcome::Ok(value),
                        Err(error) => {
                            error!(endpoint = %origin, request = name, %error, "request failed");
                            Outcome::Err(error.public_message().to_string())
                        }
                    };
                    if let Err(error) = sender.respond(id, outcome) {
                        debug!(endpoint = %origin, request = name, %error, "response dropped");
                    }
                });
            }
            Frame::Response { id, outcome } => {
                registration.sender.resolve(id, outcome).await;
            }
            Frame::Call { .. } => {
                warn!(endpoint = %registration.id, "tab sent a call frame, ignoring");
            }
        }
    }

    pub async fn dispatch(self: &Arc<Self>, origin: EndpointId, request: WorkerRequest) -> Result<Value> {
        match request {
            WorkerRequest::Environment(environment) => {
                *lock_std(&self.environment) = Some(environment);
                Ok(Value::Null)
            }
            WorkerRequest::Crypto(call) => {
                let reply = self.crypto.invoke(call).await?;
                Ok(serde_json::to_value(reply)?)
            }
            WorkerRequest::State(push) => {
                self.handle_state(push);
                Ok(Value::Null)
            }
            WorkerRequest::ToggleStorages {
                enabled,
                clear_write,
            } => {
                self.toggle_storages(enabled, clear_write).await?;
                Ok(Value::Null)
            }
            WorkerRequest::Event { name, payload } => {
                debug!(endpoint = %origin, event = %name, "relaying event");
                self.hub
                    .invoke_except(&TabCall::Event { name, payload }, Some(origin));
                Ok(Value::Null)
            }
            WorkerRequest::ServiceWorkerOnline { online } => {
                self.service_worker_online.store(online, Ordering::SeqCst);
                Ok(Value::Null)
            }
            WorkerRequest::SetInterval { timeout_ms } => {
                Ok(Value::from(self.set_interval(origin, timeout_ms)))
            }
            WorkerRequest::ClearInterval { id } => {
                self.clear_interval(id);
                Ok(Value::Null)
            }
            WorkerRequest::Terminate => {
                self.shutdown();
                Ok(Value::Null)
            }
            WorkerRequest::ToggleUsingPasscode(toggle) => {
                self.toggle_using_passcode(toggle, Some(origin)).await?;
                Ok(Value::Null)
            }
            WorkerRequest::ChangePasscode(change) => {
                self.change_passcode(change).await?;
                Ok(Value::Null)
            }
            WorkerRequest::IsLocked => Ok(Value::Bool(self.is_locked().await)),
            WorkerRequest::ToggleLockOthers { locked } => {
                self.set_locked(locked, Some(origin));
                Ok(Value::Null)
            }
            WorkerRequest::SaveEncryptionKey(key) => {
                self.save_encryption_key(key);
                Ok(Value::Null)
            }
            WorkerRequest::SessionStorage(operation) => self.session_storage(operation).await,
            WorkerRequest::SetStateByPath {
                account,
                path,
                value,
            } => {
                self.account(account).set_by_path(&path, value).await?;
                Ok(Value::Null)
            }
            WorkerRequest::GetState { account, key } => {
                let state = self.account(account);
                let value = tokio::time::timeout(self.config.call_timeout, state.get(&key))
                    .await
                    .map_err(|_| StateError::NotReady(account))??;
                Ok(value.unwrap_or(Value::Null))
            }
            WorkerRequest::HlsQualityFile { doc_id, account } => {
                let rewriter = self.rewriter.as_ref().ok_or_else(|| {
                    WorkerError::InvalidRequest("hls streaming is not configured".to_string())
                })?;
                Ok(Value::String(rewriter.rewrite(&doc_id, account).await?))
            }
        }
    }

    /// Starts merging a pushed baseline. Readers of the account block until
    /// the merge resolves; the push itself is acknowledged immediately.
    pub fn handle_state(&self, push: StatePush) {
        let account = self.account(push.account);
        info!(
            account = push.account.get(),
            keys = push.state.len(),
            pushed = push.pushed_keys.len(),
            "state pushed"
        );
        let plan = account.begin(&push);
        tokio::spawn(async move {
            // failures are logged by apply and retried by the next push
            let _ = account.apply(plan).await;
        });
    }

    async fn toggle_storages(&self, enabled: bool, clear_write: bool) -> Result<()> {
        for tier in self.toggle.tiers() {
            tier.set_writable(enabled);
            if !enabled && clear_write {
                tier.clear().await?;
            }
        }
        info!(target: "tabmux.storage", enabled, clear_write, "storage writes toggled");
        Ok(())
    }

    async fn session_storage(&self, operation: SessionStorageOp) -> Result<Value> {
        match operation {
            SessionStorageOp::Get { key } => Ok(self.session.get(&key).await?.unwrap_or(Value::Null)),
            SessionStorageOp::Set { key, value } => {
                self.session.set(&key, value).await?;
                Ok(Value::Null)
            }
            SessionStorageOp::Delete { key } => {
                self.session.delete(&key).await?;
                Ok(Value::Null)
            }
        }
    }

    fn set_interval(&self, owner: EndpointId, timeout_ms: u64) -> u64 {
        let id = self.interval_counter.fetch_add(1, Ordering::SeqCst);
        let hub = self.hub.clone();
        let period = Duration::from_millis(timeout_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if hub
                    .invoke_void(owner, TabCall::IntervalCallback { id })
                    .is_err()
                {
                    debug!(endpoint = %owner, interval = id, "interval owner gone");
                    break;
                }
            }
        });
        lock_std(&self.intervals).insert(id, IntervalTask { owner, task });
        debug!(endpoint = %owner, interval = id, timeout_ms, "interval started");
        id
    }

    fn clear_interval(&self, id: u64) {
        if let Some(interval) = lock_std(&self.intervals).remove(&id) {
            interval.task.abort();
        }
    }

    fn clear_intervals_of(&self, owner: EndpointId) {
        lock_std(&self.intervals).retain(|_, interval| {
            if interval.owner == owner {
                interval.task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Enters or leaves passcode mode and converts both tiers before returning.
    pub async fn toggle_using_passcode(
        &self,
        toggle: UsingPasscode,
        origin: Option<EndpointId>,
    ) -> Result<()> {
        let _passcode_op = self.passcode_ops.lock().await;
        let enabled = toggle.enabled;
        let ring = self.keys.snapshot();
        if enabled {
            let key = toggle.key.ok_or_else(|| {
                WorkerError::InvalidRequest("enabling a passcode requires a storage key".to_string())
            })?;
            self.keys.install(key);
        }

        if let Err(error) = self.toggle.apply(enabled).await {
            warn!(target: "tabmux.passcode", enabled, %error, "storage conversion failed, rolling back");
            match self.toggle.apply(!enabled).await {
                Ok(()) => self.keys.restore(ring),
                // sealed entries may remain, keep whatever key opens them
                Err(rollback) => {
                    warn!(target: "tabmux.passcode", %rollback, "storage rollback failed");
                }
            }
            return Err(error.into());
        }
        if enabled {
            self.keys.forget_previous();
        } else {
            self.keys.clear();
        }
        self.using_passcode.send_replace(Some(enabled));
        self.locked.store(false, Ordering::SeqCst);
        self.hub
            .invoke_except(&TabCall::ToggleUsingPasscode { enabled }, origin);
        info!(target: "tabmux.passcode", enabled, "passcode mode toggled");
        Ok(())
    }

    pub async fn change_passcode(&self, change: PasscodeChange) -> Result<()> {
        let _passcode_op = self.passcode_ops.lock().await;
        if !self.is_using_passcode() {
            return Err(PasscodeError::NotConfigured.into());
        }
        let record = serde_json::to_value(&change.record)?;
        self.common.set(PASSCODE_STORAGE_KEY, record).await?;
        self.keys.install(change.key);
        self.toggle.reencrypt().await?;
        self.keys.forget_previous();
        info!(target: "tabmux.passcode", "storage resealed under new passcode");
        Ok(())
    }

    pub fn save_encryption_key(&self, key: StorageKey) {
        debug!(target: "tabmux.passcode", key_id = key.id(), "storage key loaded");
        self.keys.install(key);
    }

    /// Locked state as tabs see it: never locked without a passcode.
    pub async fn is_locked(&self) -> bool {
        let resolved = *self.using_passcode.borrow();
        let using = match resolved {
            Some(using) => using,
            None => match self.common.get(PASSCODE_STORAGE_KEY).await {
                Ok(record) => record.is_some(),
                Err(error) => {
                    warn!(target: "tabmux.passcode", %error, "passcode record unreadable, reporting locked");
                    true
                }
            },
        };
        using && self.locked.load(Ordering::SeqCst)
    }

    /// Stores the flag and tells every tab except `origin`.
    pub fn set_locked(&self, locked: bool, origin: Option<EndpointId>) -> usize {
        self.locked.store(locked, Ordering::SeqCst);
        let delivered = self
            .hub
            .invoke_except(&TabCall::ToggleLock { locked }, origin);
        info!(target: "tabmux.passcode", locked, delivered, "lock state broadcast");
        delivered
    }

    pub fn is_using_passcode(&self) -> bool {
        matches!(*self.using_passcode.borrow(), Some(true))
    }

    fn touch(&self) {
        *lock_std(&self.last_activity) = Instant::now();
    }

    fn spawn_change_relay(&self) -> JoinHandle<()> {
        let mut changes = self.changes.subscribe();
        let hub = self.hub.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        hub.invoke_except(&TabCall::StateChanged(change), None);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "state change relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_auto_lock(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let period = self.config.auto_lock_check_period;
        info!(timeout_secs = timeout.as_secs(), "auto-lock enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if !coordinator.is_using_passcode() || coordinator.locked.load(Ordering::SeqCst) {
                    continue;
                }
                let idle = lock_std(&coordinator.last_activity).elapsed();
                if idle >= timeout {
                    info!(target: "tabmux.passcode", idle_secs = idle.as_secs(), "auto-locking");
                    coordinator.set_locked(true, None);
                }
            }
        })
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LocalShared {
    coordinator: Arc<Coordinator>,
    origin: Option<EndpointId>,
}

#[async_trait]
impl SharedProcess for LocalShared {
    async fn toggle_using_passcode(&self, toggle: UsingPasscode) -> Result<()> {
        self.coordinator
            .toggle_using_passcode(toggle, self.origin)
            .await
    }

    async fn change_passcode(&self, change: PasscodeChange) -> Result<()> {
        self.coordinator.change_passcode(change).await
    }

    async fn save_encryption_key(&self, key: StorageKey) -> Result<()> {
        self.coordinator.save_encryption_key(key);
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.coordinator.is_locked().await)
    }

    async fn toggle_lock_others(&self, locked: bool) -> Result<()> {
        self.coordinator.set_locked(locked, self.origin);
        Ok(())
    }

    async fn set_state_by_path(&self, account: AccountNumber, path: &str, value: Value) -> Result<()> {
        Ok(self
            .coordinator
            .account(account)
            .set_by_path(path, value)
            .await?)
    }
}

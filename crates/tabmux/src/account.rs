//! Per-account state and the reset/merge protocol run on every server push.
//!
//! Each account moves through `Uninitialized -> AwaitingPlan -> Merging ->
//! Ready`. Readers wait on the phase watch until `Ready`; a merge that fails
//! leaves the account in `AwaitingPlan` until the next push succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::message::StateChange;
use crate::storage::{EncryptableStore, StorageError};

/// Highest account slot the application supports.
pub const MAX_ACCOUNTS: u8 = 4;

/// Storage category whose reset keeps the signed-in user's own record.
pub const USERS_CATEGORY: &str = "users";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("account number {0} is outside 1..={MAX_ACCOUNTS}")]
    InvalidAccount(u8),
    #[error("invalid state path {0:?}")]
    InvalidPath(String),
    #[error("account {0} has no merged state yet")]
    NotReady(AccountNumber),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AccountNumber(u8);

impl AccountNumber {
    /// The only account whose merge batch includes common entries.
    pub const PRIMARY: Self = Self(1);

    pub fn new(number: u8) -> Result<Self, StateError> {
        if (1..=MAX_ACCOUNTS).contains(&number) {
            Ok(Self(number))
        } else {
            Err(StateError::InvalidAccount(number))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (1..=MAX_ACCOUNTS).map(Self)
    }
}

impl TryFrom<u8> for AccountNumber {
    type Error = StateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountNumber> for u8 {
    fn from(value: AccountNumber) -> Self {
        value.0
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Baseline pushed by the network layer for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePush {
    pub account: AccountNumber,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub common: Map<String, Value>,
    #[serde(default)]
    pub reset_storages: BTreeSet<String>,
    #[serde(default)]
    pub refetch_storages: BTreeSet<String>,
    #[serde(default)]
    pub pushed_keys: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub old_version: Option<String>,
    #[serde(default)]
    pub new_version: Option<String>,
}

impl StatePush {
    pub fn new(account: AccountNumber) -> Self {
        Self {
            account,
            state: Map::new(),
            common: Map::new(),
            reset_storages: BTreeSet::new(),
            refetch_storages: BTreeSet::new(),
            pushed_keys: Vec::new(),
            user_id: None,
            old_version: None,
            new_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    /// Wipe the category except these ids.
    Keep(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct ResetPlan {
    pub account: AccountNumber,
    pub generation: u64,
    pub resets: BTreeMap<String, ResetScope>,
    pub refetch: BTreeSet<String>,
    /// Keys the server already knows about; merging them emits no change.
    pub acknowledged: BTreeSet<String>,
    pub batch: Vec<(String, Value)>,
}

impl ResetPlan {
    pub fn build(push: &StatePush, generation: u64) -> Self {
        let resets = push
            .reset_storages
            .iter()
            .map(|category| {
                let scope = match &push.user_id {
                    Some(user_id) if category == USERS_CATEGORY => {
                        ResetScope::Keep(BTreeSet::from([user_id.clone()]))
                    }
                    _ => ResetScope::All,
                };
                (category.clone(), scope)
            })
            .collect();

        let mut acknowledged: BTreeSet<String> = push.pushed_keys.iter().cloned().collect();
        let mut merged = Map::new();
        if push.account.is_primary() {
            for (key, value) in &push.common {
                merged.insert(key.clone(), value.clone());
                acknowledged.insert(key.clone());
            }
        }
        for (key, value) in &push.state {
            merged.insert(key.clone(), value.clone());
        }

        Self {
            account: push.account,
            generation,
            resets,
            refetch: push.refetch_storages.clone(),
            acknowledged,
            batch: merged.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPhase {
    Uninitialized,
    AwaitingPlan,
    Merging,
    Ready,
}

#[derive(Debug, Clone, Default)]
pub struct AccountMeta {
    pub user_id: Option<String>,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
}

/// What a successful merge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub changed: usize,
    pub removed: usize,
    pub refetch: BTreeSet<String>,
}

pub struct AccountState {
    number: AccountNumber,
    store: Arc<EncryptableStore>,
    phase: watch::Sender<AccountPhase>,
    planned: AtomicU64,
    applied: AtomicU64,
    merge_lock: Mutex<()>,
    meta: StdMutex<AccountMeta>,
    changes: broadcast::Sender<StateChange>,
}

impl AccountState {
    pub fn new(
        number: AccountNumber,
        store: Arc<EncryptableStore>,
        changes: broadcast::Sender<StateChange>,
    ) -> Self {
        let (phase, _) = watch::channel(AccountPhase::Uninitialized);
        Self {
            number,
            store,
            phase,
            planned: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            merge_lock: Mutex::new(()),
            meta: StdMutex::new(AccountMeta::default()),
            changes,
        }
    }

    pub fn number(&self) -> AccountNumber {
        self.number
    }

    pub fn phase(&self) -> AccountPhase {
        *self.phase.borrow()
    }

    pub fn meta(&self) -> AccountMeta {
        self.meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Records the push and returns the plan that will merge it. Readers
    /// block from here until the latest plan has been applied.
    pub fn begin(&self, push: &StatePush) -> ResetPlan {
        {
            let mut meta = self
                .meta
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            meta.user_id.clone_from(&push.user_id);
            meta.old_version.clone_from(&push.old_version);
            meta.new_version.clone_from(&push.new_version);
        }
        let generation = self.planned.fetch_add(1, Ordering::SeqCst) + 1;
        self.phase.send_replace(AccountPhase::AwaitingPlan);
        let plan = ResetPlan::build(push, generation);
        debug!(
            account = self.number.get(),
            generation,
            keys = plan.batch.len(),
            resets = plan.resets.len(),
            "reset plan built"
        );
        plan
    }

    pub async fn apply(&self, plan: ResetPlan) -> Result<MergeReport, StateError> {
        let _merging = self.merge_lock.lock().await;
        if plan.generation <= self.applied.load(Ordering::SeqCst) {
            debug!(
                account = self.number.get(),
                generation = plan.generation,
                "superseded plan skipped"
            );
            return Ok(MergeReport {
                merged: 0,
                changed: 0,
                removed: 0,
                refetch: BTreeSet::new(),
            });
        }
        self.phase.send_replace(AccountPhase::Merging);

        match self.run_plan(&plan).await {
            Ok(report) => {
                self.applied.store(plan.generation, Ordering::SeqCst);
                let latest = self.planned.load(Ordering::SeqCst) == plan.generation;
                self.phase.send_replace(if latest {
                    AccountPhase::Ready
                } else {
                    AccountPhase::AwaitingPlan
                });
                info!(
                    account = self.number.get(),
                    generation = plan.generation,
                    merged = report.merged,
                    changed = report.changed,
                    removed = report.removed,
                    "account state merged"
                );
                Ok(report)
            }
            Err(error) => {
                self.phase.send_replace(AccountPhase::AwaitingPlan);
                warn!(
                    account = self.number.get(),
                    generation = plan.generation,
                    %error,
                    "account state merge failed"
                );
                Err(error)
            }
        }
    }

    async fn run_plan(&self, plan: &ResetPlan) -> Result<MergeReport, StateError> {
        let mut removed = 0usize;
        for (category, scope) in &plan.resets {
            removed += self.reset_category(category, scope).await?;
        }

        let pushes = plan.batch.iter().map(|(key, value)| {
            let acknowledged = plan.acknowledged.contains(key);
            self.push_to_state(key, value.clone(), acknowledged)
        });
        let merged = try_join_all(pushes).await?;
        let changed = merged.iter().filter(|changed| **changed).count();

        if !plan.refetch.is_empty() {
            debug!(account = self.number.get(), refetch = ?plan.refetch, "categories need refetch");
        }

        Ok(MergeReport {
            merged: merged.len(),
            changed,
            removed,
            refetch: plan.refetch.clone(),
        })
    }

    /// Writes one key; returns whether a change notification was emitted.
    async fn push_to_state(&self, key: &str, value: Value, acknowledged: bool) -> Result<bool, StateError> {
        self.store.set(&self.state_key(key), value.clone()).await?;
        if acknowledged {
            return Ok(false);
        }
        self.publish(key, value);
        Ok(true)
    }

    async fn reset_category(&self, category: &str, scope: &ResetScope) -> Result<usize, StateError> {
        let prefix = self.category_prefix(category);
        let mut removed = 0usize;
        for key in self.store.keys().await? {
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let ResetScope::Keep(survivors) = scope
                && survivors.contains(id)
            {
                continue;
            }
            self.store.delete(&key).await?;
            removed += 1;
        }
        debug!(account = self.number.get(), category, removed, "storage category reset");
        Ok(removed)
    }

    pub async fn wait_ready(&self) {
        let mut phase = self.phase.subscribe();
        // the sender lives in self, so the watch cannot close while we wait
        let _ = phase.wait_for(|phase| *phase == AccountPhase::Ready).await;
    }

    /// Consistent read of one state key.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        self.wait_ready().await;
        Ok(self.store.get(&self.state_key(key)).await?)
    }

    /// Every state key of the account, read after the latest merge.
    pub async fn snapshot(&self) -> Result<Map<String, Value>, StateError> {
        self.wait_ready().await;
        let prefix = self.state_key("");
        let mut snapshot = Map::new();
        for key in self.store.keys().await? {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(value) = self.store.get(&key).await? {
                snapshot.insert(name.to_string(), value);
            }
        }
        Ok(snapshot)
    }

    /// Sets a nested value such as `settings.passcode.enabled`, creating
    /// intermediate objects as needed.
    pub async fn set_by_path(&self, path: &str, value: Value) -> Result<(), StateError> {
        let mut segments = path.split('.');
        let root = segments
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| StateError::InvalidPath(path.to_string()))?;
        let rest: Vec<&str> = segments.collect();
        if rest.iter().any(|segment| segment.is_empty()) {
            return Err(StateError::InvalidPath(path.to_string()));
        }

        let state_key = self.state_key(root);
        let updated = if rest.is_empty() {
            value
        } else {
            let current = self.store.get(&state_key).await?.unwrap_or(Value::Null);
            insert_path(current, &rest, value)
        };

        self.store.set(&state_key, updated.clone()).await?;
        self.publish(root, updated);
        Ok(())
    }

    pub async fn put_entry(&self, category: &str, id: &str, value: Value) -> Result<(), StateError> {
        let key = format!("{}{id}", self.category_prefix(category));
        Ok(self.store.set(&key, value).await?)
    }

    /// Every stored entry of one storage category, keyed by id.
    pub async fn entries(&self, category: &str) -> Result<Map<String, Value>, StateError> {
        let prefix = self.category_prefix(category);
        let mut entries = Map::new();
        for key in self.store.keys().await? {
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(value) = self.store.get(&key).await? {
                entries.insert(id.to_string(), value);
            }
        }
        Ok(entries)
    }

    fn publish(&self, key: &str, value: Value) {
        // no subscribers is fine
        let _ = self.changes.send(StateChange {
            account: self.number,
            key: key.to_string(),
            value,
        });
    }

    fn state_key(&self, key: &str) -> String {
        format!("a{}/state/{key}", self.number)
    }

    fn category_prefix(&self, category: &str) -> String {
        format!("a{}/storage/{category}/", self.number)
    }
}

fn insert_path(target: Value, path: &[&str], value: Value) -> Value {
    let Some((head, tail)) = path.split_first() else {
        return value;
    };
    let mut map = match target {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let slot = map.entry(*head).or_insert(Value::Null);
    *slot = insert_path(std::mem::take(slot), tail, value);
    Value::Object(map)
}

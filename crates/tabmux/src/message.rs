//! Closed message schema spoken over a tab port.
//!
//! Tabs send [`WorkerRequest`]s to the shared process; the shared process
//! sends [`TabCall`]s back. Both travel inside a [`Frame`] so replies can be
//! matched to the request that produced them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::{AccountNumber, StatePush};
use crate::crypto::CryptoCall;
use crate::passcode::PasscodeRecord;
use crate::secret::StorageKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerRequest {
    Environment(Value),
    Crypto(CryptoCall),
    State(StatePush),
    ToggleStorages {
        enabled: bool,
        #[serde(default)]
        clear_write: bool,
    },
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    ServiceWorkerOnline {
        online: bool,
    },
    SetInterval {
        timeout_ms: u64,
    },
    ClearInterval {
        id: u64,
    },
    Terminate,
    ToggleUsingPasscode(UsingPasscode),
    ChangePasscode(PasscodeChange),
    IsLocked,
    ToggleLockOthers {
        locked: bool,
    },
    SaveEncryptionKey(StorageKey),
    SessionStorage(SessionStorageOp),
    SetStateByPath {
        account: AccountNumber,
        path: String,
        value: Value,
    },
    GetState {
        account: AccountNumber,
        key: String,
    },
    HlsQualityFile {
        doc_id: String,
        account: AccountNumber,
    },
}

impl WorkerRequest {
    /// Stable name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Environment(_) => "environment",
            Self::Crypto(_) => "crypto",
            Self::State(_) => "state",
            Self::ToggleStorages { .. } => "toggle_storages",
            Self::Event { .. } => "event",
            Self::ServiceWorkerOnline { .. } => "service_worker_online",
            Self::SetInterval { .. } => "set_interval",
            Self::ClearInterval { .. } => "clear_interval",
            Self::Terminate => "terminate",
            Self::ToggleUsingPasscode(_) => "toggle_using_passcode",
            Self::ChangePasscode(_) => "change_passcode",
            Self::IsLocked => "is_locked",
            Self::ToggleLockOthers { .. } => "toggle_lock_others",
            Self::SaveEncryptionKey(_) => "save_encryption_key",
            Self::SessionStorage(_) => "session_storage",
            Self::SetStateByPath { .. } => "set_state_by_path",
            Self::GetState { .. } => "get_state",
            Self::HlsQualityFile { .. } => "hls_quality_file",
        }
    }
}

/// Enter or leave passcode mode. Entering carries the key to seal with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsingPasscode {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<StorageKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasscodeChange {
    pub record: PasscodeRecord,
    pub key: StorageKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionStorageOp {
    Get { key: String },
    Set { key: String, value: Value },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TabCall {
    Event {
        name: String,
        payload: Value,
    },
    IntervalCallback {
        id: u64,
    },
    ToggleLock {
        locked: bool,
    },
    ToggleUsingPasscode {
        enabled: bool,
    },
    Mirror(MirrorBatch),
    StateChanged(StateChange),
    DownloadDoc {
        doc_id: String,
        account: AccountNumber,
    },
    RequestDoc {
        doc_id: String,
        account: AccountNumber,
    },
}

/// Cached derived view of one account category, sent to warm up a new tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorBatch {
    pub account: AccountNumber,
    pub category: String,
    pub entries: Map<String, Value>,
}

/// A key whose value changed locally as the result of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub account: AccountNumber,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Tab to shared process.
    Request { id: u64, request: WorkerRequest },
    /// Shared process to tab. Calls without an id expect no response.
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        call: TabCall,
    },
    /// Answer to a `Request` or an addressed `Call`, depending on direction.
    Response { id: u64, outcome: Outcome },
}

//! Cross-tab coordination for a multi-tab, multi-account client.
//!
//! One shared process ([`Coordinator`]) serves every tab over a port:
//! - request/response and broadcast messaging with a closed schema
//! - per-account state reset and merge with a readiness barrier
//! - passcode-gated encryption of the durable and session tiers
//! - a process-wide lock flag kept consistent across tabs

pub mod account;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod crypto;
mod encoding;
pub mod error;
pub mod hls;
pub mod message;
pub mod passcode;
pub mod port;
pub mod registry;
pub mod secret;
pub mod storage;

pub use account::{AccountNumber, AccountPhase, AccountState, ResetPlan, ResetScope, StatePush};
pub use channel::{ChannelError, Hub};
pub use config::{AutoLock, CoordinatorConfig};
pub use coordinator::{Backends, Coordinator};
pub use crypto::{CryptoDelegate, CryptoEngine, LocalCryptoEngine};
pub use error::{Result, WorkerError};
pub use hls::{DocumentInfo, DocumentSource, QualityFileRewriter, TabDocumentSource};
pub use message::{Frame, Outcome, TabCall, WorkerRequest};
pub use passcode::{PasscodeService, SharedProcess, Verification};
pub use port::{PortIo, TabClient, TabHandler};
pub use registry::{EndpointId, TabRegistry};
pub use secret::{Passcode, StorageKey};
pub use storage::{EncryptableStore, FileStore, KeyValueStore, MemoryStore, StorageToggle};

//! Tab side of a port: an in-process frame pipe plus the client a tab uses
//! to send requests and answer the shared process's calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::account::AccountNumber;
use crate::channel::ChannelError;
use crate::error::{Result, WorkerError};
use crate::message::{Frame, Outcome, PasscodeChange, TabCall, UsingPasscode, WorkerRequest};
use crate::passcode::SharedProcess;
use crate::secret::StorageKey;

/// One direction pair of a port.
pub struct PortIo {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Connected ends of an in-process port: `(tab, worker)`.
pub fn pair() -> (PortIo, PortIo) {
    let (tab_tx, worker_rx) = mpsc::unbounded_channel();
    let (worker_tx, tab_rx) = mpsc::unbounded_channel();
    (
        PortIo {
            outbound: tab_tx,
            inbound: tab_rx,
        },
        PortIo {
            outbound: worker_tx,
            inbound: worker_rx,
        },
    )
}

/// Answers calls the shared process makes on a tab.
#[async_trait]
pub trait TabHandler: Send + Sync {
    async fn handle(&self, call: TabCall) -> std::result::Result<Value, String>;
}

type PendingRequests = HashMap<u64, oneshot::Sender<Outcome>>;

pub struct TabClient {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<PendingRequests>>,
    request_counter: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl TabClient {
    pub fn connect(io: PortIo, handler: Arc<dyn TabHandler>) -> Self {
        let PortIo {
            outbound,
            mut inbound,
        } = io;
        let pending: Arc<Mutex<PendingRequests>> = Arc::new(Mutex::new(PendingRequests::new()));

        let pending_clone = Arc::clone(&pending);
        let reply_tx = outbound.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    Frame::Response { id, outcome } => {
                        let mut pending = pending_clone.lock().await;
                        if let Some(waiter) = pending.remove(&id) {
                            let _ = waiter.send(outcome);
                        } else {
                            warn!(request_id = id, "response without pending request");
                        }
                    }
                    Frame::Call { id, call } => {
                        let handler = Arc::clone(&handler);
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let outcome = match handler.handle(call).await {
                                Ok(value) => Outcome::Ok(value),
                                Err(message) => Outcome::Err(message),
                            };
                            if let Some(id) = id {
                                let _ = reply_tx.send(Frame::Response { id, outcome });
                            }
                        });
                    }
                    Frame::Request { id, .. } => {
                        warn!(request_id = id, "tab received a worker request frame");
                    }
                }
            }

            let mut pending = pending_clone.lock().await;
            debug!(pending = pending.len(), "port closed");
            pending.clear();
        });

        Self {
            outbound,
            pending,
            request_counter: AtomicU64::new(1),
            reader_task,
        }
    }

    pub async fn request(&self, request: WorkerRequest) -> std::result::Result<Value, ChannelError> {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(Frame::Request { id, request }).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ChannelError::Closed);
        }

        match rx.await {
            Ok(Outcome::Ok(value)) => Ok(value),
            Ok(Outcome::Err(message)) => Err(ChannelError::Rejected(message)),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    pub async fn request_as<R>(&self, request: WorkerRequest) -> std::result::Result<R, ChannelError>
    where
        R: DeserializeOwned,
    {
        let value = self.request(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn request_unit(&self, request: WorkerRequest) -> Result<()> {
        self.request(request).await?;
        Ok(())
    }
}

impl Drop for TabClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl SharedProcess for TabClient {
    async fn toggle_using_passcode(&self, toggle: UsingPasscode) -> Result<()> {
        self.request_unit(WorkerRequest::ToggleUsingPasscode(toggle)).await
    }

    async fn change_passcode(&self, change: PasscodeChange) -> Result<()> {
        self.request_unit(WorkerRequest::ChangePasscode(change)).await
    }

    async fn save_encryption_key(&self, key: StorageKey) -> Result<()> {
        self.request_unit(WorkerRequest::SaveEncryptionKey(key)).await
    }

    async fn is_locked(&self) -> Result<bool> {
        self.request_as(WorkerRequest::IsLocked)
            .await
            .map_err(WorkerError::from)
    }

    async fn toggle_lock_others(&self, locked: bool) -> Result<()> {
        self.request_unit(WorkerRequest::ToggleLockOthers { locked }).await
    }

    async fn set_state_by_path(&self, account: AccountNumber, path: &str, value: Value) -> Result<()> {
        self.request_unit(WorkerRequest::SetStateByPath {
            account,
            path: path.to_string(),
            value,
        })
        .await
    }
}

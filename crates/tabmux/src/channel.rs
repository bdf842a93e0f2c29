//! Shared-process side of the tab ports: addressed calls with typed replies,
//! one-way notifications and the all-but-one broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::message::{Frame, Outcome, TabCall};
use crate::registry::{EndpointId, TabRegistry};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("delivery to {0} failed")]
    DeliveryFailed(EndpointId),
    #[error("{endpoint} did not answer within {after_ms} ms")]
    Timeout { endpoint: EndpointId, after_ms: u64 },
    #[error("{endpoint} answered with an error: {message}")]
    Remote {
        endpoint: EndpointId,
        message: String,
    },
    #[error("shared process rejected the request: {0}")]
    Rejected(String),
    #[error("port closed")]
    Closed,
    #[error("failed to decode reply: {0}")]
    Decode(#[from] serde_json::Error),
}

type PendingCalls = HashMap<u64, oneshot::Sender<Outcome>>;

/// Outbound half of one tab's port plus the calls awaiting its answers.
pub struct TabSender {
    id: EndpointId,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<PendingCalls>,
    call_counter: AtomicU64,
}

impl TabSender {
    pub fn new(id: EndpointId, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            outbound,
            pending: Mutex::new(PendingCalls::new()),
            call_counter: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub async fn call(&self, call: TabCall, timeout: Duration) -> Result<Value, ChannelError> {
        let id = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .outbound
            .send(Frame::Call {
                id: Some(id),
                call,
            })
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ChannelError::DeliveryFailed(self.id));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Outcome::Ok(value))) => Ok(value),
            Ok(Ok(Outcome::Err(message))) => Err(ChannelError::Remote {
                endpoint: self.id,
                message,
            }),
            Ok(Err(_)) => Err(ChannelError::DeliveryFailed(self.id)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ChannelError::Timeout {
                    endpoint: self.id,
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub fn notify(&self, call: TabCall) -> Result<(), ChannelError> {
        self.outbound
            .send(Frame::Call { id: None, call })
            .map_err(|_| ChannelError::DeliveryFailed(self.id))
    }

    pub fn respond(&self, id: u64, outcome: Outcome) -> Result<(), ChannelError> {
        self.outbound
            .send(Frame::Response { id, outcome })
            .map_err(|_| ChannelError::DeliveryFailed(self.id))
    }

    /// Hands a tab's answer to the call waiting for it.
    pub async fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(waiter) = self.pending.lock().await.remove(&id) else {
            warn!(endpoint = %self.id, call_id = id, "response without pending call");
            return false;
        };
        waiter.send(outcome).is_ok()
    }

    /// Fails every outstanding call; their callers see `DeliveryFailed`.
    pub async fn fail_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            debug!(endpoint = %self.id, count, "dropped pending calls");
        }
        count
    }
}

/// Addresses tabs through the registry.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<TabRegistry>,
    call_timeout: Duration,
}

impl Hub {
    pub fn new(registry: Arc<TabRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    /// Invokes `call` on one tab and decodes its answer.
    pub async fn invoke<R>(&self, target: EndpointId, call: TabCall) -> Result<R, ChannelError>
    where
        R: DeserializeOwned,
    {
        let sender = self
            .registry
            .get(target)
            .ok_or(ChannelError::DeliveryFailed(target))?;
        let value = sender.call(call, self.call_timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends `call` to one tab without waiting for an answer.
    pub fn invoke_void(&self, target: EndpointId, call: TabCall) -> Result<(), ChannelError> {
        self.registry
            .get(target)
            .ok_or(ChannelError::DeliveryFailed(target))?
            .notify(call)
    }

    /// Sends `call` to every tab except `excluded`. Unreachable tabs are
    /// skipped; returns how many tabs the call was handed to.
    pub fn invoke_except(&self, call: &TabCall, excluded: Option<EndpointId>) -> usize {
        let mut delivered = 0usize;
        for sender in self.registry.except(excluded) {
            match sender.notify(call.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(endpoint = %sender.id(), %error, "broadcast delivery skipped");
                }
            }
        }
        delivered
    }
}

//! Set of tabs that currently hold a live port to the shared process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::TabSender;
use crate::message::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(u64);

impl EndpointId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryInner {
    tabs: BTreeMap<EndpointId, Arc<TabSender>>,
    next_id: u64,
    ever_connected: bool,
}

pub struct Registration {
    pub id: EndpointId,
    /// True only for the first tab registered during the process lifetime.
    pub first: bool,
    pub sender: Arc<TabSender>,
}

#[derive(Default)]
pub struct TabRegistry {
    inner: Mutex<RegistryInner>,
}

impl TabRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_tab(&self, outbound: mpsc::UnboundedSender<Frame>) -> Registration {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = EndpointId(inner.next_id);
        let first = !inner.ever_connected;
        inner.ever_connected = true;
        let sender = Arc::new(TabSender::new(id, outbound));
        inner.tabs.insert(id, Arc::clone(&sender));
        info!(endpoint = %id, first, connected = inner.tabs.len(), "tab registered");
        Registration { id, first, sender }
    }

    /// Drops the endpoint from the addressable set. Never touches state.
    pub fn remove_tab(&self, id: EndpointId) -> bool {
        let mut inner = self.lock();
        let removed = inner.tabs.remove(&id).is_some();
        if removed {
            info!(endpoint = %id, connected = inner.tabs.len(), "tab removed");
        } else {
            debug!(endpoint = %id, "tab already removed");
        }
        removed
    }

    pub fn get(&self, id: EndpointId) -> Option<Arc<TabSender>> {
        self.lock().tabs.get(&id).cloned()
    }

    /// Every registered tab except `excluded`.
    pub fn except(&self, excluded: Option<EndpointId>) -> Vec<Arc<TabSender>> {
        self.lock()
            .tabs
            .iter()
            .filter(|(id, _)| Some(**id) != excluded)
            .map(|(_, sender)| Arc::clone(sender))
            .collect()
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.lock().tabs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tabs.is_empty()
    }

    /// Ties the registration of `id` to the returned guard.
    pub fn lease(self: &Arc<Self>, id: EndpointId) -> TabLease {
        TabLease {
            registry: Arc::clone(self),
            id,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its tab from the registry when dropped, including when the
/// connection task is aborted or unwinds.
pub struct TabLease {
    registry: Arc<TabRegistry>,
    id: EndpointId,
}

impl TabLease {
    pub fn id(&self) -> EndpointId {
        self.id
    }
}

impl Drop for TabLease {
    fn drop(&mut self) {
        self.registry.remove_tab(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_registration_is_first() {
        let registry = TabRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.add_tab(tx.clone());
        assert!(first.first);
        assert!(registry.remove_tab(first.id));

        // an empty registry does not reset the first-connection marker
        let second = registry.add_tab(tx);
        assert!(!second.first);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn lease_removes_on_drop() {
        let registry = TabRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.add_tab(tx.clone());
        let b = registry.add_tab(tx);
        {
            let _lease = registry.lease(a.id);
            assert_eq!(registry.len(), 2);
        }
        assert_eq!(registry.ids(), vec![b.id]);
        assert!(registry.get(a.id).is_none());
        assert!(registry.except(Some(b.id)).is_empty());
    }
}

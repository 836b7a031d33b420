//! Process-wide map from device identity to its current live connection
//! (component D). Registration is a message to the displaced connection,
//! never a mutation of shared state it owns (§9: "eviction is a message,
//! not a mutation of a shared object").

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::connection::ConnectionHandle;
use crate::identity::DeviceIdentity;

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<DashMap<DeviceIdentity, ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle` as the live connection for `identity`. Any
    /// previous connection for the same identity is superseded.
    pub fn register(&self, identity: DeviceIdentity, handle: ConnectionHandle) {
        if let Some((_, previous)) = self.inner.remove(&identity) {
            if previous.id != handle.id {
                info!(identity = %identity, "evicting previous connection for this identity");
                previous.supersede();
            }
        }
        self.inner.insert(identity, handle);
    }

    /// Removes the entry only if it still belongs to `connection_id`
    /// (idempotent — a later registration for the same identity must not be
    /// removed by a stale connection's own cleanup).
    pub fn unregister(&self, identity: DeviceIdentity, connection_id: u64) {
        self.inner.remove_if(&identity, |_, handle| handle.id == connection_id);
    }

    pub fn lookup(&self, identity: &DeviceIdentity) -> Option<ConnectionHandle> {
        self.inner.get(identity).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{test_handle, Observed};

    #[test]
    fn lookup_missing_identity_is_none() {
        let registry = Registry::new();
        let identity = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(registry.lookup(&identity).is_none());
    }

    #[tokio::test]
    async fn registering_a_second_connection_supersedes_the_first() {
        let registry = Registry::new();
        let identity = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let (first, mut first_events) = test_handle(1, identity);
        let (second, _second_events) = test_handle(2, identity);

        registry.register(identity, first);
        registry.register(identity, second.clone());

        let observed = first_events.recv().await.expect("supersede event");
        assert!(matches!(observed, Observed::Supersede));
        assert_eq!(registry.lookup(&identity).unwrap().id, second.id);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_identity_scoped() {
        let registry = Registry::new();
        let identity = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let (handle, _events) = test_handle(1, identity);
        registry.register(identity, handle);

        registry.unregister(identity, 999); // wrong id, no-op
        assert!(registry.lookup(&identity).is_some());

        registry.unregister(identity, 1);
        assert!(registry.lookup(&identity).is_none());
        registry.unregister(identity, 1); // idempotent
    }
}

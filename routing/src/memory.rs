use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::{PeerStream, Router, RoutingError};

/// An in-process router, for tests and single node setups.
#[derive(Debug)]
pub struct MemoryRouter {
    self_addr: SocketAddr,
    ready: AtomicBool,
    peers: RwLock<HashMap<String, Vec<SocketAddr>>>,
}

impl MemoryRouter {
    /// A ready router for the node at `self_addr`, with no known peers.
    pub fn new(self_addr: SocketAddr) -> Self {
        Self {
            self_addr,
            ready: AtomicBool::new(true),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// This node's address.
    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    /// Mark the router (not) ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Record that `addr` holds `key`.
    pub fn add(&self, key: impl Into<String>, addr: SocketAddr) {
        let mut peers = self.peers.write();
        let holders = peers.entry(key.into()).or_default();
        if !holders.contains(&addr) {
            holders.push(addr);
        }
    }

    /// The peers holding `key`, in the order they were added.
    pub fn lookup(&self, key: &str) -> Option<Vec<SocketAddr>> {
        self.peers.read().get(key).cloned()
    }

    /// Every key with at least one holder, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.peers.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl Router for MemoryRouter {
    async fn ready(&self) -> Result<bool, RoutingError> {
        Ok(self.ready.load(Ordering::Acquire))
    }

    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<PeerStream, RoutingError> {
        if key.is_empty() {
            return Err(RoutingError::InvalidKey(key.to_owned()));
        }

        let peers: Vec<SocketAddr> = self
            .lookup(key)
            .unwrap_or_default()
            .into_iter()
            .filter(|addr| allow_self || *addr != self.self_addr)
            .take(count)
            .collect();

        tracing::trace!(%key, found = peers.len(), "Resolved peers");
        Ok(Box::pin(futures::stream::iter(peers)))
    }

    async fn advertise(&self, keys: &[String]) -> Result<(), RoutingError> {
        if let Some(key) = keys.iter().find(|key| key.is_empty()) {
            return Err(RoutingError::InvalidKey(key.clone()));
        }

        for key in keys {
            self.add(key.as_str(), self.self_addr);
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Notify, RwLock, mpsc};

use crate::error::RegistryError;

/// Opaque identity of one accepted connection. Assigned once by the accept
/// loop and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the registry knows about a live connection. Cloning is cheap
/// (channel sender + Arc). The socket itself belongs to the session and its
/// outbound writer, never to this handle.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub id: ConnId,
    pub addr: SocketAddr,
    /// Bounded queue drained by the connection's outbound writer
    pub outbound: mpsc::Sender<Bytes>,
    /// Wakes the owning session so it tears itself down
    pub evict: Arc<Notify>,
}

impl PeerHandle {
    /// Ask the owning session to terminate. Safe to call any number of times
    /// and before the session starts waiting (the permit is stored).
    pub fn request_eviction(&self) {
        self.evict.notify_one();
    }
}

/// The authoritative set of currently connected clients.
///
/// - Insert and remove take the write lock; `snapshot_except` takes the read
///   lock only long enough to clone handles, so no send ever happens under it.
/// - Clone the registry to share it; all clones see the same membership.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<RwLock<HashMap<ConnId, PeerHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns the live count after insertion.
    pub async fn register(&self, peer: PeerHandle) -> Result<usize, RegistryError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.id) {
            return Err(RegistryError::AlreadyRegistered(peer.id));
        }
        peers.insert(peer.id, peer);
        Ok(peers.len())
    }

    /// Remove a peer. `Some(remaining)` if it was present, `None` if it was
    /// already gone.
    pub async fn unregister(&self, id: ConnId) -> Option<usize> {
        let mut peers = self.peers.write().await;
        peers.remove(&id).map(|_| peers.len())
    }

    /// Consistent copy of every member except `origin`.
    pub async fn snapshot_except(&self, origin: ConnId) -> Vec<PeerHandle> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.id != origin)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, id: ConnId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn peer(id: u64, capacity: usize) -> (PeerHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = PeerHandle {
            id: ConnId::new(id),
            addr: SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
            outbound: tx,
            evict: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let registry = Registry::new();
        let (a, _rx) = peer(1, 4);

        assert_eq!(registry.register(a.clone()).await, Ok(1));
        assert_eq!(
            registry.register(a).await,
            Err(RegistryError::AlreadyRegistered(ConnId::new(1)))
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Registry::new();
        let (a, _ra) = peer(1, 4);
        let (b, _rb) = peer(2, 4);
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        assert_eq!(registry.unregister(ConnId::new(1)).await, Some(1));
        assert_eq!(registry.unregister(ConnId::new(1)).await, None);
        assert!(!registry.contains(ConnId::new(1)).await);
        assert!(registry.contains(ConnId::new(2)).await);
    }

    #[tokio::test]
    async fn snapshot_excludes_origin() {
        let registry = Registry::new();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (p, rx) = peer(id, 4);
            registry.register(p).await.unwrap();
            receivers.push(rx);
        }

        let mut ids: Vec<u64> = registry
            .snapshot_except(ConnId::new(2))
            .await
            .iter()
            .map(|p| p.id.as_u64())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_removal() {
        let registry = Registry::new();
        let (a, _ra) = peer(1, 4);
        let (b, _rb) = peer(2, 4);
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        let snapshot = registry.snapshot_except(ConnId::new(1)).await;
        registry.unregister(ConnId::new(2)).await;

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot_except(ConnId::new(1)).await.is_empty());
    }

    #[test]
    fn conn_id_display() {
        assert_eq!(ConnId::new(7).to_string(), "#7");
    }
}

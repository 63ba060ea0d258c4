use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::OverflowPolicy;
use crate::logger::Logger;
use crate::server::registry::{ConnId, Registry};

/// Outcome of one fan-out. Informational only: a broadcast never fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the message
    pub delivered: usize,
    /// Recipients that skipped it under `OverflowPolicy::Drop`
    pub dropped: usize,
    /// Recipients asked to disconnect (queue full or writer gone)
    pub evicted: usize,
}

impl BroadcastReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.dropped + self.evicted
    }
}

/// Delivers a message from one session to every other registered session.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Registry,
    policy: OverflowPolicy,
    logger: Logger,
}

impl Broadcaster {
    pub fn new(registry: Registry, policy: OverflowPolicy, logger: Logger) -> Self {
        Self {
            registry,
            policy,
            logger,
        }
    }

    /// Send `payload` to every member except `origin`.
    ///
    /// 1) Snapshot the membership under the registry's read lock.
    /// 2) `try_send` into each recipient's bounded queue; nothing here waits
    ///    on a socket, so one slow client cannot hold up the others.
    /// 3) A full queue is handled per `OverflowPolicy`; a closed queue means
    ///    the recipient's writer died and its session is told to clean up.
    pub async fn broadcast(&self, origin: ConnId, payload: Bytes) -> BroadcastReport {
        let snapshot = self.registry.snapshot_except(origin).await;
        let mut report = BroadcastReport::default();

        for peer in snapshot {
            match peer.outbound.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => match self.policy {
                    OverflowPolicy::Drop => {
                        self.logger.warn(&format!(
                            "⚠️ Backpressure: dropping message from {} for slow client {} ({})",
                            origin, peer.id, peer.addr
                        ));
                        report.dropped += 1;
                    }
                    OverflowPolicy::Disconnect => {
                        self.logger.warn(&format!(
                            "🚨 Disconnecting slow client {} ({}): outbound queue full",
                            peer.id, peer.addr
                        ));
                        peer.request_eviction();
                        report.evicted += 1;
                    }
                },
                Err(TrySendError::Closed(_)) => {
                    self.logger.debug(&format!(
                        "Client {} ({}) has no writer; requesting cleanup",
                        peer.id, peer.addr
                    ));
                    peer.request_eviction();
                    report.evicted += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::tests::peer;
    use std::time::Duration;

    async fn registry_with(
        ids: &[u64],
        capacity: usize,
    ) -> (Registry, Vec<crate::server::registry::PeerHandle>, Vec<tokio::sync::mpsc::Receiver<Bytes>>) {
        let registry = Registry::new();
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for id in ids {
            let (p, rx) = peer(*id, capacity);
            registry.register(p.clone()).await.unwrap();
            handles.push(p);
            receivers.push(rx);
        }
        (registry, handles, receivers)
    }

    #[tokio::test]
    async fn delivers_to_everyone_but_origin() {
        let (registry, _handles, mut rxs) = registry_with(&[1, 2, 3], 4).await;
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Disconnect, Logger);

        let report = broadcaster
            .broadcast(ConnId::new(1), Bytes::from_static(b"hello\n"))
            .await;

        assert_eq!(report.delivered, 2);
        assert!(rxs[0].try_recv().is_err());
        assert_eq!(rxs[1].try_recv().unwrap(), Bytes::from_static(b"hello\n"));
        assert_eq!(rxs[2].try_recv().unwrap(), Bytes::from_static(b"hello\n"));
    }

    #[tokio::test]
    async fn preserves_order_per_recipient() {
        let (registry, _handles, mut rxs) = registry_with(&[1, 2], 8).await;
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Disconnect, Logger);

        for msg in ["a\n", "b\n", "c\n"] {
            broadcaster.broadcast(ConnId::new(1), Bytes::from(msg)).await;
        }

        let got: Vec<Bytes> = (0..3).map(|_| rxs[1].try_recv().unwrap()).collect();
        assert_eq!(got, vec![Bytes::from("a\n"), Bytes::from("b\n"), Bytes::from("c\n")]);
    }

    #[tokio::test]
    async fn full_queue_with_drop_policy_skips_only_that_recipient() {
        let (registry, handles, mut rxs) = registry_with(&[1, 2, 3], 1).await;
        // Fill recipient 2's single slot.
        handles[1].outbound.try_send(Bytes::from_static(b"stuck\n")).unwrap();
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Drop, Logger);

        let report = broadcaster.broadcast(ConnId::new(1), Bytes::from_static(b"m\n")).await;

        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1, evicted: 0 });
        assert_eq!(rxs[2].try_recv().unwrap(), Bytes::from_static(b"m\n"));
        assert_eq!(rxs[1].try_recv().unwrap(), Bytes::from_static(b"stuck\n"));
        assert!(rxs[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_with_disconnect_policy_evicts() {
        let (registry, handles, _rxs) = registry_with(&[1, 2], 1).await;
        handles[1].outbound.try_send(Bytes::from_static(b"stuck\n")).unwrap();
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Disconnect, Logger);

        let report = broadcaster.broadcast(ConnId::new(1), Bytes::from_static(b"m\n")).await;

        assert_eq!(report.evicted, 1);
        tokio::time::timeout(Duration::from_secs(1), handles[1].evict.notified())
            .await
            .expect("eviction should be signalled");
    }

    #[tokio::test]
    async fn closed_recipient_does_not_stop_the_rest() {
        let (registry, handles, mut rxs) = registry_with(&[1, 2, 3], 4).await;
        // Recipient 2's writer is gone.
        let dead = rxs.remove(1);
        drop(dead);
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Drop, Logger);

        let report = broadcaster.broadcast(ConnId::new(1), Bytes::from_static(b"x\n")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.recipients(), 2);
        assert_eq!(rxs[1].try_recv().unwrap(), Bytes::from_static(b"x\n"));
        tokio::time::timeout(Duration::from_secs(1), handles[1].evict.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lone_member_broadcast_reaches_nobody() {
        let (registry, _handles, _rxs) = registry_with(&[1], 4).await;
        let broadcaster = Broadcaster::new(registry, OverflowPolicy::Disconnect, Logger);

        let report = broadcaster.broadcast(ConnId::new(1), Bytes::from_static(b"echo?\n")).await;
        assert_eq!(report.recipients(), 0);
    }
}

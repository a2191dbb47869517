// src/finder.rs

use crate::source::{pause, Component, ComponentEvent, ComponentId, EventSender, Lifecycle};
use crate::transport::{DiscoveryQuery, PeerEndpoint, PeerTransport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Periodically discovers peers sharing the same file and reports the ones
/// that appear and the ones not seen for longer than the peer timeout.
pub struct PeerFinder {
    inner: Arc<FinderInner>,
    lifecycle: Lifecycle,
}

struct FinderInner {
    id: ComponentId,
    transport: Arc<dyn PeerTransport>,
    query: DiscoveryQuery,
    events: EventSender,
    interval: Duration,
    timeout: Duration,
}

impl PeerFinder {
    pub fn new(
        id: ComponentId,
        transport: Arc<dyn PeerTransport>,
        query: DiscoveryQuery,
        events: EventSender,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FinderInner {
                id,
                transport,
                query,
                events,
                interval,
                timeout,
            }),
            lifecycle: Lifecycle::default(),
        }
    }
}

impl Component for PeerFinder {
    fn id(&self) -> ComponentId {
        self.inner.id
    }

    fn start(&self) -> bool {
        let inner = self.inner.clone();
        self.lifecycle.start(move |cancel| inner.run(cancel))
    }

    fn stop(&self) -> bool {
        self.lifecycle.stop()
    }
}

impl FinderInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(finder = self.id, interface = %self.query.interface, "peer finder started");
        let _ = self.events.send(ComponentEvent::Started(self.id));

        let mut table: HashMap<String, (PeerEndpoint, Instant)> = HashMap::new();
        loop {
            let found = tokio::select! {
                _ = cancel.cancelled() => break,
                found = self.transport.discover(&self.query) => found,
            };
            let now = Instant::now();
            match found {
                Ok(peers) => {
                    for peer in peers {
                        let fresh = table.insert(peer.id.clone(), (peer.clone(), now)).is_none();
                        if fresh {
                            tracing::info!(finder = self.id, peer = %peer.id, host = %peer.host, "peer found");
                            let _ = self.events.send(ComponentEvent::PeerFound(peer));
                        }
                    }
                }
                Err(e) => tracing::warn!(finder = self.id, error = %e, "discovery failed"),
            }

            table.retain(|_, (peer, seen)| {
                if now.duration_since(*seen) <= self.timeout {
                    return true;
                }
                tracing::info!(finder = self.id, peer = %peer.id, "peer lost");
                let _ = self.events.send(ComponentEvent::PeerLost(peer.clone()));
                false
            });

            if !pause(&cancel, self.interval).await {
                break;
            }
        }

        tracing::debug!(finder = self.id, "peer finder stopped");
        let _ = self.events.send(ComponentEvent::Stopped(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackNetwork, PeerRequest, PeerResponse, ResourceHandler, TransportError};
    use tokio::sync::mpsc;

    struct Named;

    impl ResourceHandler for Named {
        fn base_uri(&self) -> &str {
            "/ns/k"
        }
        fn resource_type(&self) -> &str {
            "t"
        }
        fn interface(&self) -> &str {
            "ns.if.k"
        }
        fn handle(&self, _: &PeerRequest) -> Result<PeerResponse, TransportError> {
            Ok(PeerResponse::Index { blocks: 0 })
        }
    }

    #[tokio::test]
    async fn reports_found_once_then_lost_after_timeout() {
        let net = LoopbackNetwork::new();
        let seeder = net.transport("seeder", true);
        seeder.publish(Arc::new(Named)).unwrap();
        let me: Arc<dyn PeerTransport> = Arc::new(net.transport("me", true));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let finder = PeerFinder::new(
            3,
            me,
            DiscoveryQuery {
                resource_type: "t".into(),
                interface: "ns.if.k".into(),
            },
            tx,
            Duration::from_millis(10),
            Duration::from_millis(40),
        );
        finder.start();

        assert_eq!(rx.recv().await, Some(ComponentEvent::Started(3)));
        let found = match rx.recv().await {
            Some(ComponentEvent::PeerFound(peer)) => peer,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(found.id, "seeder/ns/k");

        net.set_online("seeder", false);
        assert_eq!(rx.recv().await, Some(ComponentEvent::PeerLost(found)));

        finder.stop();
        assert_eq!(rx.recv().await, Some(ComponentEvent::Stopped(3)));
    }
}

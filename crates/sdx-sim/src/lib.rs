//! In-memory multi-node harness for end-to-end exercises.
//!
//! Builds full [`NodeService`] instances over the shared memory transport
//! so the scenario suites can drive announce/fetch/deliver flows without
//! sockets or disks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sdx_core::schema::SchemaCatalog;
use sdx_core::{PeerId, SchemaId};
use sdx_crypto::signing::{IdentityKey, IdentitySigner};
use sdx_node::config::NodeConfig;
use sdx_node::metrics::NodeMetrics;
use sdx_node::policy::{EffectivePolicy, PolicyTable};
use sdx_node::service::{NodeService, NodeServiceParams};
use sdx_node::trust::{PeerRegistry, TrustLevel};
use sdx_store::{Store, StoreOptions};
use sdx_transport::memory::MemoryNetwork;

/// One simulated node and the handles its tests need.
pub struct SimNode {
    pub peer: PeerId,
    pub signer: Arc<IdentityKey>,
    pub service: NodeService,
}

/// Shared world for a scenario.
pub struct SimNet {
    pub network: MemoryNetwork,
    schemas: Vec<SchemaId>,
}

impl SimNet {
    /// A world whose nodes all know the given schemas.
    pub fn new(schemas: &[&str]) -> Self {
        Self {
            network: MemoryNetwork::new(),
            schemas: schemas.iter().map(|s| SchemaId::from(*s)).collect(),
        }
    }

    /// Spawns a node with a deterministic identity and default config.
    pub fn spawn_node(&self, secret: u8) -> SimNode {
        self.spawn_node_with(secret, NodeConfig::default())
    }

    /// Spawns a node with an explicit config.
    pub fn spawn_node_with(&self, secret: u8, config: NodeConfig) -> SimNode {
        let signer = Arc::new(IdentityKey::from_seed([secret; 32]));
        let peer = signer.peer_id();
        let transport = Arc::new(self.network.register(peer));

        let mut catalog = SchemaCatalog::new();
        for schema in &self.schemas {
            catalog.register(schema.clone());
        }

        let metrics = Arc::new(NodeMetrics::new());
        let registry = Arc::new(PeerRegistry::new(
            config.gate,
            Arc::clone(&metrics),
        ));
        let policy = Arc::new(PolicyTable::new(EffectivePolicy::default()));
        let store = Arc::new(
            Store::open_in_memory(StoreOptions::default()).expect("sim store should open"),
        );

        let service = NodeService::start(NodeServiceParams {
            config,
            store,
            transport,
            validator: Arc::new(catalog),
            signer: Arc::clone(&signer) as Arc<dyn IdentitySigner>,
            registry,
            policy,
            metrics,
            schemas: self.schemas.clone(),
        });
        SimNode {
            peer,
            signer,
            service,
        }
    }

    /// Makes `publisher` gossip every known schema to `subscriber`.
    pub fn subscribe_all(&self, publisher: &SimNode, subscriber: &SimNode) {
        for schema in &self.schemas {
            publisher.service.bus().set_remote_subscription(
                subscriber.peer,
                schema.clone(),
                true,
            );
        }
    }

    /// Grants `level` to `peer` on `node`.
    pub fn trust(&self, node: &SimNode, peer: PeerId, level: TrustLevel) {
        node.service.registry().set_trust(peer, level);
    }
}

/// A scripted peer backed directly by the memory transport; scenarios use
/// it to emit hand-crafted traffic that a well-behaved node never would.
pub struct RawPeer {
    pub peer: PeerId,
    pub signer: Arc<IdentityKey>,
    pub transport: Arc<sdx_transport::memory::MemoryTransport>,
}

impl SimNet {
    /// Registers a scripted peer endpoint.
    pub fn raw_peer(&self, secret: u8) -> RawPeer {
        let signer = Arc::new(IdentityKey::from_seed([secret; 32]));
        let peer = signer.peer_id();
        let transport = Arc::new(self.network.register(peer));
        RawPeer {
            peer,
            signer,
            transport,
        }
    }
}

impl RawPeer {
    /// Signs and sends one announcement for `payload` to `target`.
    pub fn announce(
        &self,
        target: PeerId,
        schema: &str,
        payload: &[u8],
    ) -> Result<String, sdx_transport::TransportError> {
        use sdx_codec::announcement::Announcement;
        use sdx_core::cid::cid_string;
        use sdx_core::time::unix_time_millis;
        use sdx_transport::StreamTransport;

        let cid = cid_string(payload);
        let announcement = Announcement::sign(
            SchemaId::from(schema),
            cid.clone(),
            unix_time_millis(),
            None,
            self.signer.as_ref(),
        );
        let encoded = announcement
            .encode()
            .expect("raw announcement should encode");
        self.transport.send_datagram(&target, &encoded)?;
        Ok(cid)
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
}

#[cfg(test)]
mod tests {
    use super::{wait_until, SimNet};
    use std::time::Duration;

    #[test]
    fn nodes_spawn_with_distinct_identities() {
        let net = SimNet::new(&["OMM"]);
        let mut a = net.spawn_node(1);
        let mut b = net.spawn_node(2);
        assert_ne!(a.peer, b.peer);
        a.service.shutdown();
        b.service.shutdown();
    }

    #[test]
    fn wait_until_observes_late_conditions() {
        let started = std::time::Instant::now();
        assert!(wait_until(Duration::from_secs(1), || {
            started.elapsed() > Duration::from_millis(80)
        }));
        assert!(!wait_until(Duration::from_millis(50), || false));
    }
}

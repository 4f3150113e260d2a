//! Spawns a set of connected conodes for integration tests.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;

use skipchain::config::Configuration;
use skipchain::service::Service;
use skipchain::types::basic::{Address, SkipBlockID};
use skipchain::types::crypto_primitives::{Keypair, SigningKey};
use skipchain::types::roster::{Roster, ServerIdentity};

use super::mem_db::MemDB;
use super::network::{mock_network, NetworkStub};

#[allow(dead_code)]
pub(crate) struct TestNode {
    pub(crate) keypair: Keypair,
    pub(crate) db: MemDB,
    pub(crate) network: NetworkStub,
    pub(crate) service: Arc<Service<NetworkStub, MemDB>>,
}

impl TestNode {
    pub(crate) fn identity(&self) -> ServerIdentity {
        self.service.identity().clone()
    }
}

/// Deadlines tight enough that a failing sub-protocol shows up quickly, and no snapshot
/// rate limiting so every mutation is observable in the [MemDB].
pub(crate) fn test_config() -> Configuration {
    Configuration {
        block_fetch_timeout: Duration::from_millis(1000),
        cosign_timeout: Duration::from_secs(5),
        extend_roster_timeout: Duration::from_secs(1),
        save_quiet_window: Duration::ZERO,
        recv_poll_interval: Duration::from_millis(1),
        handler_threads: 4,
    }
}

/// Start `n` conodes connected through a mock network.
pub(crate) fn spawn_conodes(n: usize) -> Vec<TestNode> {
    super::logging::setup_logger(log::LevelFilter::Warn);
    let keypairs: Vec<Keypair> = (0..n)
        .map(|_| Keypair::new(SigningKey::generate(&mut OsRng)))
        .collect();
    let stubs = mock_network(keypairs.iter().map(|kp| kp.public()));
    keypairs
        .into_iter()
        .zip(stubs)
        .enumerate()
        .map(|(i, (keypair, network))| {
            let db = MemDB::new();
            let service = Service::start(
                keypair.clone(),
                Address::new(format!("127.0.0.1:{}", 7770 + i)),
                network.clone(),
                db.clone(),
                test_config(),
            )
            .unwrap();
            TestNode {
                keypair,
                db,
                network,
                service: Arc::new(service),
            }
        })
        .collect()
}

/// The roster formed by `nodes`, in order; element 0 leads.
pub(crate) fn roster_of(nodes: &[TestNode]) -> Roster {
    Roster::new(nodes.iter().map(|node| node.identity()).collect())
}

/// Wait until every given conode holds the block, or fail the test.
#[allow(dead_code)]
pub(crate) fn wait_for_block(nodes: &[TestNode], id: &SkipBlockID) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !nodes
        .iter()
        .all(|node| node.service.skipblock_store().contains(id))
    {
        assert!(
            Instant::now() < deadline,
            "block {} did not reach all conodes",
            id
        );
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wait until no given conode is forming or applying blocks any more.
#[allow(dead_code)]
pub(crate) fn wait_propagation_finished(nodes: &[TestNode]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while nodes.iter().any(|node| node.service.is_propagating()) {
        assert!(Instant::now() < deadline, "propagation did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    // Let in-flight propagation messages drain.
    thread::sleep(Duration::from_millis(20));
}

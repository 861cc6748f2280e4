use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ringdir_lib::tree::RangeStart;
use ringdir_lib::NodeId;
use ringdir_node::{
    Config, LookupError, LookupNode, NodeRole, RetryPolicy, StabilizerState, StorageBackend,
};

use crate::integration::{NetworkSimulator, SimulatedNetworkClient, SimulatorMessage};

pub type SimNode = LookupNode<SimulatedNetworkClient, SimStorage>;

/// What the storage layer of every simulated node was asked to do.
#[derive(Debug, Default)]
pub struct StorageLog {
    data_nodes: HashSet<NodeId>,
    /// `(from, to)` of every object handover before a promotion
    pub handovers: Vec<(NodeId, NodeId)>,
    /// `(reporter, failed, was_superpeer)`
    pub failures: Vec<(NodeId, NodeId, bool)>,
    /// `(restorer, failed, range)`
    pub recoveries: Vec<(NodeId, NodeId, RangeStart)>,
}

/// Storage state shared by all nodes of one harness.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    log: Arc<Mutex<StorageLog>>,
}

impl StorageRegistry {
    fn backend(&self, me: NodeId) -> SimStorage {
        SimStorage {
            me,
            registry: self.clone(),
        }
    }

    fn add_data_node(&self, node: NodeId) {
        self.log.lock().unwrap().data_nodes.insert(node);
    }

    /// Makes `node` count as having left on purpose.
    pub fn remove_data_node(&self, node: NodeId) {
        self.log.lock().unwrap().data_nodes.remove(&node);
    }

    pub fn handovers(&self) -> Vec<(NodeId, NodeId)> {
        self.log.lock().unwrap().handovers.clone()
    }

    pub fn failures(&self) -> Vec<(NodeId, NodeId, bool)> {
        self.log.lock().unwrap().failures.clone()
    }

    pub fn recoveries(&self) -> Vec<(NodeId, NodeId, RangeStart)> {
        self.log.lock().unwrap().recoveries.clone()
    }
}

/// Storage backend that records requests instead of moving chunks.
pub struct SimStorage {
    me: NodeId,
    registry: StorageRegistry,
}

#[async_trait]
impl StorageBackend for SimStorage {
    async fn migrate_all_owned_objects(&self, to: NodeId) -> bool {
        self.registry.log.lock().unwrap().handovers.push((self.me, to));
        true
    }

    async fn report_node_failure(&self, node: NodeId, was_superpeer: bool) {
        self.registry
            .log
            .lock()
            .unwrap()
            .failures
            .push((self.me, node, was_superpeer));
    }

    async fn node_available(&self, node: NodeId) -> bool {
        self.registry.log.lock().unwrap().data_nodes.contains(&node)
    }

    async fn recover(&self, failed: NodeId, range: RangeStart) -> bool {
        self.registry
            .log
            .lock()
            .unwrap()
            .recoveries
            .push((self.me, failed, range));
        true
    }
}

struct TestNode {
    /// The actual LookupNode instance (production code)
    node: SimNode,
    /// Carried between manually driven stabilization rounds
    state: StabilizerState,
    /// Answers requests from the simulator
    inbox: JoinHandle<()>,
}

/// Orchestrates multi-node overlay tests. Stabilization is driven manually
/// round by round, so the background workers are parked.
pub struct TestHarness {
    network: NetworkSimulator,
    storage: StorageRegistry,
    expected_superpeers: usize,
    promotion_ticks: Option<u32>,
    bootstrap: Option<NodeId>,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestHarness {
    pub fn new(expected_superpeers: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            network: NetworkSimulator::new(),
            storage: StorageRegistry::default(),
            expected_superpeers,
            promotion_ticks: None,
            bootstrap: None,
            nodes: BTreeMap::new(),
        }
    }

    /// Lets superpeers promote peers after `ticks` rounds below the
    /// expected ring size.
    pub fn with_promotion_after(mut self, ticks: u32) -> Self {
        self.promotion_ticks = Some(ticks);
        self
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    fn config(&self, id: NodeId, role: NodeRole) -> Config {
        Config {
            node_id: id,
            role,
            bootstrap: self.bootstrap.unwrap_or(id),
            expected_superpeers: self.expected_superpeers,
            sleep_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                interval: Duration::from_millis(10),
                max_attempts: Some(5),
            },
            unstable_ticks_before_promotion: self.promotion_ticks,
            ..Config::default()
        }
    }

    /// Starts a node and joins it through the first superpeer added.
    pub async fn add_node(&mut self, id: NodeId, role: NodeRole) -> Result<SimNode, LookupError> {
        let (inbox_sender, mut inbox_receiver) = mpsc::unbounded_channel::<SimulatorMessage>();
        self.network.register_node(id, inbox_sender).await;
        if role == NodeRole::Peer {
            self.storage.add_data_node(id);
        }

        let node = LookupNode::new(
            self.config(id, role),
            Arc::new(self.network.create_client(id)),
            Arc::new(self.storage.backend(id)),
        );

        let handler = node.clone();
        let inbox = tokio::spawn(async move {
            while let Some(request) = inbox_receiver.recv().await {
                let node = handler.clone();
                tokio::spawn(async move {
                    let response = node.handle_message(request.from, request.message).await;
                    let _ = request.response_sender.send(response);
                });
            }
        });
        self.nodes.insert(
            id,
            TestNode {
                node: node.clone(),
                state: StabilizerState::default(),
                inbox,
            },
        );

        node.join_overlay().await?;
        if role == NodeRole::Superpeer && self.bootstrap.is_none() {
            self.bootstrap = Some(id);
        }
        Ok(node)
    }

    pub async fn add_superpeer(&mut self, id: u16) -> SimNode {
        self.add_node(NodeId(id), NodeRole::Superpeer)
            .await
            .unwrap_or_else(|e| panic!("superpeer {} failed to join: {}", id, e))
    }

    pub async fn add_peer(&mut self, id: u16) -> SimNode {
        self.add_node(NodeId(id), NodeRole::Peer)
            .await
            .unwrap_or_else(|e| panic!("peer {} failed to join: {}", id, e))
    }

    pub fn node(&self, id: u16) -> SimNode {
        self.nodes
            .get(&NodeId(id))
            .map(|test_node| test_node.node.clone())
            .unwrap_or_else(|| panic!("node {} is not running", id))
    }

    pub fn live_nodes(&self) -> Vec<SimNode> {
        self.nodes.values().map(|test_node| test_node.node.clone()).collect()
    }

    /// IDs of the running superpeers, sorted.
    pub fn superpeer_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|test_node| test_node.node.is_superpeer())
            .map(|test_node| test_node.node.me)
            .collect()
    }

    /// Runs `rounds` stabilization rounds over all running nodes in ID order.
    pub async fn stabilize(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for test_node in self.nodes.values_mut() {
                test_node
                    .node
                    .stabilization_tick(&mut test_node.state)
                    .await;
            }
            self.drain_failures().await;
        }
    }

    /// Waits until every node has handled its queued failures.
    pub async fn drain_failures(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let nodes = self.live_nodes();
        futures::future::join_all(nodes.iter().map(|node| node.drain_failures())).await;
    }

    /// Crashes a node: it stops answering and its workers stop.
    pub async fn fail_node(&mut self, id: u16) {
        let id = NodeId(id);
        self.network.mark_node_failed(id).await;
        self.network.unregister_node(id).await;
        if let Some(test_node) = self.nodes.remove(&id) {
            test_node.node.shutdown();
            test_node.inbox.abort();
        }
    }
}

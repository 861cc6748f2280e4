use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

use ringdir_lib::messages::LookupMessage;
use ringdir_lib::NodeId;
use ringdir_node::{NetError, NetworkClient};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Simulates network communication between nodes in the test environment.
/// Routes directory messages between nodes without actual TCP connections.
#[derive(Clone, Default)]
pub struct NetworkSimulator {
    /// Inbox of every registered node
    nodes: Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<SimulatorMessage>>>>,
    /// Nodes whose messages are never delivered
    failed_nodes: Arc<RwLock<HashSet<NodeId>>>,
}

/// Request delivered to a node's inbox, answered through `response_sender`.
#[derive(Debug)]
pub struct SimulatorMessage {
    pub from: NodeId,
    pub message: LookupMessage,
    pub response_sender: oneshot::Sender<LookupMessage>,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_node(&self, node: NodeId, inbox: mpsc::UnboundedSender<SimulatorMessage>) {
        self.nodes.write().await.insert(node, inbox);
    }

    pub async fn unregister_node(&self, node: NodeId) {
        self.nodes.write().await.remove(&node);
    }

    /// Messages to `node` fail from now on, as if it crashed.
    pub async fn mark_node_failed(&self, node: NodeId) {
        self.failed_nodes.write().await.insert(node);
    }

    pub async fn is_node_failed(&self, node: NodeId) -> bool {
        self.failed_nodes.read().await.contains(&node)
    }

    /// Network client sending on behalf of `from`.
    pub fn create_client(&self, from: NodeId) -> SimulatedNetworkClient {
        SimulatedNetworkClient {
            simulator: self.clone(),
            from,
        }
    }
}

/// NetworkClient implementation that uses the simulator for message delivery
#[derive(Clone)]
pub struct SimulatedNetworkClient {
    simulator: NetworkSimulator,
    from: NodeId,
}

#[async_trait]
impl NetworkClient for SimulatedNetworkClient {
    async fn call_node(
        &self,
        node: NodeId,
        message: LookupMessage,
    ) -> Result<LookupMessage, NetError> {
        let unreachable = |reason: &str| NetError::DestinationUnreachable {
            node,
            reason: reason.to_string(),
        };

        if self.simulator.is_node_failed(node).await {
            return Err(unreachable("node is marked as failed"));
        }
        let inbox = self
            .simulator
            .nodes
            .read()
            .await
            .get(&node)
            .cloned()
            .ok_or_else(|| unreachable("node is not registered"))?;

        let (response_sender, response) = oneshot::channel();
        inbox
            .send(SimulatorMessage {
                from: self.from,
                message,
                response_sender,
            })
            .map_err(|_| unreachable("inbox closed"))?;

        match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(unreachable("response channel closed")),
            Err(_) => Err(NetError::Timeout(node)),
        }
    }

    async fn send_message(&self, node: NodeId, message: LookupMessage) -> Result<(), NetError> {
        self.call_node(node, message).await.map(|_| ())
    }
}

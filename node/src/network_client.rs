use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use ringdir_lib::messages::{Envelope, LookupMessage};
use ringdir_lib::NodeId;

use crate::error::NetError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    /// Sends a request and waits for its response.
    async fn call_node(&self, node: NodeId, message: LookupMessage)
        -> Result<LookupMessage, NetError>;

    /// Delivers a one-way message. Only delivery failures are reported.
    async fn send_message(&self, node: NodeId, message: LookupMessage) -> Result<(), NetError>;
}

struct ConnectionStats {
    active_count: usize,
    last_cleanup: Instant,
}

struct ConnectionLimiter {
    stats: HashMap<NodeId, ConnectionStats>,
    max_connections_per_host: usize,
    cleanup_interval: Duration,
}

impl ConnectionLimiter {
    fn new(max_connections_per_host: usize) -> Self {
        Self {
            stats: HashMap::new(),
            max_connections_per_host,
            cleanup_interval: Duration::from_secs(30),
        }
    }

    fn try_acquire(&mut self, node: NodeId) -> bool {
        let now = Instant::now();

        if self
            .stats
            .values()
            .any(|s| now.duration_since(s.last_cleanup) > self.cleanup_interval)
        {
            let interval = self.cleanup_interval;
            self.stats.retain(|_, stats| {
                stats.active_count > 0 || now.duration_since(stats.last_cleanup) < interval * 2
            });
        }

        let stats = self.stats.entry(node).or_insert(ConnectionStats {
            active_count: 0,
            last_cleanup: now,
        });
        if stats.active_count >= self.max_connections_per_host {
            return false;
        }
        stats.active_count += 1;
        true
    }

    fn release(&mut self, node: NodeId) {
        if let Some(stats) = self.stats.get_mut(&node) {
            stats.active_count = stats.active_count.saturating_sub(1);
        }
    }
}

struct ConnectionGuard {
    node: NodeId,
    limiter: Arc<Mutex<ConnectionLimiter>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let limiter = Arc::clone(&self.limiter);
        let node = self.node;
        tokio::spawn(async move {
            limiter.lock().await.release(node);
        });
    }
}

/// TCP transport: one connection per request, bincode-encoded envelopes,
/// request half closed before the response is read.
pub struct RealNetworkClient {
    me: NodeId,
    addresses: HashMap<NodeId, String>,
    limiter: Arc<Mutex<ConnectionLimiter>>,
    /// Nodes whose connection broke after it was established
    lost_connections: Option<mpsc::UnboundedSender<NodeId>>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_CONNECTIONS_PER_HOST: usize = 5;

impl RealNetworkClient {
    pub fn new(me: NodeId, addresses: HashMap<NodeId, String>) -> Self {
        Self {
            me,
            addresses,
            limiter: Arc::new(Mutex::new(ConnectionLimiter::new(MAX_CONNECTIONS_PER_HOST))),
            lost_connections: None,
        }
    }

    /// Reports every node whose connection breaks mid-request on the
    /// returned channel.
    pub fn with_connection_events(mut self) -> (Self, mpsc::UnboundedReceiver<NodeId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lost_connections = Some(sender);
        (self, receiver)
    }

    fn connection_lost(&self, node: NodeId, e: &std::io::Error) -> NetError {
        warn!("[{}] Connection to {} lost: {}", self.me, node, e);
        if let Some(events) = &self.lost_connections {
            let _ = events.send(node);
        }
        NetError::DestinationUnreachable {
            node,
            reason: e.to_string(),
        }
    }

    async fn call_node_with_retry(
        &self,
        node: NodeId,
        message: LookupMessage,
    ) -> Result<LookupMessage, NetError> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_error = NetError::Timeout(node);

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!(
                    "[{}] Retrying node {} (attempt {}/{})",
                    self.me,
                    node,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.call_node_internal(node, message.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn call_node_internal(
        &self,
        node: NodeId,
        message: LookupMessage,
    ) -> Result<LookupMessage, NetError> {
        let unreachable_err = |reason: String| NetError::DestinationUnreachable { node, reason };

        let address = self
            .addresses
            .get(&node)
            .ok_or_else(|| unreachable_err("no address known".to_string()))?;

        if !self.limiter.lock().await.try_acquire(node) {
            warn!("[{}] Connection limit reached for node {}", self.me, node);
            return Err(unreachable_err("connection limit exceeded".to_string()));
        }
        let _connection_guard = ConnectionGuard {
            node,
            limiter: Arc::clone(&self.limiter),
        };

        let mut stream = match timeout(DEFAULT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("[{}] Failed to connect to {} at {}: {}", self.me, node, address, e);
                return Err(unreachable_err(e.to_string()));
            }
            Err(_) => return Err(NetError::Timeout(node)),
        };

        let envelope = Envelope {
            from: self.me,
            message,
        };
        let encoded = bincode::serialize(&envelope).map_err(|e| unreachable_err(e.to_string()))?;
        debug!("[{}] Sending to {}: {:?}", self.me, node, envelope.message);

        match timeout(DEFAULT_TIMEOUT, stream.write_all(&encoded)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.connection_lost(node, &e)),
            Err(_) => return Err(NetError::Timeout(node)),
        }

        match timeout(Duration::from_secs(1), stream.shutdown()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("[{}] Shutdown error (non-critical): {}", self.me, e),
            Err(_) => debug!("[{}] Shutdown timed out (non-critical)", self.me),
        }

        let mut buffer = Vec::new();
        match timeout(DEFAULT_TIMEOUT, stream.read_to_end(&mut buffer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.connection_lost(node, &e)),
            Err(_) => return Err(NetError::Timeout(node)),
        }
        if buffer.is_empty() {
            let closed = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
            return Err(self.connection_lost(node, &closed));
        }

        let response: LookupMessage =
            bincode::deserialize(&buffer).map_err(|e| unreachable_err(e.to_string()))?;
        debug!("[{}] Received from {}: {:?}", self.me, node, response);
        Ok(response)
    }
}

#[async_trait]
impl NetworkClient for RealNetworkClient {
    async fn call_node(
        &self,
        node: NodeId,
        message: LookupMessage,
    ) -> Result<LookupMessage, NetError> {
        self.call_node_with_retry(node, message).await
    }

    async fn send_message(&self, node: NodeId, message: LookupMessage) -> Result<(), NetError> {
        self.call_node_with_retry(node, message).await.map(|_| ())
    }
}

//! Ringdir directory node
//!
//! Superpeer overlay and chunk lookup directory of the distributed RAM store.
//! Superpeers form a ring over the 16-bit node ID space, each one owning the
//! lookup trees of the creators in `(predecessor, self]` and replicating
//! them on its three successors. Peers attach to the superpeer responsible
//! for their own ID. The crate can run as a binary or be embedded, which is
//! how the integration tests drive whole overlays in one process.

macro_rules! log_info {
    ($node:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $node, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($node:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $node, format_args!($($arg)*));
    })
}

pub mod api;
pub mod client;
pub mod directory;
pub mod error;
pub mod failure;
pub mod handlers;
pub mod locks;
pub mod network_client;
pub mod node;
pub mod overlay;
pub mod promotion;
pub mod ring;
pub mod stabilization;
pub mod storage;

pub use error::{ConfigError, LookupError, NetError, PromotionError};
pub use network_client::{NetworkClient, RealNetworkClient};
pub use node::{LookupNode, Role};
pub use ring::{Area, Ring};
pub use stabilization::StabilizerState;
pub use storage::{AddressBookStorage, StorageBackend};

pub use ringdir_lib::messages::LookupMessage;
pub use ringdir_lib::stats::OverlayStats;
pub use ringdir_lib::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Role a node starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Superpeer,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub id: NodeId,
    pub address: String,
}

/// How often a request is retried after the target turned out to be wrong
/// or unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// `None` retries until the overlay answers.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Whether another attempt may follow `attempts` failed ones.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Configuration for a LookupNode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Superpeer contacted first when joining.
    pub bootstrap: NodeId,
    /// Target size of the superpeer ring.
    pub expected_superpeers: usize,
    #[serde(with = "humantime_serde")]
    pub sleep_interval: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Stabilization rounds an incomplete ring is tolerated before a peer
    /// is promoted. Derived from `expected_superpeers` when unset.
    #[serde(default)]
    pub unstable_ticks_before_promotion: Option<u32>,
    pub bind_address: String,
    #[serde(default)]
    pub api_port: Option<u16>,
    /// Address book of every node that may take part, this one included.
    #[serde(default)]
    pub nodes: Vec<NodeAddress>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            role: NodeRole::Superpeer,
            bootstrap: NodeId(0),
            expected_superpeers: 1,
            sleep_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            unstable_ticks_before_promotion: None,
            bind_address: "127.0.0.1:8000".to_string(),
            api_port: None,
            nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from `NODE_ID`, `NODE_ROLE`, `BOOTSTRAP_ID`,
    /// `EXPECTED_SUPERPEERS`, `BIND_ADDRESS`, `API_PORT`, `SLEEP_INTERVAL`
    /// (milliseconds) and `PEER_ADDRESSES` (`id=host:port,...`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(value) = lookup("NODE_ID") {
            config.node_id = NodeId(parse_value("NODE_ID", &value)?);
        }
        config.bootstrap = match lookup("BOOTSTRAP_ID") {
            Some(value) => NodeId(parse_value("BOOTSTRAP_ID", &value)?),
            None => config.node_id,
        };
        if let Some(value) = lookup("NODE_ROLE") {
            config.role = match value.to_ascii_lowercase().as_str() {
                "superpeer" => NodeRole::Superpeer,
                "peer" => NodeRole::Peer,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "NODE_ROLE",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("EXPECTED_SUPERPEERS") {
            config.expected_superpeers = parse_value("EXPECTED_SUPERPEERS", &value)?;
        }
        if let Some(value) = lookup("SLEEP_INTERVAL") {
            config.sleep_interval = Duration::from_millis(parse_value("SLEEP_INTERVAL", &value)?);
        }
        if let Some(value) = lookup("BIND_ADDRESS") {
            config.bind_address = value;
        }
        if let Some(value) = lookup("API_PORT") {
            config.api_port = Some(parse_value("API_PORT", &value)?);
        }
        if let Some(value) = lookup("PEER_ADDRESSES") {
            config.nodes = parse_addresses(&value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_reserved() {
            return Err(ConfigError::ReservedNodeId(self.node_id));
        }
        if self.bootstrap.is_reserved() {
            return Err(ConfigError::ReservedNodeId(self.bootstrap));
        }
        if self.expected_superpeers == 0 {
            return Err(ConfigError::NoSuperpeersExpected);
        }
        Ok(())
    }

    /// Consecutive unstable stabilization rounds before a promotion.
    pub fn promotion_threshold(&self) -> u32 {
        if let Some(ticks) = self.unstable_ticks_before_promotion {
            return ticks;
        }
        let expected = u32::try_from(self.expected_superpeers).unwrap_or(u32::MAX);
        if expected >= 300 {
            300
        } else {
            expected.max(30)
        }
    }

    pub fn address_book(&self) -> HashMap<NodeId, String> {
        self.nodes
            .iter()
            .map(|node| (node.id, node.address.clone()))
            .collect()
    }
}

fn parse_value<V: std::str::FromStr>(key: &'static str, value: &str) -> Result<V, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_addresses(value: &str) -> Result<Vec<NodeAddress>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "PEER_ADDRESSES",
                value: entry.to_string(),
            })?;
            Ok(NodeAddress {
                id: NodeId(parse_value("PEER_ADDRESSES", id)?),
                address: address.trim().to_string(),
            })
        })
        .collect()
}

//! Configuration management for the gateway daemon.
//!
//! The on-disk format is TOML. On first run, if no config exists, a default
//! one is written. `NetworkConfig::to_settings` turns the `[network]` table
//! into the `GatewaySettings` the gateway itself consumes.

use crate::constants;
use crate::error::AppError;
use crate::network::address::NetAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the platform-specific data directory for the gateway
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\gatewayd
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gatewayd")
    } else {
        // Linux/Mac: ~/.gatewayd
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gatewayd")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "gatewayd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port`, or just `host` to use the default port. Port 0 lets the
    /// OS choose.
    pub listen_address: String,
    /// Public host to advertise instead of the bound one
    pub external_address: Option<String>,
    pub max_peers: usize,
    pub max_inbound_peers: usize,
    pub target_outbound_peers: usize,
    pub share_nodes_cap: usize,
    pub min_node_threshold: usize,
    pub max_probe_failures: u32,
    pub probe_batch: usize,
    pub enable_upnp: bool,
    /// Skip seeding the node directory and accept loopback gossip
    pub no_bootstrap: bool,
    /// Seed list override; empty means the built-in list
    pub bootstrap_peers: Vec<String>,
    pub peer_manager_interval_secs: u64,
    pub node_manager_interval_secs: u64,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{}", constants::protocol::DEFAULT_PORT),
            external_address: None,
            max_peers: constants::peers::MAX_PEERS,
            max_inbound_peers: constants::peers::MAX_INBOUND,
            target_outbound_peers: constants::peers::TARGET_OUTBOUND,
            share_nodes_cap: constants::gossip::SHARE_NODES_CAP,
            min_node_threshold: constants::gossip::MIN_NODE_THRESHOLD,
            max_probe_failures: constants::timing::MAX_PROBE_FAILURES,
            probe_batch: constants::timing::PROBE_BATCH,
            enable_upnp: true,
            no_bootstrap: false,
            bootstrap_peers: vec![],
            peer_manager_interval_secs: constants::timing::PEER_MANAGER_INTERVAL.as_secs(),
            node_manager_interval_secs: constants::timing::NODE_MANAGER_INTERVAL.as_secs(),
            dial_timeout_secs: constants::timing::DIAL_TIMEOUT.as_secs(),
            handshake_timeout_secs: constants::timing::HANDSHAKE_TIMEOUT.as_secs(),
            rpc_timeout_secs: constants::timing::RPC_TIMEOUT.as_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn full_listen_address(&self) -> String {
        if self.listen_address.contains(':') {
            self.listen_address.clone()
        } else {
            format!(
                "{}:{}",
                self.listen_address,
                constants::protocol::DEFAULT_PORT
            )
        }
    }

    pub fn to_settings(&self) -> Result<GatewaySettings, AppError> {
        let bootstrap_peers = if self.bootstrap_peers.is_empty() {
            GatewaySettings::default().bootstrap_peers
        } else {
            self.bootstrap_peers
                .iter()
                .map(|s| {
                    NetAddress::parse(s)
                        .map_err(|e| AppError::Config(format!("bootstrap peer {}: {}", s, e)))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        if self.target_outbound_peers > self.max_peers {
            return Err(AppError::Config(format!(
                "target_outbound_peers ({}) exceeds max_peers ({})",
                self.target_outbound_peers, self.max_peers
            )));
        }

        Ok(GatewaySettings {
            max_peers: self.max_peers,
            max_inbound_peers: self.max_inbound_peers,
            target_outbound_peers: self.target_outbound_peers,
            share_nodes_cap: self.share_nodes_cap,
            min_node_threshold: self.min_node_threshold,
            max_probe_failures: self.max_probe_failures.max(1),
            probe_batch: self.probe_batch,
            peer_manager_interval: Duration::from_secs(self.peer_manager_interval_secs.max(1)),
            node_manager_interval: Duration::from_secs(self.node_manager_interval_secs.max(1)),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs.max(1)),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs.max(1)),
            bootstrap_peers,
            isolated: self.no_bootstrap,
            enable_upnp: self.enable_upnp,
            external_address: self.external_address.clone().filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Empty means the platform default
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file" (daily-rolled gateway.log in the data dir)
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            let config = Config::default();
            config.save_to_file(path)?;
            config
        };

        if config.storage.data_dir.is_empty() {
            config.storage.data_dir = get_data_dir().to_string_lossy().to_string();
        }
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            get_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }
}

/// Runtime policy for a gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_peers: usize,
    pub max_inbound_peers: usize,
    pub target_outbound_peers: usize,
    pub share_nodes_cap: usize,
    pub min_node_threshold: usize,
    pub max_probe_failures: u32,
    pub probe_batch: usize,
    pub peer_manager_interval: Duration,
    pub node_manager_interval: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub bootstrap_peers: Vec<NetAddress>,
    /// Test/isolated mode: no seeding, loopback gossip allowed, no NAT or
    /// hostname side tasks.
    pub isolated: bool,
    pub enable_upnp: bool,
    pub external_address: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_peers: constants::peers::MAX_PEERS,
            max_inbound_peers: constants::peers::MAX_INBOUND,
            target_outbound_peers: constants::peers::TARGET_OUTBOUND,
            share_nodes_cap: constants::gossip::SHARE_NODES_CAP,
            min_node_threshold: constants::gossip::MIN_NODE_THRESHOLD,
            max_probe_failures: constants::timing::MAX_PROBE_FAILURES,
            probe_batch: constants::timing::PROBE_BATCH,
            peer_manager_interval: constants::timing::PEER_MANAGER_INTERVAL,
            node_manager_interval: constants::timing::NODE_MANAGER_INTERVAL,
            dial_timeout: constants::timing::DIAL_TIMEOUT,
            handshake_timeout: constants::timing::HANDSHAKE_TIMEOUT,
            rpc_timeout: constants::timing::RPC_TIMEOUT,
            bootstrap_peers: constants::bootstrap::BOOTSTRAP_PEERS
                .iter()
                .filter_map(|s| NetAddress::parse(s).ok())
                .collect(),
            isolated: false,
            enable_upnp: true,
            external_address: None,
        }
    }
}

impl GatewaySettings {
    /// Settings for tests and private networks. Background loops run on
    /// long intervals so tests drive them explicitly.
    pub fn isolated() -> Self {
        Self {
            bootstrap_peers: vec![],
            isolated: true,
            enable_upnp: false,
            peer_manager_interval: Duration::from_secs(3600),
            node_manager_interval: Duration::from_secs(3600),
            dial_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Whether gossip may carry loopback/unspecified addresses.
    pub fn allows_local_addresses(&self) -> bool {
        self.isolated
    }
}

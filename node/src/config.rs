//! Node configuration with TOML file support and `BN_` environment
//! overrides.
//!
//! The configuration is split into the sections shared with the other
//! processes of the suite: `[node]`, `[blockchain]`, `[database]`,
//! `[network]`, and `[bitcoin]`. Every key can be overridden through the
//! environment under the `BN_` prefix (`BN_<SECTION>_<KEY>`), and CLI flags
//! override both.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use bitnode_network::NetworkSettings;
use bitnode_types::NetworkId;

use crate::error::NodeError;

/// Configuration for a bitnode process.
///
/// Can be loaded from a TOML file via [`Configuration::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub blockchain: BlockchainSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub bitcoin: BitcoinSettings,
}

/// The `[node]` section: download coordination knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Lower bound on outbound peers, used to size the reservation cohort.
    #[serde(default = "default_minimum_connections")]
    pub minimum_connections: u32,

    /// Allowed ratio by which a slow peer may lag the pack before being
    /// dropped.
    #[serde(default = "default_maximum_deviation")]
    pub maximum_deviation: f64,

    /// Nominal per-block download deadline in seconds.
    #[serde(default = "default_block_latency_seconds")]
    pub block_latency_seconds: u64,
}

/// The `[blockchain]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockchainSettings {
    /// Upper bound on blocks retained off-chain after a reorganization.
    #[serde(default = "default_block_pool_capacity")]
    pub block_pool_capacity: usize,
}

/// The `[database]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Chain database directory.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Address indexing is expensive and a node doesn't use it.
    #[serde(default)]
    pub index_addresses: bool,
}

/// The `[bitcoin]` section: which chain the node participates in.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BitcoinSettings {
    #[serde(default)]
    pub network: NetworkId,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_minimum_connections() -> u32 {
    4
}

fn default_maximum_deviation() -> f64 {
    1.5
}

fn default_block_latency_seconds() -> u64 {
    60
}

fn default_block_pool_capacity() -> usize {
    5_000
}

fn default_directory() -> PathBuf {
    PathBuf::from("./bitnode_data")
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            minimum_connections: default_minimum_connections(),
            maximum_deviation: default_maximum_deviation(),
            block_latency_seconds: default_block_latency_seconds(),
        }
    }
}

impl Default for BlockchainSettings {
    fn default() -> Self {
        Self {
            block_pool_capacity: default_block_pool_capacity(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            index_addresses: false,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            node: NodeSettings::default(),
            blockchain: BlockchainSettings::default(),
            database: DatabaseSettings::default(),
            network: NetworkSettings::default(),
            bitcoin: BitcoinSettings::default(),
        }
    }
}

// ── Impl ───────────────────────────────────────────────────────────────

impl Configuration {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("configuration is always serializable to TOML")
    }

    /// The resolved P2P listen port: the configured bind port, or the
    /// selected network's default.
    pub fn listen_port(&self) -> u16 {
        if self.network.bind_port != 0 {
            self.network.bind_port
        } else {
            self.bitcoin.network.default_port()
        }
    }

    /// Apply `BN_`-prefixed environment overrides. Unparseable values are
    /// logged and skipped.
    pub fn apply_env_overrides(&mut self) {
        override_var("BN_LOG_FORMAT", &mut self.log_format);
        override_var("BN_LOG_LEVEL", &mut self.log_level);

        override_var("BN_NODE_MINIMUM_CONNECTIONS", &mut self.node.minimum_connections);
        override_var("BN_NODE_MAXIMUM_DEVIATION", &mut self.node.maximum_deviation);
        override_var(
            "BN_NODE_BLOCK_LATENCY_SECONDS",
            &mut self.node.block_latency_seconds,
        );

        override_var(
            "BN_BLOCKCHAIN_BLOCK_POOL_CAPACITY",
            &mut self.blockchain.block_pool_capacity,
        );

        override_var("BN_DATABASE_DIRECTORY", &mut self.database.directory);
        override_var("BN_DATABASE_INDEX_ADDRESSES", &mut self.database.index_addresses);

        override_var("BN_NETWORK_BIND_PORT", &mut self.network.bind_port);
        override_var(
            "BN_NETWORK_INBOUND_CONNECTIONS",
            &mut self.network.inbound_connections,
        );
        override_var(
            "BN_NETWORK_OUTBOUND_CONNECTIONS",
            &mut self.network.outbound_connections,
        );
        override_var(
            "BN_NETWORK_HOST_POOL_CAPACITY",
            &mut self.network.host_pool_capacity,
        );
        override_var("BN_NETWORK_ROTATION_SIZE", &mut self.network.rotation_size);
        override_var(
            "BN_NETWORK_PROTOCOL_MAXIMUM",
            &mut self.network.protocol_maximum,
        );
        override_var("BN_NETWORK_SERVICES", &mut self.network.services);
        override_var(
            "BN_NETWORK_CONNECT_TIMEOUT_SECS",
            &mut self.network.connect_timeout_secs,
        );
        override_var(
            "BN_NETWORK_HANDSHAKE_TIMEOUT_SECS",
            &mut self.network.handshake_timeout_secs,
        );

        if let Ok(value) = std::env::var("BN_BITCOIN_NETWORK") {
            match value.to_lowercase().as_str() {
                "mainnet" => self.bitcoin.network = NetworkId::Mainnet,
                "testnet" => self.bitcoin.network = NetworkId::Testnet,
                "regtest" => self.bitcoin.network = NetworkId::Regtest,
                other => {
                    tracing::warn!(value = other, "unrecognized BN_BITCOIN_NETWORK, ignored")
                }
            }
        }
    }
}

fn override_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = name, value = %value, "unparseable override, ignored"),
        }
    }
}

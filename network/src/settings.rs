//! Network configuration with TOML support.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use bitnode_types::{NODE_NETWORK, NODE_WITNESS};

/// Configuration for the P2P stack, the `[network]` section of the node's
/// configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Port to listen on for inbound connections. Zero selects the
    /// network's default port.
    #[serde(default)]
    pub bind_port: u16,

    /// Maximum inbound connections.
    #[serde(default = "default_inbound_connections")]
    pub inbound_connections: u32,

    /// Target outbound connections.
    #[serde(default = "default_outbound_connections")]
    pub outbound_connections: u32,

    /// Upper bound on the known-host pool.
    #[serde(default = "default_host_pool_capacity")]
    pub host_pool_capacity: usize,

    /// Log rotation size in bytes.
    #[serde(default = "default_rotation_size")]
    pub rotation_size: u64,

    /// Highest P2P protocol version to negotiate.
    #[serde(default = "default_protocol_maximum")]
    pub protocol_maximum: u32,

    /// Advertised service bitmap.
    #[serde(default = "default_services")]
    pub services: u64,

    /// Static peer addresses seeded into the host pool.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Version/verack handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Ping interval in minutes.
    #[serde(default = "default_heartbeat_minutes")]
    pub channel_heartbeat_minutes: u64,

    /// Drop a peer after this many minutes of silence.
    #[serde(default = "default_inactivity_minutes")]
    pub channel_inactivity_minutes: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_inbound_connections() -> u32 {
    100
}

fn default_outbound_connections() -> u32 {
    8
}

fn default_host_pool_capacity() -> usize {
    10_000
}

fn default_rotation_size() -> u64 {
    10_000_000
}

fn default_protocol_maximum() -> u32 {
    70_015
}

fn default_services() -> u64 {
    NODE_NETWORK | NODE_WITNESS
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_minutes() -> u64 {
    5
}

fn default_inactivity_minutes() -> u64 {
    10
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_port: 0,
            inbound_connections: default_inbound_connections(),
            outbound_connections: default_outbound_connections(),
            host_pool_capacity: default_host_pool_capacity(),
            rotation_size: default_rotation_size(),
            protocol_maximum: default_protocol_maximum(),
            services: default_services(),
            peers: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            channel_heartbeat_minutes: default_heartbeat_minutes(),
            channel_inactivity_minutes: default_inactivity_minutes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_node_class() {
        let settings = NetworkSettings::default();
        assert_eq!(settings.inbound_connections, 100);
        assert_eq!(settings.outbound_connections, 8);
        assert_eq!(settings.host_pool_capacity, 10_000);
        assert_eq!(settings.rotation_size, 10_000_000);
        assert_eq!(settings.services, NODE_NETWORK | NODE_WITNESS);
    }
}

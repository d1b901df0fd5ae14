//! Network identifiers, service flags, and per-network genesis headers.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::hash::BlockHash;
use crate::header::BlockHeader;

/// Advertised service bit: serves the full block chain.
pub const NODE_NETWORK: u64 = 1;
/// Advertised service bit: serves witness data.
pub const NODE_WITNESS: u64 = 1 << 3;

/// Which Bitcoin network the node participates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    Mainnet,
    Testnet,
    Regtest,
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl NetworkId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    /// Default P2P listen port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8333,
            Self::Testnet => 18333,
            Self::Regtest => 18444,
        }
    }

    /// Wire magic prefix.
    pub fn magic(&self) -> u32 {
        match self {
            Self::Mainnet => 0xd9b4_bef9,
            Self::Testnet => 0x0709_110b,
            Self::Regtest => 0xdab5_bffa,
        }
    }

    /// The genesis header for this network.
    pub fn genesis_header(&self) -> BlockHeader {
        let merkle_root = BlockHash::from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("genesis merkle constant");

        match self {
            Self::Mainnet => BlockHeader {
                version: 1,
                previous: BlockHash::ZERO,
                merkle_root,
                timestamp: 1_231_006_505,
                bits: 0x1d00ffff,
                nonce: 2_083_236_893,
            },
            Self::Testnet => BlockHeader {
                version: 1,
                previous: BlockHash::ZERO,
                merkle_root,
                timestamp: 1_296_688_602,
                bits: 0x1d00ffff,
                nonce: 414_098_458,
            },
            Self::Regtest => BlockHeader {
                version: 1,
                previous: BlockHash::ZERO,
                merkle_root,
                timestamp: 1_296_688_602,
                bits: 0x207fffff,
                nonce: 2,
            },
        }
    }

    /// The genesis block for this network. The coinbase payload is not
    /// carried; block content is opaque to this node class.
    pub fn genesis_block(&self) -> Block {
        Block::new(self.genesis_header(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_genesis_hash_is_genuine() {
        assert_eq!(
            NetworkId::Mainnet.genesis_header().hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn testnet_genesis_hash_is_genuine() {
        assert_eq!(
            NetworkId::Testnet.genesis_header().hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
    }

    #[test]
    fn regtest_genesis_hash_is_genuine() {
        assert_eq!(
            NetworkId::Regtest.genesis_header().hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn networks_have_distinct_ports_and_magic() {
        let ids = [NetworkId::Mainnet, NetworkId::Testnet, NetworkId::Regtest];
        for a in &ids {
            for b in &ids {
                if a != b {
                    assert_ne!(a.default_port(), b.default_port());
                    assert_ne!(a.magic(), b.magic());
                }
            }
        }
    }
}

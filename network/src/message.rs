//! Top-level P2P wire message envelope.
//!
//! Every message exchanged between peers is wrapped in [`Message`] and
//! carried inside a length-prefixed bincode frame (see
//! [`crate::connection`]). The envelope covers the subset of the protocol
//! the node drives: handshake, heartbeat, header solicitation, and block
//! download.

use serde::{Deserialize, Serialize};

use bitnode_types::{Block, BlockHash, BlockHeader, Transaction};

/// Top-level P2P wire message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Handshake opener: protocol version and advertised services.
    Version(VersionMsg),
    /// Handshake acknowledgement.
    Verack,
    /// Heartbeat probe with an echo nonce.
    Ping(u64),
    /// Heartbeat response.
    Pong(u64),
    /// Solicit headers above the best locator hash known to the receiver.
    GetHeaders(GetHeadersMsg),
    /// Header announcement or solicitation response.
    Headers(Vec<BlockHeader>),
    /// Inventory announcement (block hashes).
    Inv(Vec<BlockHash>),
    /// Request block bodies by hash.
    GetData(Vec<BlockHash>),
    /// A requested block body.
    Block(Block),
    /// A relayed transaction.
    Tx(Transaction),
    /// The requested data is not available.
    NotFound(Vec<BlockHash>),
}

/// Version handshake payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionMsg {
    pub version: u32,
    pub services: u64,
    pub height: u64,
    pub nonce: u64,
    pub user_agent: String,
}

/// Header solicitation: `locator` hashes ordered newest first; the
/// receiver replies with headers after the first hash it recognizes, up to
/// `stop` (zero for no limit).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetHeadersMsg {
    pub locator: Vec<BlockHash>,
    pub stop: BlockHash,
}

impl Message {
    /// Short command name for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::GetHeaders(_) => "getheaders",
            Self::Headers(_) => "headers",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::Block(_) => "block",
            Self::Tx(_) => "tx",
            Self::NotFound(_) => "notfound",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_through_bincode() {
        let msg = Message::GetHeaders(GetHeadersMsg {
            locator: vec![BlockHash::new([3u8; 32])],
            stop: BlockHash::ZERO,
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.command(), "getheaders");
    }

    #[test]
    fn command_names_are_distinct_for_the_download_path() {
        let a = Message::GetData(vec![]);
        let b = Message::Block(bitnode_types::NetworkId::Regtest.genesis_block());
        assert_ne!(a.command(), b.command());
    }
}

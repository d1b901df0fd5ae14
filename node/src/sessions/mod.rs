//! Per-peer protocol drivers.
//!
//! Three session kinds share one shape: a version/verack handshake bounded
//! by a timeout, a heartbeat loop with an inactivity bound, and a common
//! message-serving core. Outbound and manual sessions additionally consume
//! download reservations; inbound sessions primarily serve headers and
//! blocks to peers.
//!
//! Sessions hold a narrow view of the node: the chain facade, the
//! reservation queue, and the peer manager. They never call back into the
//! node itself.

pub mod inbound;
pub mod manual;
pub mod outbound;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use bitnode_chain::{BlockChain, ChainError};
use bitnode_network::message::{GetHeadersMsg, VersionMsg};
use bitnode_network::{
    Message, MessageReader, MessageWriter, NetworkError, NetworkSettings, PeerManager,
};
use bitnode_types::BlockHash;

use crate::error::NodeError;
use crate::reservations::Reservations;

/// Served per `getheaders` solicitation.
const MAX_HEADERS_PER_REPLY: usize = 2000;
/// Locator density: dense for the most recent entries, then doubling.
const LOCATOR_DENSE: usize = 10;

pub(crate) const USER_AGENT: &str = "/bitnode:0.1.0/";

/// The narrow node view handed to every session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub chain: Arc<BlockChain>,
    pub reservations: Reservations,
    pub peer_manager: Arc<Mutex<PeerManager>>,
    pub settings: NetworkSettings,
    pub shutdown: broadcast::Sender<()>,
}

impl SessionContext {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.settings.channel_heartbeat_minutes * 60)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.settings.channel_inactivity_minutes * 60)
    }

    pub fn disconnected(&self, addr: &SocketAddr) {
        self.peer_manager
            .lock()
            .expect("peer manager lock")
            .mark_disconnected(addr);
    }

    pub fn penalize(&self, addr: &SocketAddr, reason: bitnode_network::PenaltyReason) {
        self.peer_manager
            .lock()
            .expect("peer manager lock")
            .penalize(addr, reason);
    }

    pub fn reward(&self, addr: &SocketAddr) {
        self.peer_manager
            .lock()
            .expect("peer manager lock")
            .reward(addr);
    }
}

/// Exchange version/verack with the peer. Both sides open with `version`;
/// each acknowledges with `verack`. Returns the peer's version payload.
pub(crate) async fn handshake(
    rx: &mut MessageReader,
    tx: &mut MessageWriter,
    ctx: &SessionContext,
) -> Result<VersionMsg, NodeError> {
    let height = ctx.chain.get_top(false).map(|top| top.height).unwrap_or(0);
    tx.send(&Message::Version(VersionMsg {
        version: ctx.settings.protocol_maximum,
        services: ctx.settings.services,
        height,
        nonce: rand::random(),
        user_agent: USER_AGENT.to_string(),
    }))
    .await?;

    let deadline = Instant::now() + Duration::from_secs(ctx.settings.handshake_timeout_secs);
    let mut peer_version = None;
    let mut acknowledged = false;
    while peer_version.is_none() || !acknowledged {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = tokio::time::timeout(remaining, rx.recv())
            .await
            .map_err(|_| NodeError::Network(NetworkError::Timeout))??;
        match message {
            Message::Version(version) => {
                tx.send(&Message::Verack).await?;
                peer_version = Some(version);
            }
            Message::Verack => acknowledged = true,
            other => {
                return Err(NodeError::Network(NetworkError::ConnectionFailed(format!(
                    "unexpected {} during handshake",
                    other.command()
                ))));
            }
        }
    }
    Ok(peer_version.expect("version received"))
}

/// Build a block locator over the candidate index: the most recent hashes
/// densely, then doubling steps back to genesis.
pub(crate) fn build_locator(chain: &BlockChain) -> Vec<BlockHash> {
    let top = match chain.get_top(true) {
        Ok(top) => top,
        Err(_) => return Vec::new(),
    };
    let mut locator = Vec::new();
    let mut height = top.height as i64;
    let mut step = 1i64;
    while height > 0 {
        if let Some(hash) = chain.candidate_hash(height as u64) {
            locator.push(hash);
        }
        if locator.len() >= LOCATOR_DENSE {
            step *= 2;
        }
        height -= step;
    }
    if let Some(genesis) = chain.candidate_hash(0) {
        locator.push(genesis);
    }
    locator
}

/// Serve the messages every session kind answers identically. Messages the
/// caller intercepts (e.g. reserved blocks) must be handled before
/// delegating here.
pub(crate) async fn respond_common(
    ctx: &SessionContext,
    addr: SocketAddr,
    tx: &mut MessageWriter,
    message: Message,
) -> Result<(), NodeError> {
    match message {
        Message::Ping(nonce) => tx.send(&Message::Pong(nonce)).await?,
        Message::Pong(_) => {}
        Message::Inv(_) => {
            // Candidates are learned through headers, not inventories.
        }
        Message::Headers(headers) => match ctx.chain.organize_headers(&headers) {
            Ok(()) => {}
            Err(ChainError::Orphan(hash)) => {
                tracing::debug!(peer = %addr, %hash, "orphan header branch ignored");
            }
            Err(err) => return Err(err.into()),
        },
        Message::Block(block) => match ctx.chain.store_block(block) {
            Ok(()) => {}
            Err(ChainError::UnknownBlock(hash)) => {
                tracing::debug!(peer = %addr, %hash, "unsolicited unknown block");
            }
            Err(err) => return Err(err.into()),
        },
        Message::Tx(transaction) => match ctx.chain.announce_transaction(transaction) {
            Ok(()) | Err(ChainError::ServiceStopped) => {}
            Err(err) => return Err(err.into()),
        },
        Message::GetHeaders(GetHeadersMsg { locator, .. }) => {
            let start = locator
                .iter()
                .find(|hash| ctx.chain.height_of(hash).is_some())
                .copied()
                .or_else(|| ctx.chain.candidate_hash(0));
            let headers = start
                .map(|hash| ctx.chain.headers_after(&hash, MAX_HEADERS_PER_REPLY))
                .unwrap_or_default();
            tx.send(&Message::Headers(headers)).await?;
        }
        Message::GetData(hashes) => {
            let mut missing = Vec::new();
            for hash in hashes {
                match ctx.chain.get_block(&hash) {
                    Some(block) => {
                        tx.send(&Message::Block(block.block().clone())).await?;
                    }
                    None => missing.push(hash),
                }
            }
            if !missing.is_empty() {
                tx.send(&Message::NotFound(missing)).await?;
            }
        }
        Message::NotFound(_) => {}
        Message::Version(_) | Message::Verack => {
            return Err(NodeError::Network(NetworkError::ConnectionFailed(
                "handshake message after handshake".to_string(),
            )));
        }
    }
    Ok(())
}

/// Whether a session error is the quiet shutdown path.
pub(crate) fn is_shutdown(err: &NodeError) -> bool {
    matches!(
        err,
        NodeError::ServiceStopped
            | NodeError::Chain(ChainError::ServiceStopped)
            | NodeError::Network(NetworkError::ServiceStopped)
    )
}

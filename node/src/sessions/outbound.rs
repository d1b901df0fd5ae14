//! Outbound session: block download driver.
//!
//! After the handshake the session alternates between three duties:
//! soliciting headers with `getheaders`, consuming download reservations
//! (issue `getdata`, feed the body back through the slot), and answering
//! whatever the peer asks of us. A slot that expires or lags its cohort is
//! returned to the front of the queue and the peer is dropped.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bitnode_chain::ChainError;
use bitnode_network::message::GetHeadersMsg;
use bitnode_network::{Connection, Message, MessageWriter, NetworkError, PenaltyReason};
use bitnode_types::BlockHash;

use crate::error::NodeError;
use crate::reservations::Reservation;
use crate::sessions::{build_locator, handshake, is_shutdown, respond_common, SessionContext};

/// How often the session polls the reservation queue and checks its slot.
const RESERVATION_POLL: Duration = Duration::from_millis(500);
/// How often headers are solicited.
const HEADER_SOLICIT: Duration = Duration::from_secs(30);

pub(crate) async fn run(ctx: SessionContext, connection: Connection) {
    drive(ctx, connection, "outbound").await;
}

/// Shared driver for the outbound and manual kinds.
pub(crate) async fn drive(ctx: SessionContext, connection: Connection, kind: &'static str) {
    let addr = connection.addr();
    match sync_loop(&ctx, connection).await {
        Ok(()) => tracing::debug!(peer = %addr, kind, "session closed"),
        Err(err) if is_shutdown(&err) => {
            tracing::debug!(peer = %addr, kind, "session closed on shutdown");
        }
        Err(err) => tracing::debug!(peer = %addr, kind, error = %err, "session failed"),
    }
    ctx.disconnected(&addr);
}

async fn sync_loop(ctx: &SessionContext, connection: Connection) -> Result<(), NodeError> {
    let (addr, mut rx, mut tx) = connection.split();
    let peer = handshake(&mut rx, &mut tx, ctx).await?;
    tracing::debug!(
        peer = %addr,
        version = peer.version,
        agent = %peer.user_agent,
        height = peer.height,
        "handshake complete"
    );

    let mut shutdown_rx = ctx.shutdown.subscribe();
    let mut heartbeat = tokio::time::interval(ctx.heartbeat());
    let mut poll = tokio::time::interval(RESERVATION_POLL);
    let mut solicit = tokio::time::interval(HEADER_SOLICIT);
    let inactivity = ctx.inactivity();
    let mut last_activity = Instant::now();
    let mut reservation: Option<Reservation> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                // An outstanding slot is abandoned, not requeued.
                return Ok(());
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > inactivity {
                    ctx.penalize(&addr, PenaltyReason::Timeout);
                    return Err(NodeError::Network(NetworkError::Timeout));
                }
                tx.send(&Message::Ping(rand::random())).await?;
            }
            _ = solicit.tick() => {
                let locator = build_locator(&ctx.chain);
                if !locator.is_empty() {
                    tx.send(&Message::GetHeaders(GetHeadersMsg {
                        locator,
                        stop: BlockHash::ZERO,
                    }))
                    .await?;
                }
            }
            _ = poll.tick() => {
                let slow = reservation
                    .as_ref()
                    .map(|slot| slot.expired() || slot.lagging())
                    .unwrap_or(false);
                if slow {
                    let slot = reservation.take().expect("slow slot present");
                    tracing::debug!(
                        peer = %addr,
                        height = slot.height(),
                        "releasing reservation from slow peer"
                    );
                    slot.release();
                    ctx.penalize(&addr, PenaltyReason::Stall);
                    return Err(NodeError::Network(NetworkError::Timeout));
                }
                if reservation.is_none() {
                    if let Some(slot) = ctx.reservations.get() {
                        tx.send(&Message::GetData(vec![slot.hash()])).await?;
                        reservation = Some(slot);
                    }
                }
            }
            received = rx.recv() => {
                let message = received?;
                last_activity = Instant::now();
                handle(ctx, addr, &mut tx, &mut reservation, message).await?;
            }
        }
    }
}

async fn handle(
    ctx: &SessionContext,
    addr: SocketAddr,
    tx: &mut MessageWriter,
    reservation: &mut Option<Reservation>,
    message: Message,
) -> Result<(), NodeError> {
    match message {
        Message::Block(block) => {
            let hash = block.hash();
            let reserved = reservation
                .as_ref()
                .map(|slot| slot.hash() == hash)
                .unwrap_or(false);
            if reserved {
                let mut slot = reservation.take().expect("reserved slot present");
                slot.record(block.serialized_size());
                match slot.done(block) {
                    Ok(()) => ctx.reward(&addr),
                    // A reorg removed the candidate while the download was
                    // in flight; the slot is simply retired.
                    Err(ChainError::UnknownBlock(hash)) => {
                        tracing::debug!(peer = %addr, %hash, "reserved block left the index");
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                respond_common(ctx, addr, tx, Message::Block(block)).await?;
            }
            Ok(())
        }
        Message::NotFound(hashes) => {
            let reserved = reservation
                .as_ref()
                .map(|slot| hashes.contains(&slot.hash()))
                .unwrap_or(false);
            if reserved {
                let slot = reservation.take().expect("reserved slot present");
                tracing::debug!(
                    peer = %addr,
                    height = slot.height(),
                    "peer lacks reserved block"
                );
                slot.release();
                ctx.penalize(&addr, PenaltyReason::Timeout);
            }
            Ok(())
        }
        other => respond_common(ctx, addr, tx, other).await,
    }
}

//! Inbound session: serves headers and blocks to peers.

use std::time::Instant;

use bitnode_network::{Connection, Message, NetworkError, PenaltyReason};

use crate::error::NodeError;
use crate::sessions::{handshake, is_shutdown, respond_common, SessionContext};

pub(crate) async fn run(ctx: SessionContext, connection: Connection) {
    let addr = connection.addr();
    match serve_loop(&ctx, connection).await {
        Ok(()) => tracing::debug!(peer = %addr, "inbound session closed"),
        Err(err) if is_shutdown(&err) => {
            tracing::debug!(peer = %addr, "inbound session closed on shutdown");
        }
        Err(err) => tracing::debug!(peer = %addr, error = %err, "inbound session failed"),
    }
    ctx.disconnected(&addr);
}

async fn serve_loop(ctx: &SessionContext, connection: Connection) -> Result<(), NodeError> {
    let (addr, mut rx, mut tx) = connection.split();
    let peer = handshake(&mut rx, &mut tx, ctx).await?;
    tracing::debug!(
        peer = %addr,
        version = peer.version,
        agent = %peer.user_agent,
        "inbound handshake complete"
    );

    let mut shutdown_rx = ctx.shutdown.subscribe();
    let mut heartbeat = tokio::time::interval(ctx.heartbeat());
    let inactivity = ctx.inactivity();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > inactivity {
                    ctx.penalize(&addr, PenaltyReason::Timeout);
                    return Err(NodeError::Network(NetworkError::Timeout));
                }
                tx.send(&Message::Ping(rand::random())).await?;
            }
            received = rx.recv() => {
                let message = received?;
                last_activity = Instant::now();
                respond_common(ctx, addr, &mut tx, message).await?;
            }
        }
    }
}

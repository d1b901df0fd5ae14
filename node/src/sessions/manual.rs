//! Manual session: an operator-requested connection.
//!
//! Behaves like an outbound session; the distinction is who initiated the
//! connection and how failures are reported.

use bitnode_network::Connection;

use crate::sessions::{outbound, SessionContext};

pub(crate) async fn run(ctx: SessionContext, connection: Connection) {
    tracing::info!(peer = %connection.addr(), "manual session attached");
    outbound::drive(ctx, connection, "manual").await;
}

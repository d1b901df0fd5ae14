//! P2P networking layer for the bitnode workspace.
//!
//! Provides the wire message envelope, framed connections, the known-host
//! pool with scoring and banning, and the [`P2p`] facade that owns the
//! acceptor, dialer, and manual connector. Protocol drivers (sessions) are
//! attached through the [`SessionFactory`] extension points.

pub mod connection;
pub mod error;
pub mod message;
pub mod p2p;
pub mod peer_manager;
pub mod settings;

pub use connection::{Connection, MessageReader, MessageWriter};
pub use error::NetworkError;
pub use message::Message;
pub use p2p::{P2p, SessionFactory};
pub use peer_manager::{PeerManager, PenaltyReason};
pub use settings::NetworkSettings;

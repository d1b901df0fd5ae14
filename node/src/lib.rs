//! bitnode full node: binds the P2P stack to the blockchain engine and
//! drives block synchronization through reorganizations.
//!
//! The node is the central coordinator that:
//! - Owns the lifecycle state machine across both subsystems
//! - Seeds and maintains the block-download reservation queue
//! - Subscribes to header and block reorganizations
//! - Attaches the manual, inbound, and outbound protocol sessions

pub mod config;
pub mod error;
pub mod full_node;
pub mod logging;
pub mod reservations;
mod sessions;

pub use config::Configuration;
pub use error::NodeError;
pub use full_node::FullNode;
pub use reservations::{Reservation, Reservations};

//! Blockchain engine facade for the bitnode workspace.
//!
//! The [`BlockChain`] type binds a dual-chain index (candidate headers on
//! one side, confirmed blocks on the other) to a snapshot store and a set
//! of reorganization subscriptions. Content validation (scripts, signatures)
//! is out of scope; the index accepts the strongest connecting branch and
//! reports every reorganization to its subscribers in commit order.

pub mod chain;
pub mod error;
pub mod index;
pub mod store;

pub use chain::{BlockChain, BlockEvent, HeaderEvent, TransactionEvent};
pub use error::ChainError;
pub use index::{BlockReorg, ChainIndex, HeaderReindex};

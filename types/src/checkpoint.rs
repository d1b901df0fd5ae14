//! Block position identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::BlockHash;

/// Identifies a block position on a chain. Equality is by hash and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub hash: BlockHash,
    pub height: u64,
}

impl Checkpoint {
    pub fn new(hash: BlockHash, height: u64) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

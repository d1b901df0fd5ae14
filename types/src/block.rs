//! Blocks, transactions, and the shared header/block reference types.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::hash::{sha256d, BlockHash, TxHash};
use crate::header::BlockHeader;

/// A transaction. The core treats transaction content as opaque; validation
/// belongs to the chain engine's collaborators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub raw: Vec<u8>,
}

impl Transaction {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> TxHash {
        TxHash::new(*sha256d(&self.raw).as_bytes())
    }
}

/// A full block: header plus transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Serialized size in bytes, used for download-rate accounting.
    pub fn serialized_size(&self) -> usize {
        80 + self.transactions.iter().map(|tx| tx.raw.len()).sum::<usize>()
    }
}

/// An immutable shared header reference carrying its own hash.
///
/// The hash is computed once at construction and shared among subscribers;
/// the header is never mutated after publication.
#[derive(Clone, Debug)]
pub struct HeaderRef {
    inner: Arc<(BlockHeader, BlockHash)>,
}

impl HeaderRef {
    pub fn new(header: BlockHeader) -> Self {
        let hash = header.hash();
        Self {
            inner: Arc::new((header, hash)),
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.inner.0
    }

    pub fn hash(&self) -> BlockHash {
        self.inner.1
    }
}

/// An immutable shared block reference carrying its own hash.
#[derive(Clone, Debug)]
pub struct BlockRef {
    inner: Arc<(Block, BlockHash)>,
}

impl BlockRef {
    pub fn new(block: Block) -> Self {
        let hash = block.hash();
        Self {
            inner: Arc::new((block, hash)),
        }
    }

    pub fn block(&self) -> &Block {
        &self.inner.0
    }

    pub fn header(&self) -> &BlockHeader {
        &self.inner.0.header
    }

    pub fn hash(&self) -> BlockHash {
        self.inner.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous: BlockHash::ZERO,
            merkle_root: BlockHash::ZERO,
            timestamp: 1,
            bits: 0x207fffff,
            nonce: 0,
        }
    }

    #[test]
    fn header_ref_caches_the_hash() {
        let h = header();
        let r = HeaderRef::new(h);
        assert_eq!(r.hash(), h.hash());
        let clone = r.clone();
        assert_eq!(clone.hash(), r.hash());
    }

    #[test]
    fn block_hash_is_header_hash() {
        let block = Block::new(header(), vec![Transaction::new(vec![1, 2, 3])]);
        assert_eq!(block.hash(), header().hash());
        assert_eq!(block.serialized_size(), 83);
    }
}

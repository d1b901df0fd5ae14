//! Block header and its canonical 80-byte encoding.

use serde::{Deserialize, Serialize};

use crate::hash::{sha256d, BlockHash};

/// A block header. The header alone determines the block's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub previous: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Encode to the canonical 80-byte wire layout.
    pub fn encode(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Double SHA-256 of the canonical encoding.
    pub fn hash(&self) -> BlockHash {
        sha256d(&self.encode())
    }

    /// Whether this header extends `parent` (previous-hash linkage).
    pub fn extends(&self, parent: &BlockHash) -> bool {
        self.previous == *parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 2,
            previous: BlockHash::ZERO,
            merkle_root: BlockHash::ZERO,
            timestamp: 1_400_000_000,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn encoding_is_eighty_bytes_and_field_ordered() {
        let h = header(7);
        let bytes = h.encode();
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[76..80], &7u32.to_le_bytes());
    }

    #[test]
    fn hash_changes_with_nonce() {
        assert_ne!(header(1).hash(), header(2).hash());
    }

    #[test]
    fn extends_matches_previous_link() {
        let parent = header(1);
        let mut child = header(2);
        child.previous = parent.hash();
        assert!(child.extends(&parent.hash()));
        assert!(!parent.extends(&child.hash()));
    }
}

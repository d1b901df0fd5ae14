//! The dual-chain index: candidate headers and confirmed blocks.
//!
//! Headers and bodies reorganize independently. The candidate side is a
//! header chain whose bodies may not yet be downloaded; the confirmed side
//! is the contiguous prefix of candidates whose bodies are all present.
//! Blocks displaced from the confirmed chain by a reorganization are kept
//! in a side pool until the replacement branch confirms, at which point
//! they are reported as the outgoing set.

use std::collections::HashMap;

use bitnode_types::{Block, BlockHash, BlockHeader, BlockRef, Checkpoint, HeaderRef};

use crate::error::ChainError;

/// One slot on the candidate chain: a header, and its body once stored.
struct CandidateEntry {
    header: HeaderRef,
    block: Option<BlockRef>,
}

/// Result of splicing a header branch onto the candidate index.
///
/// `incoming` and `outgoing` are ordered by ascending height, starting at
/// `fork_height + 1`.
#[derive(Clone, Debug)]
pub struct HeaderReindex {
    pub fork_height: u64,
    pub incoming: Vec<HeaderRef>,
    pub outgoing: Vec<HeaderRef>,
}

/// Result of the confirmed chain advancing after a body arrived.
#[derive(Clone, Debug)]
pub struct BlockReorg {
    pub fork_height: u64,
    pub incoming: Vec<BlockRef>,
    pub outgoing: Vec<BlockRef>,
}

/// In-memory index over both chain views. Not internally synchronized;
/// [`crate::BlockChain`] serializes access.
pub struct ChainIndex {
    /// Candidate chain, indexed by height. Genesis occupies slot zero.
    candidates: Vec<CandidateEntry>,
    /// Heights keyed by candidate hash.
    by_hash: HashMap<BlockHash, u64>,
    /// Confirmed chain length. The confirmed chain is always the prefix of
    /// `candidates` whose bodies are present, so only the length is kept.
    confirmed_len: u64,
    /// Bodies displaced from the candidate or confirmed chain by a
    /// reorganization, reusable if their branch returns.
    displaced: HashMap<BlockHash, BlockRef>,
    /// Confirmed blocks removed by the last reorganization, reported as
    /// outgoing when the replacement branch next confirms.
    pending_outgoing: Vec<BlockRef>,
    /// Upper bound on the displaced pool.
    pool_capacity: usize,
}

/// Default bound on the displaced pool, overridable through the
/// `[blockchain] block_pool_capacity` setting.
const DEFAULT_POOL_CAPACITY: usize = 5_000;

impl ChainIndex {
    /// Build an index seeded with the genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let block = BlockRef::new(genesis);
        let header = HeaderRef::new(*block.header());
        let mut by_hash = HashMap::new();
        by_hash.insert(header.hash(), 0);
        Self {
            candidates: vec![CandidateEntry {
                header,
                block: Some(block),
            }],
            by_hash,
            confirmed_len: 1,
            displaced: HashMap::new(),
            pending_outgoing: Vec::new(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    /// Rebuild from persisted candidate entries. The confirmed chain is the
    /// contiguous populated prefix.
    pub fn from_entries(entries: Vec<(BlockHeader, Option<Block>)>) -> Result<Self, ChainError> {
        if entries.is_empty() {
            return Err(ChainError::Store("empty candidate index".into()));
        }
        let mut candidates = Vec::with_capacity(entries.len());
        let mut by_hash = HashMap::with_capacity(entries.len());
        for (height, (header, block)) in entries.into_iter().enumerate() {
            let header = HeaderRef::new(header);
            by_hash.insert(header.hash(), height as u64);
            candidates.push(CandidateEntry {
                header,
                block: block.map(BlockRef::new),
            });
        }
        let mut index = Self {
            candidates,
            by_hash,
            confirmed_len: 0,
            displaced: HashMap::new(),
            pending_outgoing: Vec::new(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
        };
        index.confirmed_len = index.contiguous_len();
        if index.confirmed_len == 0 {
            return Err(ChainError::Store("missing genesis body".into()));
        }
        Ok(index)
    }

    /// Export the candidate entries for persistence.
    pub fn entries(&self) -> Vec<(BlockHeader, Option<Block>)> {
        self.candidates
            .iter()
            .map(|entry| {
                (
                    *entry.header.header(),
                    entry.block.as_ref().map(|b| b.block().clone()),
                )
            })
            .collect()
    }

    pub fn set_pool_capacity(&mut self, capacity: usize) {
        self.pool_capacity = capacity.max(1);
        self.prune_displaced();
    }

    /// Keep the displaced pool within its bound. Eviction order is
    /// arbitrary; an evicted body is simply re-downloaded if its branch
    /// returns.
    fn prune_displaced(&mut self) {
        while self.displaced.len() > self.pool_capacity {
            let victim = match self.displaced.keys().next() {
                Some(hash) => *hash,
                None => break,
            };
            self.displaced.remove(&victim);
        }
    }

    fn contiguous_len(&self) -> u64 {
        self.candidates
            .iter()
            .take_while(|entry| entry.block.is_some())
            .count() as u64
    }

    pub fn candidate_top(&self) -> Checkpoint {
        let height = self.candidates.len() as u64 - 1;
        Checkpoint::new(self.candidates[height as usize].header.hash(), height)
    }

    pub fn confirmed_top(&self) -> Checkpoint {
        let height = self.confirmed_len - 1;
        Checkpoint::new(self.candidates[height as usize].header.hash(), height)
    }

    /// The highest candidate whose body, and every body below it, is present.
    pub fn top_valid_candidate(&self) -> Checkpoint {
        let height = self.contiguous_len() - 1;
        Checkpoint::new(self.candidates[height as usize].header.hash(), height)
    }

    /// The candidate hash at `height` iff its body has not been stored.
    pub fn downloadable(&self, height: u64) -> Option<BlockHash> {
        let entry = self.candidates.get(height as usize)?;
        if entry.block.is_none() {
            Some(entry.header.hash())
        } else {
            None
        }
    }

    pub fn candidate_hash(&self, height: u64) -> Option<BlockHash> {
        self.candidates
            .get(height as usize)
            .map(|entry| entry.header.hash())
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    /// Look up a stored body by hash, on either chain view or in the
    /// displaced pool.
    pub fn block(&self, hash: &BlockHash) -> Option<BlockRef> {
        if let Some(height) = self.by_hash.get(hash) {
            if let Some(block) = &self.candidates[*height as usize].block {
                return Some(block.clone());
            }
        }
        self.displaced.get(hash).cloned()
    }

    /// Candidate headers strictly above the height of `from`, up to `max`.
    pub fn headers_after(&self, from: &BlockHash, max: usize) -> Vec<BlockHeader> {
        let start = match self.by_hash.get(from) {
            Some(height) => *height as usize + 1,
            None => return Vec::new(),
        };
        self.candidates[start.min(self.candidates.len())..]
            .iter()
            .take(max)
            .map(|entry| *entry.header.header())
            .collect()
    }

    /// Splice a connected header branch onto the candidate index.
    ///
    /// The branch must link internally, and its first header must extend a
    /// hash already in the index (the fork point). A branch that does not
    /// outreach the entries it would replace is ignored and `None` is
    /// returned. On success the displaced candidate entries become the
    /// reindex's outgoing set; if the fork undercuts the confirmed chain the
    /// removed confirmed blocks are held back until the replacement branch
    /// confirms.
    pub fn splice_headers(
        &mut self,
        headers: &[BlockHeader],
    ) -> Result<Option<HeaderReindex>, ChainError> {
        let first = match headers.first() {
            Some(first) => first,
            None => return Ok(None),
        };

        for pair in headers.windows(2) {
            if !pair[1].extends(&pair[0].hash()) {
                return Err(ChainError::Orphan(pair[1].hash()));
            }
        }

        let fork_height = self
            .by_hash
            .get(&first.previous)
            .copied()
            .ok_or_else(|| ChainError::Orphan(first.hash()))?;

        // Drop the prefix already present at the same position, so repeated
        // announcements of known headers do not masquerade as reorgs.
        let mut fork_height = fork_height;
        let mut headers = headers;
        while let Some(first) = headers.first() {
            match self.candidate_hash(fork_height + 1) {
                Some(existing) if existing == first.hash() => {
                    fork_height += 1;
                    headers = &headers[1..];
                }
                _ => break,
            }
        }
        if headers.is_empty() {
            return Ok(None);
        }

        let replaced = self.candidates.len() as u64 - 1 - fork_height;
        if headers.len() as u64 <= replaced {
            return Ok(None);
        }

        let mut outgoing = Vec::with_capacity(replaced as usize);
        for entry in self.candidates.drain(fork_height as usize + 1..) {
            self.by_hash.remove(&entry.header.hash());
            if let Some(block) = entry.block {
                self.displaced.insert(block.hash(), block);
            }
            outgoing.push(entry.header);
        }

        // Confirmed blocks above the fork move to the pending outgoing set,
        // reported once the replacement branch confirms past the fork.
        if self.confirmed_len > fork_height + 1 {
            for header in &outgoing[..(self.confirmed_len - fork_height - 1) as usize] {
                if let Some(block) = self.displaced.get(&header.hash()) {
                    self.pending_outgoing.push(block.clone());
                }
            }
            self.confirmed_len = fork_height + 1;
        }

        let mut incoming = Vec::with_capacity(headers.len());
        for header in headers {
            let header = HeaderRef::new(*header);
            let height = self.candidates.len() as u64;
            self.by_hash.insert(header.hash(), height);
            let block = self.displaced.remove(&header.hash());
            if block.is_some() {
                // The body is back on-chain; it is no longer outgoing.
                self.pending_outgoing.retain(|b| b.hash() != header.hash());
            }
            self.candidates.push(CandidateEntry {
                header: header.clone(),
                block,
            });
            incoming.push(header);
        }
        self.prune_displaced();

        Ok(Some(HeaderReindex {
            fork_height,
            incoming,
            outgoing,
        }))
    }

    /// Attach a downloaded body to its candidate entry and advance the
    /// confirmed chain over every contiguous populated candidate.
    ///
    /// Returns the resulting block reorganization, or `None` when the body
    /// was a duplicate or the confirmed top did not move.
    pub fn attach_body(&mut self, block: Block) -> Result<Option<BlockReorg>, ChainError> {
        let hash = block.hash();
        let height = *self
            .by_hash
            .get(&hash)
            .ok_or(ChainError::UnknownBlock(hash))?;

        let entry = &mut self.candidates[height as usize];
        if entry.block.is_some() {
            return Ok(None);
        }
        entry.block = Some(BlockRef::new(block));

        Ok(self.advance_confirmed())
    }

    /// Advance the confirmed chain over every contiguous populated
    /// candidate. Also called after a splice that reattached displaced
    /// bodies. Displaced blocks held back by the last reorganization ride
    /// out with the first advance.
    pub fn advance_confirmed(&mut self) -> Option<BlockReorg> {
        let fork_height = self.confirmed_len - 1;
        let mut incoming = Vec::new();
        while let Some(entry) = self.candidates.get(self.confirmed_len as usize) {
            match &entry.block {
                Some(block) => {
                    incoming.push(block.clone());
                    self.confirmed_len += 1;
                }
                None => break,
            }
        }

        if incoming.is_empty() {
            return None;
        }

        Some(BlockReorg {
            fork_height,
            incoming,
            outgoing: std::mem::take(&mut self.pending_outgoing),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_types::NetworkId;

    fn genesis() -> Block {
        NetworkId::Regtest.genesis_block()
    }

    /// Deterministic child header; `salt` differentiates competing branches.
    fn child_of(parent: &BlockHeader, salt: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous: parent.hash(),
            merkle_root: BlockHash::ZERO,
            timestamp: 1_296_688_602 + salt,
            bits: 0x207fffff,
            nonce: salt,
        }
    }

    fn extend(index: &mut ChainIndex, count: usize, salt: u32) -> Vec<BlockHeader> {
        let mut parent = {
            let top = index.candidate_top();
            let height = top.height;
            *index.candidates[height as usize].header.header()
        };
        let mut headers = Vec::new();
        for i in 0..count {
            let header = child_of(&parent, salt + i as u32);
            headers.push(header);
            parent = header;
        }
        index.splice_headers(&headers).unwrap();
        headers
    }

    #[test]
    fn genesis_seeds_both_views() {
        let index = ChainIndex::with_genesis(genesis());
        assert_eq!(index.candidate_top().height, 0);
        assert_eq!(index.confirmed_top().height, 0);
        assert_eq!(index.top_valid_candidate().height, 0);
        assert!(index.downloadable(0).is_none());
    }

    #[test]
    fn extension_reindex_has_empty_outgoing() {
        let mut index = ChainIndex::with_genesis(genesis());
        let header = child_of(&genesis().header, 1);
        let reindex = index.splice_headers(&[header]).unwrap().unwrap();
        assert_eq!(reindex.fork_height, 0);
        assert_eq!(reindex.incoming.len(), 1);
        assert!(reindex.outgoing.is_empty());
        assert_eq!(index.candidate_top().height, 1);
        assert_eq!(index.downloadable(1), Some(header.hash()));
    }

    #[test]
    fn known_headers_do_not_reorganize() {
        let mut index = ChainIndex::with_genesis(genesis());
        let headers = extend(&mut index, 3, 1);
        assert!(index.splice_headers(&headers).unwrap().is_none());
        assert_eq!(index.candidate_top().height, 3);
    }

    #[test]
    fn shorter_branch_is_ignored() {
        let mut index = ChainIndex::with_genesis(genesis());
        extend(&mut index, 3, 1);
        let rival = child_of(&genesis().header, 99);
        assert!(index.splice_headers(&[rival]).unwrap().is_none());
        assert_eq!(index.candidate_top().height, 3);
    }

    #[test]
    fn longer_branch_reorganizes_at_fork() {
        let mut index = ChainIndex::with_genesis(genesis());
        let old = extend(&mut index, 2, 1);

        let mut rival = vec![child_of(&genesis().header, 50)];
        rival.push(child_of(&rival[0], 51));
        rival.push(child_of(&rival[1], 52));

        let reindex = index.splice_headers(&rival).unwrap().unwrap();
        assert_eq!(reindex.fork_height, 0);
        assert_eq!(reindex.outgoing.len(), 2);
        assert_eq!(reindex.incoming.len(), 3);
        assert_eq!(reindex.outgoing[0].hash(), old[0].hash());
        assert_eq!(index.candidate_top().height, 3);
    }

    #[test]
    fn orphan_branch_is_rejected() {
        let mut index = ChainIndex::with_genesis(genesis());
        let stray = BlockHeader {
            version: 1,
            previous: BlockHash::new([9u8; 32]),
            merkle_root: BlockHash::ZERO,
            timestamp: 0,
            bits: 0,
            nonce: 0,
        };
        assert!(matches!(
            index.splice_headers(&[stray]),
            Err(ChainError::Orphan(_))
        ));
    }

    #[test]
    fn body_arrival_advances_confirmed_chain() {
        let mut index = ChainIndex::with_genesis(genesis());
        let headers = extend(&mut index, 2, 1);

        let reorg = index
            .attach_body(Block::new(headers[0], Vec::new()))
            .unwrap()
            .unwrap();
        assert_eq!(reorg.fork_height, 0);
        assert_eq!(reorg.incoming.len(), 1);
        assert!(reorg.outgoing.is_empty());
        assert_eq!(index.confirmed_top().height, 1);
        assert_eq!(index.top_valid_candidate().height, 1);
        assert!(index.downloadable(1).is_none());
        assert_eq!(index.downloadable(2), Some(headers[1].hash()));
    }

    #[test]
    fn out_of_order_bodies_confirm_in_one_advance() {
        let mut index = ChainIndex::with_genesis(genesis());
        let headers = extend(&mut index, 2, 1);

        assert!(index
            .attach_body(Block::new(headers[1], Vec::new()))
            .unwrap()
            .is_none());
        let reorg = index
            .attach_body(Block::new(headers[0], Vec::new()))
            .unwrap()
            .unwrap();
        assert_eq!(reorg.incoming.len(), 2);
        assert_eq!(index.confirmed_top().height, 2);
    }

    #[test]
    fn duplicate_body_is_ignored() {
        let mut index = ChainIndex::with_genesis(genesis());
        let headers = extend(&mut index, 1, 1);
        let block = Block::new(headers[0], Vec::new());
        assert!(index.attach_body(block.clone()).unwrap().is_some());
        assert!(index.attach_body(block).unwrap().is_none());
    }

    #[test]
    fn unknown_body_is_rejected() {
        let mut index = ChainIndex::with_genesis(genesis());
        let stray = Block::new(child_of(&genesis().header, 77), Vec::new());
        assert!(matches!(
            index.attach_body(stray),
            Err(ChainError::UnknownBlock(_))
        ));
    }

    #[test]
    fn confirmed_reorg_reports_displaced_blocks() {
        let mut index = ChainIndex::with_genesis(genesis());
        let old = extend(&mut index, 2, 1);
        for header in &old {
            index.attach_body(Block::new(*header, Vec::new())).unwrap();
        }
        assert_eq!(index.confirmed_top().height, 2);

        let mut rival = vec![child_of(&genesis().header, 50)];
        rival.push(child_of(&rival[0], 51));
        rival.push(child_of(&rival[1], 52));
        index.splice_headers(&rival).unwrap().unwrap();
        assert_eq!(index.confirmed_top().height, 0);

        let mut reorgs = Vec::new();
        for header in &rival {
            if let Some(r) = index.attach_body(Block::new(*header, Vec::new())).unwrap() {
                reorgs.push(r);
            }
        }
        // The displaced blocks ride out with the first advance past the fork.
        assert_eq!(reorgs[0].fork_height, 0);
        assert_eq!(reorgs[0].outgoing.len(), 2);
        assert_eq!(reorgs[0].incoming.len(), 1);
        let advanced: usize = reorgs.iter().map(|r| r.incoming.len()).sum();
        assert_eq!(advanced, 3);
        assert_eq!(index.confirmed_top().height, 3);
    }

    #[test]
    fn displaced_bodies_are_reused_when_their_branch_returns() {
        let mut index = ChainIndex::with_genesis(genesis());
        let old = extend(&mut index, 2, 1);
        for header in &old {
            index.attach_body(Block::new(*header, Vec::new())).unwrap();
        }

        // Reorg away, then reorg back with one extra header on the old branch.
        let mut rival = vec![child_of(&genesis().header, 50)];
        rival.push(child_of(&rival[0], 51));
        rival.push(child_of(&rival[1], 52));
        index.splice_headers(&rival).unwrap().unwrap();

        let mut restored = old.clone();
        restored.push(child_of(&old[1], 2));
        restored.push(child_of(restored.last().unwrap(), 3));
        index.splice_headers(&restored).unwrap().unwrap();

        // The first two bodies were displaced and must be back in place.
        assert!(index.downloadable(1).is_none());
        assert!(index.downloadable(2).is_none());
        assert_eq!(index.top_valid_candidate().height, 2);
    }

    #[test]
    fn entries_round_trip() {
        let mut index = ChainIndex::with_genesis(genesis());
        let headers = extend(&mut index, 2, 1);
        index
            .attach_body(Block::new(headers[0], Vec::new()))
            .unwrap();

        let rebuilt = ChainIndex::from_entries(index.entries()).unwrap();
        assert_eq!(rebuilt.candidate_top(), index.candidate_top());
        assert_eq!(rebuilt.confirmed_top(), index.confirmed_top());
        assert_eq!(rebuilt.downloadable(2), index.downloadable(2));
    }
}

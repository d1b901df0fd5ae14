//! The blockchain facade: lifecycle, queries, commits, and subscriptions.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use bitnode_types::{
    Block, BlockHash, BlockHeader, BlockRef, Checkpoint, HeaderRef, NetworkId, Transaction,
};

use crate::error::ChainError;
use crate::index::ChainIndex;
use crate::store::{ChainStore, Loaded};

/// A header-chain reorganization delivered to subscribers.
///
/// `incoming`/`outgoing` are ordered by ascending height above
/// `fork_height`. A `code` of [`ChainError::ServiceStopped`] is the final
/// event a subscriber sees.
#[derive(Clone)]
pub struct HeaderEvent {
    pub code: Option<ChainError>,
    pub fork_height: u64,
    pub incoming: Arc<Vec<HeaderRef>>,
    pub outgoing: Arc<Vec<HeaderRef>>,
}

/// A block-chain reorganization delivered to subscribers.
#[derive(Clone)]
pub struct BlockEvent {
    pub code: Option<ChainError>,
    pub fork_height: u64,
    pub incoming: Arc<Vec<BlockRef>>,
    pub outgoing: Arc<Vec<BlockRef>>,
}

/// A transaction-pool arrival delivered to subscribers.
#[derive(Clone)]
pub struct TransactionEvent {
    pub code: Option<ChainError>,
    pub transaction: Option<Arc<Transaction>>,
}

type Handler<E> = Box<dyn FnMut(&E) -> bool + Send>;

/// A list of subscription handlers. A handler returning `false` is dropped.
struct Subscribers<E> {
    handlers: Mutex<Vec<Handler<E>>>,
}

impl<E> Subscribers<E> {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, handler: Handler<E>) {
        self.handlers.lock().expect("subscriber lock").push(handler);
    }

    fn notify(&self, event: &E) {
        let mut handlers = self.handlers.lock().expect("subscriber lock");
        handlers.retain_mut(|handler| handler(event));
    }

    /// Deliver a final event and drop every handler regardless of its
    /// return value.
    fn notify_last(&self, event: &E) {
        let mut handlers = self.handlers.lock().expect("subscriber lock");
        for handler in handlers.iter_mut() {
            handler(event);
        }
        handlers.clear();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unstarted,
    Started,
    Stopped,
    Closed,
}

/// Opaque handle to the blockchain and database engine.
///
/// Commits (header splices, body arrivals, transaction announcements) are
/// serialized by a dispatch mutex, so subscribers observe events in commit
/// order and never concurrently. Handlers run to completion on the
/// committing thread.
pub struct BlockChain {
    network: NetworkId,
    store: Option<ChainStore>,
    index: RwLock<ChainIndex>,
    corrupt: bool,
    state: Mutex<Lifecycle>,
    dispatch: Mutex<()>,
    header_subs: Subscribers<HeaderEvent>,
    block_subs: Subscribers<BlockEvent>,
    tx_subs: Subscribers<TransactionEvent>,
}

impl BlockChain {
    /// Open the chain database rooted at `directory`. The directory must
    /// have been initialized (see [`BlockChain::initialize`]); an
    /// undecodable snapshot or a genesis mismatch leaves the handle in a
    /// corrupt state that surfaces through [`BlockChain::get_top`].
    pub fn open(directory: impl AsRef<Path>, network: NetworkId) -> Result<Self, ChainError> {
        let store = ChainStore::new(directory.as_ref());
        let (index, corrupt) = match store.load(network)? {
            Loaded::Snapshot(entries) => (ChainIndex::from_entries(entries)?, false),
            Loaded::Corrupt => {
                tracing::error!(
                    directory = %directory.as_ref().display(),
                    "chain snapshot is corrupt"
                );
                (ChainIndex::with_genesis(network.genesis_block()), true)
            }
        };
        Ok(Self::assemble(network, Some(store), index, corrupt))
    }

    /// A chain with no backing directory, seeded at genesis. Used by tests
    /// and tools that do not persist.
    pub fn in_memory(network: NetworkId) -> Self {
        Self::assemble(
            network,
            None,
            ChainIndex::with_genesis(network.genesis_block()),
            false,
        )
    }

    /// Create the database directory and write the genesis record.
    pub fn initialize(directory: impl AsRef<Path>, network: NetworkId) -> Result<(), ChainError> {
        ChainStore::new(directory.as_ref()).initialize(network)
    }

    /// Whether `directory` holds an initialized chain.
    pub fn is_initialized(directory: impl AsRef<Path>) -> bool {
        ChainStore::new(directory.as_ref()).exists()
    }

    fn assemble(
        network: NetworkId,
        store: Option<ChainStore>,
        index: ChainIndex,
        corrupt: bool,
    ) -> Self {
        Self {
            network,
            store,
            index: RwLock::new(index),
            corrupt,
            state: Mutex::new(Lifecycle::Unstarted),
            dispatch: Mutex::new(()),
            header_subs: Subscribers::new(),
            block_subs: Subscribers::new(),
            tx_subs: Subscribers::new(),
        }
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn start(&self) -> Result<(), ChainError> {
        let mut state = self.state.lock().expect("chain state lock");
        match *state {
            Lifecycle::Unstarted | Lifecycle::Stopped => {
                *state = Lifecycle::Started;
                Ok(())
            }
            _ => Err(ChainError::OperationFailed),
        }
    }

    /// Signal stop: every subscriber receives a final `ServiceStopped`
    /// event and is dropped, then the snapshot is rewritten. Idempotent.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().expect("chain state lock");
            if *state != Lifecycle::Started {
                return true;
            }
            *state = Lifecycle::Stopped;
        }

        let _order = self.dispatch.lock().expect("chain dispatch lock");
        self.header_subs.notify_last(&HeaderEvent {
            code: Some(ChainError::ServiceStopped),
            fork_height: 0,
            incoming: Arc::new(Vec::new()),
            outgoing: Arc::new(Vec::new()),
        });
        self.block_subs.notify_last(&BlockEvent {
            code: Some(ChainError::ServiceStopped),
            fork_height: 0,
            incoming: Arc::new(Vec::new()),
            outgoing: Arc::new(Vec::new()),
        });
        self.tx_subs.notify_last(&TransactionEvent {
            code: Some(ChainError::ServiceStopped),
            transaction: None,
        });

        self.flush()
    }

    /// Stop if needed, then release the handle. Idempotent.
    pub fn close(&self) -> bool {
        let stopped = self.stop();
        let mut state = self.state.lock().expect("chain state lock");
        *state = Lifecycle::Closed;
        stopped
    }

    pub fn stopped(&self) -> bool {
        *self.state.lock().expect("chain state lock") != Lifecycle::Started
    }

    fn flush(&self) -> bool {
        let store = match &self.store {
            Some(store) => store,
            None => return true,
        };
        if self.corrupt {
            // Never overwrite evidence of a corrupt database.
            return true;
        }
        let entries = self.index.read().expect("chain index lock").entries();
        match store.save(self.network, entries) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = %err, "failed to write chain snapshot");
                false
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// The highest confirmed block (`candidate = false`) or the highest
    /// candidate header (`candidate = true`). Fails iff the database is
    /// corrupt.
    pub fn get_top(&self, candidate: bool) -> Result<Checkpoint, ChainError> {
        if self.corrupt {
            return Err(ChainError::ChainCorrupt);
        }
        let index = self.index.read().expect("chain index lock");
        Ok(if candidate {
            index.candidate_top()
        } else {
            index.confirmed_top()
        })
    }

    /// The highest candidate block whose body has been stored, along with
    /// every body below it. Seeds the download queue.
    pub fn top_valid_candidate_state(&self) -> Result<Checkpoint, ChainError> {
        if self.corrupt {
            return Err(ChainError::ChainCorrupt);
        }
        Ok(self
            .index
            .read()
            .expect("chain index lock")
            .top_valid_candidate())
    }

    /// The candidate hash at `height` iff its body has not been stored.
    pub fn get_downloadable(&self, height: u64) -> Option<BlockHash> {
        if self.corrupt {
            return None;
        }
        self.index
            .read()
            .expect("chain index lock")
            .downloadable(height)
    }

    pub fn candidate_hash(&self, height: u64) -> Option<BlockHash> {
        if self.corrupt {
            return None;
        }
        self.index
            .read()
            .expect("chain index lock")
            .candidate_hash(height)
    }

    /// The candidate height of `hash`, if indexed.
    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.index.read().expect("chain index lock").height_of(hash)
    }

    /// Bound the pool of blocks displaced by reorganizations.
    pub fn set_block_pool_capacity(&self, capacity: usize) {
        self.index
            .write()
            .expect("chain index lock")
            .set_pool_capacity(capacity);
    }

    /// Look up a stored block body for serving peers.
    pub fn get_block(&self, hash: &BlockHash) -> Option<BlockRef> {
        self.index.read().expect("chain index lock").block(hash)
    }

    /// Candidate headers above the given locator hash, for serving peers.
    pub fn headers_after(&self, from: &BlockHash, max: usize) -> Vec<BlockHeader> {
        self.index
            .read()
            .expect("chain index lock")
            .headers_after(from, max)
    }

    // ── Commits ─────────────────────────────────────────────────────────

    fn check_writable(&self) -> Result<(), ChainError> {
        if self.stopped() {
            return Err(ChainError::ServiceStopped);
        }
        if self.corrupt {
            return Err(ChainError::ChainCorrupt);
        }
        Ok(())
    }

    /// Splice a header branch onto the candidate index and notify header
    /// subscribers; if the splice reattached displaced bodies and the
    /// confirmed chain advanced, the block reorganization is dispatched
    /// after the reindex. A branch that does not reorganize the index
    /// (already known, or too short) commits nothing.
    pub fn organize_headers(&self, headers: &[BlockHeader]) -> Result<(), ChainError> {
        self.check_writable()?;
        let _order = self.dispatch.lock().expect("chain dispatch lock");
        let (reindex, reorg) = {
            let mut index = self.index.write().expect("chain index lock");
            match index.splice_headers(headers)? {
                Some(reindex) => {
                    let reorg = index.advance_confirmed();
                    (Some(reindex), reorg)
                }
                None => (None, None),
            }
        };
        if let Some(reindex) = reindex {
            tracing::debug!(
                fork = reindex.fork_height,
                incoming = reindex.incoming.len(),
                outgoing = reindex.outgoing.len(),
                "header index reorganized"
            );
            self.header_subs.notify(&HeaderEvent {
                code: None,
                fork_height: reindex.fork_height,
                incoming: Arc::new(reindex.incoming),
                outgoing: Arc::new(reindex.outgoing),
            });
        }
        if let Some(reorg) = reorg {
            self.notify_reorg(reorg);
        }
        Ok(())
    }

    /// Attach a downloaded body and notify block subscribers if the
    /// confirmed chain advanced. Duplicate bodies commit nothing.
    pub fn store_block(&self, block: Block) -> Result<(), ChainError> {
        self.check_writable()?;
        let _order = self.dispatch.lock().expect("chain dispatch lock");
        let reorg = {
            let mut index = self.index.write().expect("chain index lock");
            index.attach_body(block)?
        };
        if let Some(reorg) = reorg {
            self.notify_reorg(reorg);
        }
        Ok(())
    }

    fn notify_reorg(&self, reorg: crate::index::BlockReorg) {
        tracing::debug!(
            fork = reorg.fork_height,
            incoming = reorg.incoming.len(),
            outgoing = reorg.outgoing.len(),
            "block chain reorganized"
        );
        self.block_subs.notify(&BlockEvent {
            code: None,
            fork_height: reorg.fork_height,
            incoming: Arc::new(reorg.incoming),
            outgoing: Arc::new(reorg.outgoing),
        });
    }

    /// Publish a transaction-pool arrival to subscribers.
    pub fn announce_transaction(&self, transaction: Transaction) -> Result<(), ChainError> {
        self.check_writable()?;
        let _order = self.dispatch.lock().expect("chain dispatch lock");
        self.tx_subs.notify(&TransactionEvent {
            code: None,
            transaction: Some(Arc::new(transaction)),
        });
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe to header-chain reorganizations. The handler returns
    /// `true` to remain subscribed.
    pub fn subscribe_headers(&self, handler: impl FnMut(&HeaderEvent) -> bool + Send + 'static) {
        self.header_subs.subscribe(Box::new(handler));
    }

    /// Subscribe to block-chain reorganizations.
    pub fn subscribe_blocks(&self, handler: impl FnMut(&BlockEvent) -> bool + Send + 'static) {
        self.block_subs.subscribe(Box::new(handler));
    }

    /// Subscribe to transaction-pool arrivals.
    pub fn subscribe_transactions(
        &self,
        handler: impl FnMut(&TransactionEvent) -> bool + Send + 'static,
    ) {
        self.tx_subs.subscribe(Box::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    #[test]
    fn start_is_exclusive_and_stop_idempotent() {
        let chain = BlockChain::in_memory(NetworkId::Regtest);
        assert!(chain.stopped());
        chain.start().unwrap();
        assert!(!chain.stopped());
        assert_eq!(chain.start(), Err(ChainError::OperationFailed));
        assert!(chain.stop());
        assert!(chain.stop());
        assert!(chain.close());
    }

    #[test]
    fn commits_fail_when_stopped() {
        let chain = BlockChain::in_memory(NetworkId::Regtest);
        let header = child_of(&NetworkId::Regtest.genesis_header(), 1);
        assert_eq!(
            chain.organize_headers(&[header]),
            Err(ChainError::ServiceStopped)
        );
    }

    #[test]
    fn header_subscription_sees_reorg_and_stop() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        chain.start().unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let events_in = Arc::clone(&events);
        let stops_in = Arc::clone(&stops);
        chain.subscribe_headers(move |event| match &event.code {
            None => {
                events_in.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(ChainError::ServiceStopped) => {
                stops_in.fetch_add(1, Ordering::SeqCst);
                false
            }
            Some(_) => false,
        });

        let header = child_of(&NetworkId::Regtest.genesis_header(), 1);
        chain.organize_headers(&[header]).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);

        chain.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribed_handler_is_dropped() {
        let chain = BlockChain::in_memory(NetworkId::Regtest);
        chain.start().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        chain.subscribe_headers(move |_| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            false
        });

        let genesis = NetworkId::Regtest.genesis_header();
        let first = child_of(&genesis, 1);
        let second = child_of(&first, 2);
        chain.organize_headers(&[first]).unwrap();
        chain.organize_headers(&[second]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_storage_confirms_and_notifies() {
        let chain = BlockChain::in_memory(NetworkId::Regtest);
        chain.start().unwrap();

        let confirmed = Arc::new(AtomicUsize::new(0));
        let confirmed_in = Arc::clone(&confirmed);
        chain.subscribe_blocks(move |event| {
            if event.code.is_none() {
                confirmed_in.fetch_add(event.incoming.len(), Ordering::SeqCst);
            }
            true
        });

        let header = child_of(&NetworkId::Regtest.genesis_header(), 1);
        chain.organize_headers(&[header]).unwrap();
        chain.store_block(Block::new(header, Vec::new())).unwrap();

        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
        assert_eq!(chain.get_top(false).unwrap().height, 1);
        assert_eq!(chain.get_top(true).unwrap().height, 1);
        assert!(chain.get_downloadable(1).is_none());
    }

    #[test]
    fn transaction_announcements_reach_subscribers() {
        let chain = BlockChain::in_memory(NetworkId::Regtest);
        chain.start().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        chain.subscribe_transactions(move |event| {
            if event.transaction.is_some() {
                seen_in.fetch_add(1, Ordering::SeqCst);
            }
            true
        });

        chain
            .announce_transaction(Transaction::new(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persisted_chain_reopens_where_it_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        BlockChain::initialize(&db, NetworkId::Regtest).unwrap();

        let header = child_of(&NetworkId::Regtest.genesis_header(), 1);
        {
            let chain = BlockChain::open(&db, NetworkId::Regtest).unwrap();
            chain.start().unwrap();
            chain.organize_headers(&[header]).unwrap();
            chain.store_block(Block::new(header, Vec::new())).unwrap();
            assert!(chain.close());
        }

        let chain = BlockChain::open(&db, NetworkId::Regtest).unwrap();
        assert_eq!(chain.get_top(false).unwrap().height, 1);
        assert_eq!(chain.get_top(true).unwrap().hash, header.hash());
    }

    #[test]
    fn corrupt_snapshot_fails_queries_but_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        std::fs::create_dir_all(&db).unwrap();
        std::fs::write(db.join("chain.dat"), b"garbage").unwrap();

        let chain = BlockChain::open(&db, NetworkId::Regtest).unwrap();
        chain.start().unwrap();
        assert_eq!(chain.get_top(false), Err(ChainError::ChainCorrupt));
        assert_eq!(
            chain.top_valid_candidate_state(),
            Err(ChainError::ChainCorrupt)
        );
    }
}

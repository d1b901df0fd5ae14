//! The full node: composes the chain facade, the network facade, and the
//! reservation queue, owns the lifecycle state machine, and keeps the
//! download queue coherent across reorganizations.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use bitnode_chain::{BlockChain, BlockEvent, ChainError, HeaderEvent, TransactionEvent};
use bitnode_network::{Connection, NetworkError, P2p, SessionFactory};
use bitnode_types::Checkpoint;

use crate::config::Configuration;
use crate::error::NodeError;
use crate::reservations::Reservations;
use crate::sessions::{self, SessionContext};

/// Timeout for joining session tasks during close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The node lifecycle. Transitions are serialized on one mutex; stop and
/// close are idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Unstarted,
    Starting,
    Started,
    Running,
    Stopping,
    Stopped,
    Closed,
}

struct NodeInner {
    config: Configuration,
    chain: Arc<BlockChain>,
    network: P2p,
    reservations: Reservations,
    state: Mutex<LifecycleState>,
    top_block: Mutex<Checkpoint>,
    top_header: Mutex<Checkpoint>,
    shutdown_tx: broadcast::Sender<()>,
    stop_requested: std::sync::atomic::AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A full node on the Bitcoin P2P network.
pub struct FullNode {
    inner: Arc<NodeInner>,
}

impl FullNode {
    /// Open the chain database named by the configuration and compose the
    /// node. The database directory must have been initialized.
    pub fn new(config: Configuration) -> Result<Self, NodeError> {
        let chain = Arc::new(BlockChain::open(
            &config.database.directory,
            config.bitcoin.network,
        )?);
        Ok(Self::with_chain(config, chain))
    }

    /// Compose the node around an existing chain handle.
    pub fn with_chain(config: Configuration, chain: Arc<BlockChain>) -> Self {
        chain.set_block_pool_capacity(config.blockchain.block_pool_capacity);
        let network = P2p::new(config.network.clone(), config.listen_port());
        let reservations = Reservations::new(
            Arc::clone(&chain),
            config.node.minimum_connections,
            config.node.maximum_deviation,
            Duration::from_secs(config.node.block_latency_seconds),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let genesis = Checkpoint::new(config.bitcoin.network.genesis_header().hash(), 0);
        let inner = Arc::new(NodeInner {
            config,
            chain,
            network,
            reservations,
            state: Mutex::new(LifecycleState::Unstarted),
            top_block: Mutex::new(genesis),
            top_header: Mutex::new(genesis),
            shutdown_tx,
            stop_requested: std::sync::atomic::AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
        });
        inner.network.set_session_factory(Arc::new(NodeSessionFactory {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn chain(&self) -> Arc<BlockChain> {
        Arc::clone(&self.inner.chain)
    }

    /// The download reservation queue (clones share one queue).
    pub fn reservations(&self) -> Reservations {
        self.inner.reservations.clone()
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    /// The cached confirmed top, updated on every block reorganization.
    pub fn top_block(&self) -> Checkpoint {
        *self.inner.top_block.lock().expect("top block lock")
    }

    /// The cached candidate top, updated on every header reorganization.
    pub fn top_header(&self) -> Checkpoint {
        *self.inner.top_header.lock().expect("top header lock")
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped()
    }

    // ── Start/Run sequences ─────────────────────────────────────────────

    /// Invoke the startup sequence: the chain starts first, then the
    /// network binds its listener. Fails unless the node is unstarted.
    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = self.inner.state.lock().expect("node state lock");
            if *state != LifecycleState::Unstarted {
                return Err(NodeError::OperationFailed);
            }
            *state = LifecycleState::Starting;
        }

        if let Err(err) = self.inner.chain.start() {
            tracing::error!(error = %err, "Failure starting blockchain.");
            self.inner.set_state(LifecycleState::Unstarted);
            return Err(NodeError::OperationFailed);
        }

        if let Err(err) = self.inner.network.start().await {
            tracing::error!(error = %err, "Failure starting network.");
            self.inner.chain.stop();
            self.inner.set_state(LifecycleState::Unstarted);
            return Err(NodeError::OperationFailed);
        }

        self.inner.set_state(LifecycleState::Started);
        Ok(())
    }

    /// Seed the download queue from the candidate chain, subscribe the
    /// reorganization handlers, and begin long-running sessions. Call
    /// after [`FullNode::start`].
    pub async fn run(&self) -> Result<(), NodeError> {
        {
            let state = self.inner.state.lock().expect("node state lock");
            if *state != LifecycleState::Started {
                return Err(NodeError::ServiceStopped);
            }
        }

        let confirmed = match self.inner.chain.get_top(false) {
            Ok(confirmed) => confirmed,
            Err(err) => {
                tracing::error!(error = %err, "The block chain is corrupt.");
                return Err(NodeError::OperationFailed);
            }
        };
        *self.inner.top_block.lock().expect("top block lock") = confirmed;
        tracing::info!("Top confirmed block height is ({}).", confirmed.height);

        let candidate = match self.inner.chain.get_top(true) {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::error!(error = %err, "The candidate chain is corrupt.");
                return Err(NodeError::OperationFailed);
            }
        };
        *self.inner.top_header.lock().expect("top header lock") = candidate;
        tracing::info!("Top candidate block height is ({}).", candidate.height);

        let top_valid = match self.inner.chain.top_valid_candidate_state() {
            Ok(top_valid) => top_valid.height,
            Err(err) => {
                tracing::error!(error = %err, "The candidate chain is corrupt.");
                return Err(NodeError::OperationFailed);
            }
        };
        let start_height = top_valid + 1;
        tracing::info!("Top valid candidate block height ({}).", top_valid);

        // Scan the header index from the top down until just after the last
        // valid block. The start height is pushed even when its body is
        // already present; this prevents a stall when the next candidate
        // after the last valid one is non-empty. Genesis terminates the
        // loop, and its existence is guaranteed above.
        for height in (start_height..=candidate.height).rev() {
            let downloadable = self.inner.chain.get_downloadable(height).or_else(|| {
                if height == start_height {
                    self.inner.chain.candidate_hash(height)
                } else {
                    None
                }
            });
            if let Some(hash) = downloadable {
                self.inner.reservations.push_front(hash, height);
            }
        }
        tracing::info!(
            "Pending block downloads ({}).",
            self.inner.reservations.size()
        );

        let handler = Arc::clone(&self.inner);
        self.inner
            .chain
            .subscribe_headers(move |event| handler.handle_reindexed(event));

        let handler = Arc::clone(&self.inner);
        self.inner
            .chain
            .subscribe_blocks(move |event| handler.handle_reorganized(event));

        match self.inner.network.run().await {
            Ok(()) => {
                self.inner.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(NetworkError::ServiceStopped) => Err(NodeError::ServiceStopped),
            Err(err) => Err(NodeError::Network(err)),
        }
    }

    /// Manual connector: dial `addr` and attach a manual session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NodeError> {
        self.inner.network.connect(addr).await.map_err(NodeError::from)
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe to header reorganization and stop events.
    pub fn subscribe_headers(&self, handler: impl FnMut(&HeaderEvent) -> bool + Send + 'static) {
        self.inner.chain.subscribe_headers(handler);
    }

    /// Subscribe to block reorganization and stop events.
    pub fn subscribe_blocks(&self, handler: impl FnMut(&BlockEvent) -> bool + Send + 'static) {
        self.inner.chain.subscribe_blocks(handler);
    }

    /// Subscribe to transaction pool acceptance and stop events.
    pub fn subscribe_transactions(
        &self,
        handler: impl FnMut(&TransactionEvent) -> bool + Send + 'static,
    ) {
        self.inner.chain.subscribe_transactions(handler);
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Idempotent call to signal work stop: the network stops first, then
    /// the chain, each logged independently. Returns the conjunction.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.inner.state.lock().expect("node state lock");
            match *state {
                LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Closed => {
                    return true;
                }
                _ => *state = LifecycleState::Stopping,
            }
        }
        self.inner.request_stop();

        let network_stop = self.inner.network.stop();
        if !network_stop {
            tracing::error!("Failed to stop network.");
        }

        let chain_stop = self.inner.chain.stop();
        if !chain_stop {
            tracing::error!("Failed to stop blockchain.");
        }

        self.inner.set_state(LifecycleState::Stopped);
        network_stop && chain_stop
    }

    /// Blocking call to coalesce all work: stop if needed, join session
    /// tasks, then close both subsystems. Safe without a prior start.
    pub async fn close(&self) -> bool {
        if !self.stop() {
            return false;
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .task_handles
            .lock()
            .expect("task handle lock")
            .drain(..)
            .collect();
        let wait_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all).await.is_err() {
            tracing::warn!("session shutdown timeout, some sessions may still be running");
        }

        let network_close = self.inner.network.close().await;
        if !network_close {
            tracing::error!("Failed to close network.");
        }

        let chain_close = self.inner.chain.close();
        if !chain_close {
            tracing::error!("Failed to close blockchain.");
        }

        self.inner.set_state(LifecycleState::Closed);
        network_close && chain_close
    }
}

impl NodeInner {
    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().expect("node state lock") = next;
    }

    fn stopped(&self) -> bool {
        if self.stop_requested.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        matches!(
            *self.state.lock().expect("node state lock"),
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Closed
        )
    }

    /// Request an asynchronous stop. Handlers use this instead of calling
    /// `stop` directly; the executor's monitor observes the flag and runs
    /// the shutdown sequence.
    fn request_stop(&self) {
        self.stop_requested
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Header-chain reorganization handler. A typical reorganization has
    /// one incoming and zero outgoing headers.
    fn handle_reindexed(&self, event: &HeaderEvent) -> bool {
        if self.stopped() || event.code == Some(ChainError::ServiceStopped) {
            return false;
        }

        if let Some(code) = &event.code {
            tracing::error!("Failure handling reindex: {code}");
            self.request_stop();
            return false;
        }

        if event.incoming.is_empty() {
            return true;
        }

        // First pop height is the highest outgoing.
        let mut height = event.fork_height + event.outgoing.len() as u64;

        // Pop outgoing reservations from the download queue (if at the
        // tail), high first.
        for header in event.outgoing.iter().rev() {
            self.reservations.pop_back(header.hash(), height);
            height -= 1;
        }

        // Push unpopulated incoming reservations, low first.
        for header in event.incoming.iter() {
            height += 1;
            self.reservations.push_back(header.hash(), height);
        }

        let top = Checkpoint::new(
            event.incoming.last().expect("non-empty incoming").hash(),
            event.fork_height + event.incoming.len() as u64,
        );
        *self.top_header.lock().expect("top header lock") = top;
        true
    }

    /// Block-chain reorganization handler. The download queue is a
    /// function of the header index, so only the confirmed cursor moves.
    fn handle_reorganized(&self, event: &BlockEvent) -> bool {
        if self.stopped() || event.code == Some(ChainError::ServiceStopped) {
            return false;
        }

        if let Some(code) = &event.code {
            tracing::error!("Failure handling reorganization: {code}");
            self.request_stop();
            return false;
        }

        if event.incoming.is_empty() {
            return true;
        }

        for block in event.outgoing.iter() {
            tracing::debug!(
                hash = %block.hash(),
                "Reorganization moved block to pool"
            );
        }

        let top = Checkpoint::new(
            event.incoming.last().expect("non-empty incoming").hash(),
            event.fork_height + event.incoming.len() as u64,
        );
        *self.top_block.lock().expect("top block lock") = top;
        true
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            chain: Arc::clone(&self.chain),
            reservations: self.reservations.clone(),
            peer_manager: self.network.peer_manager(),
            settings: self.network.settings().clone(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    fn spawn_session(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.task_handles
            .lock()
            .expect("task handle lock")
            .push(handle);
    }
}

/// Attaches protocol drivers to connections the network facade produces.
/// Holds the node weakly so a dropped node detaches cleanly.
struct NodeSessionFactory {
    inner: Weak<NodeInner>,
}

impl SessionFactory for NodeSessionFactory {
    fn attach_manual_session(&self, connection: Connection) {
        if let Some(inner) = self.inner.upgrade() {
            let ctx = inner.session_context();
            inner.spawn_session(sessions::manual::run(ctx, connection));
        }
    }

    fn attach_inbound_session(&self, connection: Connection) {
        if let Some(inner) = self.inner.upgrade() {
            let ctx = inner.session_context();
            inner.spawn_session(sessions::inbound::run(ctx, connection));
        }
    }

    fn attach_outbound_session(&self, connection: Connection) {
        if let Some(inner) = self.inner.upgrade() {
            let ctx = inner.session_context();
            inner.spawn_session(sessions::outbound::run(ctx, connection));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_types::{BlockHash, BlockHeader, NetworkId};

    fn test_config() -> Configuration {
        let mut config = Configuration::default();
        config.bitcoin.network = NetworkId::Regtest;
        config.network.bind_port = free_port();
        config
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn in_memory_node() -> FullNode {
        FullNode::with_chain(
            test_config(),
            Arc::new(BlockChain::in_memory(NetworkId::Regtest)),
        )
    }

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

    #[tokio::test]
    async fn run_before_start_is_service_stopped() {
        let node = in_memory_node();
        assert!(matches!(node.run().await, Err(NodeError::ServiceStopped)));
    }

    #[tokio::test]
    async fn double_start_fails() {
        let node = in_memory_node();
        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(NodeError::OperationFailed)
        ));
        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn close_without_start_succeeds() {
        let node = in_memory_node();
        assert!(node.close().await);
    }

    #[tokio::test]
    async fn cold_start_seeds_nothing() {
        let node = in_memory_node();
        node.start().await.unwrap();
        node.run().await.unwrap();

        assert_eq!(node.top_block().height, 0);
        assert_eq!(node.top_header().height, 0);
        assert_eq!(node.reservations().size(), 0);
        assert!(!node.stopped());

        assert!(node.stop());
        assert!(node.stopped());
        assert!(node.close().await);
    }

    #[tokio::test]
    async fn run_seeds_pending_downloads_from_the_candidate_index() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        chain.start().unwrap();
        let genesis = NetworkId::Regtest.genesis_header();
        let h1 = child_of(&genesis, 1);
        let h2 = child_of(&h1, 2);
        let h3 = child_of(&h2, 3);
        chain.organize_headers(&[h1, h2, h3]).unwrap();
        // The chain was already started by this test; hand it to the node
        // unstarted-equivalent by stopping first.
        chain.stop();

        let node = FullNode::with_chain(test_config(), chain);
        node.start().await.unwrap();
        node.run().await.unwrap();

        // top_valid = 0, candidate = 3: heights 1..=3 pending, lowest first.
        assert_eq!(node.reservations().size(), 3);
        let first = node.reservations().get().unwrap();
        assert_eq!(first.height(), 1);
        assert_eq!(first.hash(), h1.hash());

        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn reindex_updates_queue_and_cached_top() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        let node = FullNode::with_chain(test_config(), Arc::clone(&chain));
        node.start().await.unwrap();
        node.run().await.unwrap();

        let genesis = NetworkId::Regtest.genesis_header();
        let h1 = child_of(&genesis, 1);
        chain.organize_headers(&[h1]).unwrap();

        assert_eq!(node.reservations().size(), 1);
        assert_eq!(
            node.reservations().back(),
            Some((h1.hash(), 1))
        );
        assert_eq!(node.top_header(), Checkpoint::new(h1.hash(), 1));
        // The confirmed cursor is untouched by a header reindex.
        assert_eq!(node.top_block().height, 0);

        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn block_reorg_updates_the_confirmed_cursor_only() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        let node = FullNode::with_chain(test_config(), Arc::clone(&chain));
        node.start().await.unwrap();
        node.run().await.unwrap();

        let genesis = NetworkId::Regtest.genesis_header();
        let h1 = child_of(&genesis, 1);
        chain.organize_headers(&[h1]).unwrap();
        chain
            .store_block(bitnode_types::Block::new(h1, Vec::new()))
            .unwrap();

        assert_eq!(node.top_block(), Checkpoint::new(h1.hash(), 1));
        assert_eq!(node.top_header(), Checkpoint::new(h1.hash(), 1));

        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn two_block_reorg_replaces_the_queue_tail() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        let node = FullNode::with_chain(test_config(), Arc::clone(&chain));
        node.start().await.unwrap();
        node.run().await.unwrap();

        let genesis = NetworkId::Regtest.genesis_header();
        let h1 = child_of(&genesis, 1);
        let h2 = child_of(&h1, 2);
        chain.organize_headers(&[h1, h2]).unwrap();
        assert_eq!(node.reservations().size(), 2);

        let r1 = child_of(&genesis, 50);
        let r2 = child_of(&r1, 51);
        let r3 = child_of(&r2, 52);
        chain.organize_headers(&[r1, r2, r3]).unwrap();

        // Old tail entries were popped, the rival branch was pushed low
        // first, and the tail reflects the newest candidate.
        assert_eq!(node.reservations().size(), 3);
        assert_eq!(node.reservations().back(), Some((r3.hash(), 3)));
        assert_eq!(node.top_header(), Checkpoint::new(r3.hash(), 3));

        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn corrupt_chain_fails_run_without_subscribing() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        std::fs::create_dir_all(&db).unwrap();
        std::fs::write(db.join("chain.dat"), b"garbage").unwrap();

        let mut config = test_config();
        config.database.directory = db;
        let node = FullNode::new(config).unwrap();
        node.start().await.unwrap();
        assert!(matches!(node.run().await, Err(NodeError::OperationFailed)));

        node.stop();
        node.close().await;
    }

    #[tokio::test]
    async fn handler_unsubscribes_after_stop() {
        let chain = Arc::new(BlockChain::in_memory(NetworkId::Regtest));
        let node = FullNode::with_chain(test_config(), Arc::clone(&chain));
        node.start().await.unwrap();
        node.run().await.unwrap();

        node.stop();
        // The chain is stopped with the node; a fresh chain start must not
        // resurrect the node's subscriptions.
        chain.start().unwrap();
        let genesis = NetworkId::Regtest.genesis_header();
        let h1 = child_of(&genesis, 1);
        chain.organize_headers(&[h1]).unwrap();
        assert_eq!(node.reservations().size(), 0);
        assert_eq!(node.top_header().height, 0);

        node.close().await;
    }
}

//! The P2P facade: acceptor, dialer, manual connector, and lifecycle.
//!
//! `start` binds the listener on the calling thread; `run` spawns the
//! acceptor and dialer workers and returns immediately. Protocol drivers
//! are attached per connection through the [`SessionFactory`] hooks; the
//! facade never interprets messages itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::NetworkError;
use crate::peer_manager::PeerManager;
use crate::settings::NetworkSettings;

/// Timeout for joining worker tasks during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the dialer tops up outbound connections.
const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Extension points for attaching protocol drivers to new connections.
///
/// Implementations spawn the session task and return; the facade does not
/// wait on sessions.
pub trait SessionFactory: Send + Sync {
    fn attach_manual_session(&self, connection: Connection);
    fn attach_inbound_session(&self, connection: Connection);
    fn attach_outbound_session(&self, connection: Connection);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unstarted,
    Started,
    Running,
    Stopped,
}

/// Handle to the P2P stack.
pub struct P2p {
    settings: NetworkSettings,
    port: u16,
    peer_manager: Arc<Mutex<PeerManager>>,
    factory: Mutex<Option<Arc<dyn SessionFactory>>>,
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: broadcast::Sender<()>,
    state: Mutex<Lifecycle>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl P2p {
    /// Create the facade. `port` is the resolved listen port.
    pub fn new(settings: NetworkSettings, port: u16) -> Self {
        let mut peer_manager = PeerManager::new(settings.host_pool_capacity);
        for peer in &settings.peers {
            peer_manager.add_host(*peer);
        }
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            port,
            peer_manager: Arc::new(Mutex::new(peer_manager)),
            factory: Mutex::new(None),
            listener: Mutex::new(None),
            shutdown_tx,
            state: Mutex::new(Lifecycle::Unstarted),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register the session factory. Must precede [`P2p::run`].
    pub fn set_session_factory(&self, factory: Arc<dyn SessionFactory>) {
        *self.factory.lock().expect("factory lock") = Some(factory);
    }

    pub fn peer_manager(&self) -> Arc<Mutex<PeerManager>> {
        Arc::clone(&self.peer_manager)
    }

    /// A receiver that is notified when the stack stops.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn stopped(&self) -> bool {
        *self.state.lock().expect("p2p state lock") == Lifecycle::Stopped
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Bind the listener. Completes on the calling task; no worker runs
    /// until [`P2p::run`].
    pub async fn start(&self) -> Result<(), NetworkError> {
        {
            let state = self.state.lock().expect("p2p state lock");
            if *state != Lifecycle::Unstarted {
                return Err(NetworkError::OperationFailed);
            }
        }
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|err| NetworkError::ConnectionFailed(err.to_string()))?;
        tracing::info!(port = self.port, "network listening");
        *self.listener.lock().expect("listener lock") = Some(listener);
        *self.state.lock().expect("p2p state lock") = Lifecycle::Started;
        Ok(())
    }

    /// Spawn the acceptor and dialer workers and return immediately.
    pub async fn run(&self) -> Result<(), NetworkError> {
        {
            let mut state = self.state.lock().expect("p2p state lock");
            if *state != Lifecycle::Started {
                return Err(NetworkError::ServiceStopped);
            }
            *state = Lifecycle::Running;
        }
        let factory = self
            .factory
            .lock()
            .expect("factory lock")
            .clone()
            .ok_or(NetworkError::OperationFailed)?;
        let listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or(NetworkError::OperationFailed)?;

        let mut handles = self.task_handles.lock().expect("task handle lock");
        handles.push(self.spawn_acceptor(listener, Arc::clone(&factory)));
        handles.push(self.spawn_dialer(factory));
        Ok(())
    }

    fn spawn_acceptor(
        &self,
        listener: TcpListener,
        factory: Arc<dyn SessionFactory>,
    ) -> JoinHandle<()> {
        let peer_manager = Arc::clone(&self.peer_manager);
        let inbound_limit = self.settings.inbound_connections as usize;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("acceptor shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                                continue;
                            }
                        };
                        let at_capacity = {
                            let pm = peer_manager.lock().expect("peer manager lock");
                            pm.connected_count() >= inbound_limit
                        };
                        if at_capacity {
                            tracing::debug!(peer = %addr, "inbound capacity reached, dropping");
                            continue;
                        }
                        match Connection::new(stream) {
                            Ok(connection) => {
                                peer_manager
                                    .lock()
                                    .expect("peer manager lock")
                                    .mark_connected(addr);
                                tracing::debug!(peer = %addr, "inbound connection accepted");
                                factory.attach_inbound_session(connection);
                            }
                            Err(err) => {
                                tracing::warn!(peer = %addr, error = %err, "inbound setup failed");
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_dialer(&self, factory: Arc<dyn SessionFactory>) -> JoinHandle<()> {
        let peer_manager = Arc::clone(&self.peer_manager);
        let outbound_target = self.settings.outbound_connections as usize;
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DIAL_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("dialer shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let candidates = {
                            let mut pm = peer_manager.lock().expect("peer manager lock");
                            let deficit =
                                outbound_target.saturating_sub(pm.connected_count());
                            pm.select_outbound(deficit)
                        };
                        for addr in candidates {
                            let factory = Arc::clone(&factory);
                            let peer_manager = Arc::clone(&peer_manager);
                            tokio::spawn(async move {
                                match dial(addr, connect_timeout).await {
                                    Ok(connection) => {
                                        peer_manager
                                            .lock()
                                            .expect("peer manager lock")
                                            .mark_connected(addr);
                                        tracing::debug!(peer = %addr, "outbound connection established");
                                        factory.attach_outbound_session(connection);
                                    }
                                    Err(err) => {
                                        tracing::debug!(peer = %addr, error = %err, "dial failed");
                                    }
                                }
                            });
                        }
                    }
                }
            }
        })
    }

    /// Manual connector: dial `addr` and attach a manual session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        let factory = self
            .factory
            .lock()
            .expect("factory lock")
            .clone()
            .ok_or(NetworkError::OperationFailed)?;
        let connection =
            dial(addr, Duration::from_secs(self.settings.connect_timeout_secs)).await?;
        self.peer_manager
            .lock()
            .expect("peer manager lock")
            .mark_connected(addr);
        factory.attach_manual_session(connection);
        Ok(())
    }

    /// Signal the workers to stop. Idempotent.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().expect("p2p state lock");
            if *state == Lifecycle::Stopped {
                return true;
            }
            *state = Lifecycle::Stopped;
        }
        let _ = self.shutdown_tx.send(());
        true
    }

    /// Stop if needed and join the workers with a bounded timeout.
    pub async fn close(&self) -> bool {
        self.stop();
        let handles: Vec<JoinHandle<()>> = self
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
        if tokio::time::timeout(CLOSE_TIMEOUT, wait_all).await.is_err() {
            tracing::warn!("network close timeout, workers may still be running");
            return false;
        }
        true
    }
}

async fn dial(addr: SocketAddr, timeout: Duration) -> Result<Connection, NetworkError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|err| NetworkError::ConnectionFailed(err.to_string()))?;
    Connection::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        inbound: AtomicUsize,
        manual: AtomicUsize,
    }

    impl SessionFactory for CountingFactory {
        fn attach_manual_session(&self, _connection: Connection) {
            self.manual.fetch_add(1, Ordering::SeqCst);
        }
        fn attach_inbound_session(&self, _connection: Connection) {
            self.inbound.fetch_add(1, Ordering::SeqCst);
        }
        fn attach_outbound_session(&self, _connection: Connection) {}
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn run_before_start_is_service_stopped() {
        let p2p = P2p::new(NetworkSettings::default(), free_port());
        assert!(matches!(
            p2p.run().await,
            Err(NetworkError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn start_run_accept_stop_close() {
        let port = free_port();
        let p2p = P2p::new(NetworkSettings::default(), port);
        let factory = Arc::new(CountingFactory {
            inbound: AtomicUsize::new(0),
            manual: AtomicUsize::new(0),
        });
        p2p.set_session_factory(Arc::clone(&factory) as Arc<dyn SessionFactory>);

        p2p.start().await.unwrap();
        assert!(matches!(
            p2p.start().await,
            Err(NetworkError::OperationFailed)
        ));
        p2p.run().await.unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);
        assert_eq!(factory.inbound.load(Ordering::SeqCst), 1);

        assert!(p2p.stop());
        assert!(p2p.stop());
        assert!(p2p.close().await);
    }

    #[tokio::test]
    async fn manual_connect_attaches_a_manual_session() {
        let port = free_port();
        let p2p = P2p::new(NetworkSettings::default(), port);
        let factory = Arc::new(CountingFactory {
            inbound: AtomicUsize::new(0),
            manual: AtomicUsize::new(0),
        });
        p2p.set_session_factory(Arc::clone(&factory) as Arc<dyn SessionFactory>);
        p2p.start().await.unwrap();
        p2p.run().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        p2p.connect(target).await.unwrap();
        assert_eq!(factory.manual.load(Ordering::SeqCst), 1);

        p2p.stop();
        p2p.close().await;
    }
}

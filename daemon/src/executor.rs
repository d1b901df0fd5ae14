//! Process-level driver: builds a [`FullNode`], waits for stop, and
//! sequences shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitnode_chain::BlockChain;
use bitnode_node::{Configuration, FullNode};

/// Polling granularity of the stop monitor.
const STOP_SENSITIVITY: Duration = Duration::from_millis(10);

/// Owns the process-wide stopped flag and the run/shutdown sequence.
pub struct Executor {
    config: Configuration,
    stopped: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create the database directory and write the selected network's
    /// genesis. Fails if the directory is already initialized.
    pub fn do_initchain(&self) -> bool {
        let directory = &self.config.database.directory;
        let network = self.config.bitcoin.network;
        tracing::info!(
            directory = %directory.display(),
            network = network.as_str(),
            "Initializing the chain database."
        );
        match BlockChain::initialize(directory, network) {
            Ok(()) => {
                tracing::info!("Chain database initialized.");
                true
            }
            Err(err) => {
                tracing::error!(
                    directory = %directory.display(),
                    error = %err,
                    "Failed to initialize the chain database."
                );
                false
            }
        }
    }

    /// Print the effective configuration to standard output.
    pub fn do_settings(&self) {
        println!("{}", self.config.to_toml_string());
    }

    /// Run sequence: verify the database directory, build the node, start
    /// and run it, then block until stopped. Returns whether the process
    /// should exit cleanly.
    pub async fn run(&self) -> bool {
        tracing::info!("Node starting.");

        if !self.verify() {
            return false;
        }

        let node = match FullNode::new(self.config.clone()) {
            Ok(node) => node,
            Err(err) => {
                tracing::error!(error = %err, "Failed to open the node.");
                return false;
            }
        };

        self.install_interrupt();

        if let Err(err) = node.start().await {
            tracing::error!(error = %err, "Node failed to start.");
            return false;
        }
        tracing::info!("Node started.");

        if let Err(err) = node.run().await {
            tracing::error!(error = %err, "Node failed to run.");
            node.stop();
            node.close().await;
            return false;
        }
        tracing::info!("Node seeded, synchronizing.");

        self.wait_on_stop(&node).await
    }

    /// Install the termination signal watchers. The handlers only set the
    /// shared stopped flag; the monitor loop performs the shutdown.
    fn install_interrupt(&self) {
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate => {}
            }
            stopped.store(true, Ordering::SeqCst);
        });
    }

    /// Block until the stopped flag is raised or the node stops itself,
    /// then sequence the shutdown.
    async fn wait_on_stop(&self, node: &FullNode) -> bool {
        while !self.stopped.load(Ordering::SeqCst) && !node.stopped() {
            tokio::time::sleep(STOP_SENSITIVITY).await;
        }

        tracing::info!("Please wait while unmapping the database.");
        let stop = node.stop();
        let close = node.close().await;

        if !(stop && close) {
            tracing::error!("Failed to stop the node.");
            return false;
        }
        tracing::info!("Node stopped.");
        true
    }

    /// Use a missing database as a sentinel indicating lack of
    /// initialization.
    fn verify(&self) -> bool {
        let directory = &self.config.database.directory;
        if BlockChain::is_initialized(directory) {
            return true;
        }
        tracing::error!(
            directory = %directory.display(),
            "The chain database is not initialized, run with --initchain first."
        );
        false
    }

    #[cfg(test)]
    pub(crate) fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }
}

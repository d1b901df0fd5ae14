//! Snapshot persistence for the chain index.
//!
//! The node class requires only that a database directory exists and that
//! its genesis matches the selected network; the snapshot is a single
//! bincode record rewritten on shutdown.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use bitnode_types::{Block, BlockHeader, NetworkId};

use crate::error::ChainError;

const SNAPSHOT_FILE: &str = "chain.dat";

#[derive(Serialize, Deserialize)]
struct Snapshot {
    network: NetworkId,
    entries: Vec<(BlockHeader, Option<Block>)>,
}

/// What [`ChainStore::load`] found on disk.
pub enum Loaded {
    /// A decodable snapshot for the requested network.
    Snapshot(Vec<(BlockHeader, Option<Block>)>),
    /// The snapshot file exists but cannot be decoded, or its genesis does
    /// not match the requested network.
    Corrupt,
}

/// File-backed snapshot store rooted at the database directory.
pub struct ChainStore {
    directory: PathBuf,
}

impl ChainStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn snapshot_path(&self) -> PathBuf {
        self.directory.join(SNAPSHOT_FILE)
    }

    /// Whether the directory holds an initialized chain.
    pub fn exists(&self) -> bool {
        self.snapshot_path().is_file()
    }

    /// Create the database directory and write the genesis record for
    /// `network`. Fails if a chain is already initialized there.
    pub fn initialize(&self, network: NetworkId) -> Result<(), ChainError> {
        if self.exists() {
            return Err(ChainError::Store(format!(
                "chain already initialized at {}",
                self.directory.display()
            )));
        }
        fs::create_dir_all(&self.directory)?;
        let genesis = network.genesis_block();
        self.save(network, vec![(genesis.header, Some(genesis))])
    }

    /// Load the snapshot. A missing file is an error (the directory has not
    /// been initialized); an undecodable file or a genesis mismatch is
    /// reported as [`Loaded::Corrupt`] so the caller can surface it through
    /// the query interface rather than at open time.
    pub fn load(&self, network: NetworkId) -> Result<Loaded, ChainError> {
        let path = self.snapshot_path();
        if !path.is_file() {
            return Err(ChainError::Store(format!(
                "no chain database at {}",
                self.directory.display()
            )));
        }
        let bytes = fs::read(&path)?;
        let snapshot: Snapshot = match bincode::deserialize(&bytes) {
            Ok(snapshot) => snapshot,
            Err(_) => return Ok(Loaded::Corrupt),
        };
        let genesis_matches = snapshot
            .entries
            .first()
            .map(|(header, _)| header.hash() == network.genesis_header().hash())
            .unwrap_or(false);
        if snapshot.network != network || !genesis_matches {
            return Ok(Loaded::Corrupt);
        }
        Ok(Loaded::Snapshot(snapshot.entries))
    }

    /// Rewrite the snapshot.
    pub fn save(
        &self,
        network: NetworkId,
        entries: Vec<(BlockHeader, Option<Block>)>,
    ) -> Result<(), ChainError> {
        let snapshot = Snapshot { network, entries };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|err| ChainError::Store(err.to_string()))?;
        fs::write(self.snapshot_path(), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_writes_genesis_and_rejects_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path().join("db"));
        assert!(!store.exists());
        store.initialize(NetworkId::Regtest).unwrap();
        assert!(store.exists());
        assert!(store.initialize(NetworkId::Regtest).is_err());

        match store.load(NetworkId::Regtest).unwrap() {
            Loaded::Snapshot(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(
                    entries[0].0.hash(),
                    NetworkId::Regtest.genesis_header().hash()
                );
            }
            Loaded::Corrupt => panic!("fresh snapshot reported corrupt"),
        }
    }

    #[test]
    fn load_without_initialize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path().join("db"));
        assert!(store.load(NetworkId::Regtest).is_err());
    }

    #[test]
    fn garbage_snapshot_reports_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path());
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"not a snapshot").unwrap();
        assert!(matches!(
            store.load(NetworkId::Regtest).unwrap(),
            Loaded::Corrupt
        ));
    }

    #[test]
    fn wrong_network_reports_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path().join("db"));
        store.initialize(NetworkId::Testnet).unwrap();
        assert!(matches!(
            store.load(NetworkId::Mainnet).unwrap(),
            Loaded::Corrupt
        ));
    }
}

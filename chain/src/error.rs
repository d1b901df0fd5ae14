use bitnode_types::BlockHash;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("the chain service is stopped")]
    ServiceStopped,

    #[error("operation failed")]
    OperationFailed,

    #[error("the block chain is corrupt")]
    ChainCorrupt,

    #[error("header {0} does not connect to the candidate index")]
    Orphan(BlockHash),

    #[error("block {0} has no candidate header")]
    UnknownBlock(BlockHash),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

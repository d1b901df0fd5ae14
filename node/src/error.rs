use thiserror::Error;

use bitnode_chain::ChainError;
use bitnode_network::NetworkError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("operation failed")]
    OperationFailed,

    #[error("the node service is stopped")]
    ServiceStopped,

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

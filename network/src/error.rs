use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation failed")]
    OperationFailed,

    #[error("the network service is stopped")]
    ServiceStopped,

    #[error("peer timed out")]
    Timeout,

    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

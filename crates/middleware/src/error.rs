use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no reachable broker: {0}")]
    Unreachable(String),
    #[error("transport misconfigured: {0}")]
    Config(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
    #[error("ack failed: {0}")]
    AckFailed(String),
}

impl TransportError {
    /// Only a missing broker is worth retrying; everything else points at
    /// configuration and will fail the same way next time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store misconfigured: {0}")]
    Config(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

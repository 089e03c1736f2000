use thiserror::Error;

use devstream_middleware::{StoreError, TransportError};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("broker connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error("receive failed: {0}")]
    Receive(#[source] TransportError),

    #[error("commit failed: {0}")]
    Commit(#[source] TransportError),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("store connection failed: {0}")]
    Connect(#[source] StoreError),

    #[error("store unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },
}

/// Faults that end a pipeline run in the `Crashed` state
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

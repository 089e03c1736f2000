//! devstream-ingest: broker → document store ingestion
//!
//! `MessageSource` and `StoreSink` own connection lifecycles with bounded
//! retry; `Pipeline` drives one consume loop; `Supervisor` restarts it after
//! a crash.

pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod supervisor;

pub use error::{PipelineError, SinkError, SourceError};
pub use pipeline::{
    Pipeline, PipelineContext, PipelineExit, PipelineSettings, PipelineState, RecordListener,
};
pub use retry::RetryPolicy;
pub use supervisor::Supervisor;

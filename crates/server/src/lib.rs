//! devstream-server: HTTP query API, live WebSocket feed, and process wiring
//! for the telemetry ingestion pipeline.

pub mod api;
pub mod auth;
pub mod config;
pub mod local;
pub mod metrics;
pub mod notifier;
pub mod query;
pub mod registry;
pub mod shutdown;

use std::sync::Arc;

use tokio::sync::watch;

use devstream_ingest::PipelineState;

pub use auth::{Authorizer, Identity, JwtAuthorizer};
pub use config::Config;
pub use query::QueryService;
pub use registry::{ConnectionRegistry, SessionId};

/// Shared application state
pub struct AppState {
    pub queries: QueryService,
    pub registry: Arc<ConnectionRegistry>,
    pub authorizer: Arc<dyn Authorizer>,
    pub pipeline_status: watch::Receiver<PipelineState>,
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use devstream_ingest::RecordListener;
use devstream_middleware::PersistedRecord;

use crate::query::render;
use crate::registry::ConnectionRegistry;

/// Pushes every persisted record to all live sessions
pub struct BroadcastNotifier {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastNotifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

/// Frame sent to subscribers for a single new record
pub fn update_frame(record: &PersistedRecord) -> String {
    json!({ "type": "device_data", "data": render(record.clone()) }).to_string()
}

/// Frame sent once on admission with the current latest records
pub fn snapshot_frame(documents: Vec<serde_json::Value>) -> String {
    json!({ "type": "snapshot", "data": documents }).to_string()
}

#[async_trait]
impl RecordListener for BroadcastNotifier {
    async fn on_persisted(&self, record: &PersistedRecord) {
        let delivered = self.registry.broadcast(&update_frame(record)).await;
        debug!(id = %record.id.to_external(), delivered, "Broadcast persisted record");
    }
}

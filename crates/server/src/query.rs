//! Read path over the document store.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

use devstream_middleware::{DocumentStore, PersistedRecord, StoreError};

/// Default page size for both queries
pub const DEFAULT_LIMIT: usize = 15;

#[derive(Error, Debug)]
pub enum QueryError {
    /// The store could not answer; the caller should retry
    #[error("document store unavailable: {0}")]
    Unavailable(#[source] StoreError),
}

pub struct QueryService {
    store: Arc<dyn DocumentStore>,
    device_field: String,
}

impl QueryService {
    pub fn new(store: Arc<dyn DocumentStore>, device_field: impl Into<String>) -> Self {
        Self {
            store,
            device_field: device_field.into(),
        }
    }

    /// Up to `limit` documents, newest first
    pub async fn latest(&self, limit: usize) -> Result<Vec<Value>, QueryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.store.latest(limit).await.map_err(unavailable)?;
        Ok(records.into_iter().map(render).collect())
    }

    /// Up to `limit` documents whose device identifier is in `device_ids`,
    /// newest first. An empty filter matches nothing.
    pub async fn latest_filtered(
        &self,
        device_ids: &[String],
        limit: usize,
    ) -> Result<Vec<Value>, QueryError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = device_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        if ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let records = self
            .store
            .latest_matching(&self.device_field, &ids, limit)
            .await
            .map_err(unavailable)?;
        Ok(records.into_iter().map(render).collect())
    }

    pub fn device_field(&self) -> &str {
        &self.device_field
    }
}

fn unavailable(e: StoreError) -> QueryError {
    error!(error = %e, "Database error reading device data");
    QueryError::Unavailable(e)
}

/// Render a record for callers: the opaque `_id` first, then the document's
/// own fields in their original order.
pub fn render(record: PersistedRecord) -> Value {
    let mut out = Map::with_capacity(record.document.len() + 1);
    out.insert("_id".to_string(), Value::String(record.id.to_external()));
    for (key, value) in record.document {
        if key != "_id" {
            out.insert(key, value);
        }
    }
    Value::Object(out)
}

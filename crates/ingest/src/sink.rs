//! Persistence Sink Adapter
//!
//! Appends decoded telemetry documents to the document store. Individual
//! insert failures are logged and counted but never propagated: the stream
//! moves on to the next message.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use devstream_middleware::{DocumentStore, PersistedRecord, StoreError};

use crate::error::SinkError;
use crate::metrics::{DOCUMENTS_INSERTED, INSERT_FAILURES};
use crate::retry::{connect_with_retry, RetryFailure, RetryPolicy};

/// Why a document was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The store rejected or could not serve the write
    Store,
    /// Anything else, including payloads that are not JSON objects
    Unexpected,
}

impl FailureClass {
    fn label(self) -> &'static str {
        match self {
            FailureClass::Store => "store",
            FailureClass::Unexpected => "unexpected",
        }
    }
}

#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(PersistedRecord),
    Dropped(FailureClass),
}

pub struct StoreSink {
    store: Arc<dyn DocumentStore>,
    failed_attempts: u32,
}

impl StoreSink {
    /// Connect and verify liveness, retrying while the store is unreachable
    pub async fn connect(
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
    ) -> Result<Self, SinkError> {
        let connected = connect_with_retry("store", retry, StoreError::is_retryable, || {
            let store = store.clone();
            async move {
                store.connect().await?;
                store.ping().await
            }
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Fatal(e) => SinkError::Connect(e),
            RetryFailure::Exhausted { attempts, last } => {
                SinkError::RetriesExhausted { attempts, last }
            }
        })?;

        info!("Successfully connected to document store");
        Ok(Self {
            store,
            failed_attempts: connected.failed_attempts,
        })
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Persist one decoded payload. Exactly one store write per call.
    pub async fn insert(&self, value: Value) -> InsertOutcome {
        let document = match value {
            Value::Object(document) => document,
            other => {
                error!(
                    kind = json_kind(&other),
                    "Unexpected error inserting data: payload is not a JSON object"
                );
                return dropped(FailureClass::Unexpected);
            }
        };

        match self.store.insert(&document).await {
            Ok(id) => {
                DOCUMENTS_INSERTED.inc();
                debug!(id = %id.to_external(), "Inserted document");
                InsertOutcome::Inserted(PersistedRecord { id, document })
            }
            Err(e @ (StoreError::Operation(_) | StoreError::Unavailable(_))) => {
                error!(error = %e, "Store error inserting data");
                dropped(FailureClass::Store)
            }
            Err(e) => {
                error!(error = %e, "Unexpected error inserting data");
                dropped(FailureClass::Unexpected)
            }
        }
    }

    /// Give up this run's handle on the store. The store itself (and any
    /// pool behind it) is shared with the query side and stays open.
    pub fn release(self) {
        debug!("Document store sink released");
    }
}

fn dropped(class: FailureClass) -> InsertOutcome {
    INSERT_FAILURES.with_label_values(&[class.label()]).inc();
    InsertOutcome::Dropped(class)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstream_middleware::memory::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            retry_interval: Duration::from_millis(10),
        }
    }

    async fn sink_over(store: &Arc<InMemoryStore>) -> StoreSink {
        StoreSink::connect(store.clone(), fast_retry()).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_object() {
        let store = Arc::new(InMemoryStore::new());
        let sink = sink_over(&store).await;

        let outcome = sink
            .insert(json!({"Device_ID": 1150, "Battery_Level": 3.52}))
            .await;
        match outcome {
            InsertOutcome::Inserted(record) => assert_eq!(record.document["Device_ID"], 1150),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_non_object_is_dropped_without_store_write() {
        let store = Arc::new(InMemoryStore::new());
        let sink = sink_over(&store).await;

        let outcome = sink.insert(json!([1, 2, 3])).await;
        assert!(matches!(
            outcome,
            InsertOutcome::Dropped(FailureClass::Unexpected)
        ));
        assert_eq!(store.insert_attempts(), 0);
    }

    #[tokio::test]
    async fn test_store_rejection_is_dropped_once() {
        let store = Arc::new(InMemoryStore::new());
        let sink = sink_over(&store).await;
        store.fail_next_inserts(1);

        let outcome = sink.insert(json!({"Device_ID": 1151})).await;
        assert!(matches!(outcome, InsertOutcome::Dropped(FailureClass::Store)));
        assert_eq!(store.insert_attempts(), 1);
        assert!(store.is_empty().await);

        let outcome = sink.insert(json!({"Device_ID": 1152})).await;
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_failed_ping() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_pings(2);

        let sink = sink_over(&store).await;
        assert_eq!(sink.failed_attempts(), 2);
        assert_eq!(store.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_when_store_down() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unavailable(true);

        let result = StoreSink::connect(store.clone(), fast_retry()).await;
        assert!(matches!(
            result,
            Err(SinkError::RetriesExhausted { attempts: 5, .. })
        ));
    }
}

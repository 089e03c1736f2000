use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Schema-less telemetry document. Field order is preserved as received.
pub type Document = serde_json::Map<String, Value>;

/// Store-assigned record identifier, monotonic in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Opaque external rendering. Callers outside the store must only ever
    /// see this form.
    pub fn to_external(&self) -> String {
        format!("{:024x}", self.0)
    }
}

/// A document together with its store-assigned id
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: RecordId,
    pub document: Document,
}

/// Document store abstraction (PostgreSQL, in-memory)
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Establish the transport-level connection
    async fn connect(&self) -> Result<(), StoreError>;

    /// Liveness check: the store must actually serve a request
    async fn ping(&self) -> Result<(), StoreError>;

    /// Append one document. Never an upsert: duplicates produce new records.
    async fn insert(&self, document: &Document) -> Result<RecordId, StoreError>;

    /// Up to `limit` records, newest first
    async fn latest(&self, limit: usize) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Up to `limit` records whose `field` (see [`field_as_key`]) is one of
    /// `values`, newest first
    async fn latest_matching(
        &self,
        field: &str,
        values: &[String],
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, StoreError>;
}

/// Render a scalar field for comparison against caller-supplied identifiers.
///
/// Strings compare verbatim and numbers by their decimal text, which is also
/// what PostgreSQL's `->>` operator yields for JSONB scalars.
pub fn field_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_external_form_is_opaque_hex() {
        let id = RecordId::new(255);
        assert_eq!(id.to_external(), "0000000000000000000000ff");
        assert_eq!(id.to_external().len(), 24);
    }

    #[test]
    fn test_record_ids_order_by_insertion() {
        assert!(RecordId::new(2) > RecordId::new(1));
    }

    #[test]
    fn test_field_as_key() {
        assert_eq!(field_as_key(&json!("dev-1")), Some("dev-1".to_string()));
        assert_eq!(field_as_key(&json!(1150)), Some("1150".to_string()));
        assert_eq!(field_as_key(&json!(null)), None);
        assert_eq!(field_as_key(&json!({"nested": 1})), None);
    }
}

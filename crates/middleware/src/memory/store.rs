use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{field_as_key, Document, DocumentStore, PersistedRecord, RecordId};

/// In-memory document store with fault injection for tests
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<PersistedRecord>>,
    next_id: AtomicI64,
    unreachable_connects: AtomicU32,
    failing_pings: AtomicU32,
    failing_inserts: AtomicU32,
    unavailable: AtomicBool,
    insert_attempts: AtomicU64,
    connect_attempts: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `attempts` connections
    pub fn fail_next_connects(&self, attempts: u32) {
        self.unreachable_connects.store(attempts, Ordering::SeqCst);
    }

    /// Accept the next `attempts` connections but fail their liveness check
    pub fn fail_next_pings(&self, attempts: u32) {
        self.failing_pings.store(attempts, Ordering::SeqCst);
    }

    /// Reject the next `count` inserts with an operational error
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Make every operation fail as if the server were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records in insertion order
    pub async fn records(&self) -> Vec<PersistedRecord> {
        self.records.read().await.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is down".to_string()));
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.unreachable_connects) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.check_available()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if Self::take(&self.failing_pings) {
            return Err(StoreError::Unavailable("ping timed out".to_string()));
        }
        self.check_available()
    }

    async fn insert(&self, document: &Document) -> Result<RecordId, StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if Self::take(&self.failing_inserts) {
            return Err(StoreError::Operation("duplicate key".to_string()));
        }

        let mut records = self.records.write().await;
        let id = RecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        records.push(PersistedRecord {
            id,
            document: document.clone(),
        });
        Ok(id)
    }

    async fn latest(&self, limit: usize) -> Result<Vec<PersistedRecord>, StoreError> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn latest_matching(
        &self,
        field: &str,
        values: &[String],
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        self.check_available()?;
        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| {
                r.document
                    .get(field)
                    .and_then(field_as_key)
                    .is_some_and(|key| wanted.contains(key.as_str()))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(device: i64) -> Document {
        match json!({"Device_ID": device, "Battery_Level": 3.2}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = InMemoryStore::new();
        let a = store.insert(&doc(1150)).await.unwrap();
        let b = store.insert(&doc(1151)).await.unwrap();
        assert!(b > a);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_latest_is_newest_first_and_limited() {
        let store = InMemoryStore::new();
        for device in 1150..1155 {
            store.insert(&doc(device)).await.unwrap();
        }
        let latest = store.latest(3).await.unwrap();
        let devices: Vec<_> = latest.iter().map(|r| r.document["Device_ID"].clone()).collect();
        assert_eq!(devices, vec![json!(1154), json!(1153), json!(1152)]);
    }

    #[tokio::test]
    async fn test_latest_matching_filters_on_rendered_field() {
        let store = InMemoryStore::new();
        store.insert(&doc(1150)).await.unwrap();
        store.insert(&doc(1151)).await.unwrap();
        store.insert(&doc(1150)).await.unwrap();

        let values = vec!["1150".to_string(), "1150".to_string()];
        let hits = store.latest_matching("Device_ID", &values, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.document["Device_ID"] == json!(1150)));
        assert!(hits[0].id > hits[1].id);
    }

    #[tokio::test]
    async fn test_duplicate_documents_are_appended() {
        let store = InMemoryStore::new();
        store.insert(&doc(1150)).await.unwrap();
        store.insert(&doc(1150)).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryStore::new();
        store.fail_next_connects(1);
        assert!(matches!(store.connect().await, Err(StoreError::Unavailable(_))));
        assert!(store.connect().await.is_ok());

        store.fail_next_inserts(1);
        assert!(matches!(
            store.insert(&doc(1)).await,
            Err(StoreError::Operation(_))
        ));
        assert!(store.insert(&doc(1)).await.is_ok());
        assert_eq!(store.insert_attempts(), 2);

        store.set_unavailable(true);
        assert!(matches!(store.latest(5).await, Err(StoreError::Unavailable(_))));
    }
}

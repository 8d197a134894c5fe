//! In-process content store for local runs and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use almoner_core::error::{StoreError, StoreResult};
use almoner_core::ports::{ContentRef, ContentStore, StoredObject};

struct Entry {
    key: String,
    reference: ContentRef,
    bytes: Vec<u8>,
}

/// Content store keeping every object in memory, listed in write order.
///
/// References are `mem-<n>`; writing the same key twice keeps both objects,
/// as an IPFS account would.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Vec<Entry>>,
    next_ref: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ContentRef> {
        let reference = ContentRef(format!(
            "mem-{}",
            self.next_ref.fetch_add(1, Ordering::Relaxed)
        ));
        trace!(key, reference = %reference, size = bytes.len(), "Stored object");
        self.entries.write().await.push(Entry {
            key: key.to_string(),
            reference: reference.clone(),
            bytes,
        });
        Ok(reference)
    }

    async fn list(&self) -> StoreResult<Vec<StoredObject>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|entry| StoredObject {
                key: entry.key.clone(),
                reference: entry.reference.clone(),
            })
            .collect())
    }

    async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.reference == *reference)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use almoner_core::models::{DonationRecord, KeyStrategy};
    use almoner_core::services::{AggregatorConfig, AnnotationAggregator};
    use alloy_primitives::{Address, B256};
    use chrono::DateTime;

    fn message() -> String {
        "A heartfelt thank you to everyone maintaining this project!".to_string()
    }

    async fn publish(store: &MemoryStore, name: &str, millis: i64) {
        let record = DonationRecord::new(
            name,
            &message(),
            Address::repeat_byte(0xd0),
            B256::repeat_byte(millis as u8),
            DateTime::from_timestamp_millis(millis).unwrap(),
            KeyStrategy::NameNonce,
        )
        .unwrap();
        store
            .put(record.content_key.as_str(), record.to_bytes().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_list_get() {
        let store = MemoryStore::new();
        let first = store.put("donation-a-1", b"one".to_vec()).await.unwrap();
        let second = store.put("donation-a-1", b"two".to_vec()).await.unwrap();
        assert_ne!(first, second);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.len().await, 2);
        assert_eq!(listed[0].reference, first);
        assert_eq!(store.get(&second).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_missing_reference() {
        let store = MemoryStore::new();
        let err = store.get(&ContentRef("mem-9".into())).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    // Scenario: 3 valid + 1 malformed record aggregate to 3, newest first
    #[tokio::test]
    async fn test_aggregates_published_records() {
        let store = Arc::new(MemoryStore::new());
        publish(&store, "alice", 1_700_000_000_000).await;
        publish(&store, "bob", 1_700_000_300_000).await;
        store
            .put("donation-broken-1", b"{\"name\":\"x\"".to_vec())
            .await
            .unwrap();
        publish(&store, "carol", 1_700_000_100_000).await;
        store.put("notes.txt", b"unrelated".to_vec()).await.unwrap();

        let records = AnnotationAggregator::new(AggregatorConfig::default(), store)
            .list_published()
            .await
            .unwrap();

        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol", "alice"]);
        assert_eq!(records[2].content_key.as_str(), "donation-alice-1700000000000");
        assert!(records.iter().all(|r| r.tx_hash.is_some()));
    }
}

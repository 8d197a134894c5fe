//! Donor list aggregation.
//!
//! Lists every object in the content store, keeps the donation records,
//! fetches them with bounded concurrency and returns them newest first.
//! A record that cannot be fetched or parsed is dropped from the result
//! without failing the whole listing.

use std::sync::Arc;

use futures::{StreamExt, stream};
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_record_dropped;
use crate::models::{ContentKey, DonationRecord};
use crate::ports::{ContentStore, StoredObject};

/// Aggregator tuning.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Maximum record fetches in flight.
    pub fetch_concurrency: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 8,
        }
    }
}

/// Reads published donation records back from a content store.
pub struct AnnotationAggregator<S: ContentStore> {
    config: AggregatorConfig,
    store: Arc<S>,
}

impl<S: ContentStore> AnnotationAggregator<S> {
    pub fn new(config: AggregatorConfig, store: Arc<S>) -> Self {
        Self { config, store }
    }

    /// Every readable donation record, sorted by timestamp descending.
    ///
    /// Fails only when the store listing itself fails. Records with equal
    /// timestamps keep their listing order.
    #[instrument(skip(self))]
    pub async fn list_published(&self) -> StoreResult<Vec<DonationRecord>> {
        let objects = self.store.list().await.map_err(|e| match e {
            StoreError::Unavailable(_) => e,
            other => StoreError::Unavailable(other.to_string()),
        })?;

        let candidates: Vec<StoredObject> = objects
            .into_iter()
            .filter(|object| ContentKey::is_donation_key(&object.key))
            .collect();
        let listed = candidates.len();

        let mut records: Vec<DonationRecord> = stream::iter(candidates)
            .map(|object| self.fetch(object))
            .buffered(self.config.fetch_concurrency.max(1))
            .filter_map(|record| async move { record })
            .collect()
            .await;

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        info!(
            listed,
            returned = records.len(),
            "📜 Donor list aggregated"
        );
        Ok(records)
    }

    async fn fetch(&self, object: StoredObject) -> Option<DonationRecord> {
        let bytes = match self.store.get(&object.reference).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %object.key, error = %e, "⚠️  Skipping unreadable donation record");
                record_record_dropped("fetch");
                return None;
            }
        };

        match DonationRecord::from_slice(&object.key, &bytes) {
            Ok(record) => {
                debug!(key = %object.key, "Donation record loaded");
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "⚠️  Skipping malformed donation record");
                record_record_dropped("parse");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ContentRef;
    use crate::services::fakes::FakeStore;
    use async_trait::async_trait;

    const MESSAGE: &str = "Thanks for keeping the lights on, see you at the next meetup!";

    fn record_json(name: &str, timestamp: &str) -> Vec<u8> {
        annotation_json(name, MESSAGE, timestamp)
    }

    fn annotation_json(name: &str, message: &str, timestamp: &str) -> Vec<u8> {
        format!(
            r#"{{"name":"{name}","message":"{message}","timestamp":"{timestamp}","donor":"0x00000000000000000000000000000000000000aa"}}"#
        )
        .into_bytes()
    }

    fn aggregator(store: Arc<FakeStore>) -> AnnotationAggregator<FakeStore> {
        AnnotationAggregator::new(AggregatorConfig::default(), store)
    }

    fn names(records: &[DonationRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    // Scenario: three records, one unfetchable, come back newest first
    #[tokio::test]
    async fn test_sorts_newest_first_and_drops_unreadable() {
        let store = Arc::new(FakeStore::default());
        store.insert("donation-a-1", &record_json("a", "2024-01-01T00:00:00Z"));
        store.insert("donation-b-2", &record_json("b", "2024-03-01T00:00:00Z"));
        store.insert("donation-c-3", &record_json("c", "2024-02-01T00:00:00Z"));
        store.break_key("donation-a-1");

        let records = aggregator(store).list_published().await.unwrap();
        assert_eq!(names(&records), vec!["b", "c"]);
        assert_eq!(records[0].content_key.as_str(), "donation-b-2");
    }

    #[tokio::test]
    async fn test_ignores_foreign_objects_and_malformed_records() {
        let store = Arc::new(FakeStore::default());
        store.insert("avatar.png", b"\x89PNG");
        store.insert("donation-bad-1", b"{\"name\":");
        store.insert("donation-ok-2", &record_json("ok", "2024-01-01T00:00:00Z"));

        let records = aggregator(store).list_published().await.unwrap();
        assert_eq!(names(&records), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_drops_records_breaking_annotation_rules() {
        let store = Arc::new(FakeStore::default());
        store.insert("donation--1", &annotation_json("", "hi", "2024-01-03T00:00:00Z"));
        store.insert("donation-bob-2", &annotation_json("bob", "hi", "2024-01-02T00:00:00Z"));
        store.insert("donation-ok-3", &record_json("ok", "2024-01-01T00:00:00Z"));

        let records = aggregator(store).list_published().await.unwrap();
        assert_eq!(names(&records), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_listing_order() {
        let store = Arc::new(FakeStore::default());
        for name in ["x", "y", "z"] {
            store.insert(
                &format!("donation-{name}-1"),
                &record_json(name, "2024-01-01T00:00:00Z"),
            );
        }

        let records = AnnotationAggregator::new(AggregatorConfig { fetch_concurrency: 2 }, store)
            .list_published()
            .await
            .unwrap();
        assert_eq!(names(&records), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_list() {
        let records = aggregator(Arc::new(FakeStore::default()))
            .list_published()
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    struct DownStore;

    #[async_trait]
    impl ContentStore for DownStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> StoreResult<ContentRef> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn list(&self) -> StoreResult<Vec<StoredObject>> {
            Err(StoreError::Serialization("bad listing".into()))
        }

        async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>> {
            Err(StoreError::NotFound(reference.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported_as_unavailable() {
        let err = AnnotationAggregator::new(AggregatorConfig::default(), Arc::new(DownStore))
            .list_published()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}

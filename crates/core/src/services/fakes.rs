//! In-process fakes of the ports, for service tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::ports::{ContentRef, ContentStore, StoredObject};
use crate::services::session::Clock;

/// Clock frozen at a given unix millisecond.
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap()
    }
}

/// Content store keeping objects in insertion order.
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Vec<(String, Vec<u8>)>>,
    /// Keys whose `get` fails.
    broken: Mutex<Vec<String>>,
    pub fail_puts: AtomicBool,
    pub puts: AtomicUsize,
}

impl FakeStore {
    pub fn insert(&self, key: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .push((key.to_string(), bytes.to_vec()));
    }

    pub fn break_key(&self, key: &str) {
        self.broken.lock().unwrap().push(key.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for FakeStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ContentRef> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        // Let a concurrent caller interleave here
        tokio::task::yield_now().await;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("upload failed".into()));
        }
        self.insert(key, &bytes);
        Ok(ContentRef(key.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<StoredObject>> {
        Ok(self
            .keys()
            .into_iter()
            .map(|key| StoredObject {
                reference: ContentRef(key.clone()),
                key,
            })
            .collect())
    }

    async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>> {
        if self.broken.lock().unwrap().contains(&reference.0) {
            return Err(StoreError::Unavailable(format!("gateway error for {reference}")));
        }
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == reference.0)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| StoreError::NotFound(reference.0.clone()))
    }
}

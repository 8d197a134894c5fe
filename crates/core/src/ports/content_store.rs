//! Port trait for the content store holding donation messages.
//!
//! Objects are written under caller-chosen keys and read back through the
//! reference (CID) returned by the store.

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Reference returned by the store for a written object (e.g. an IPFS CID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef(pub String);

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a store listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub reference: ContentRef,
}

/// Port trait for a key-value object store behind a content gateway.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write `bytes` under `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ContentRef>;

    /// List every object owned by this store account, in store order.
    async fn list(&self) -> StoreResult<Vec<StoredObject>>;

    /// Fetch an object's bytes through the gateway.
    async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>>;
}

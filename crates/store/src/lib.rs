//! Content store adapters for Almoner.
//!
//! This crate provides implementations of the [`ContentStore`] port
//! defined in `almoner-core`:
//!
//! - [`LighthouseStore`] - Lighthouse account on IPFS (upload node, account
//!   API for listings, public gateway for reads)
//! - [`MemoryStore`] - In-process store for local runs and tests
//!
//! # Usage
//!
//! ```ignore
//! use almoner_store::{LighthouseConfig, LighthouseStore};
//!
//! let store = Arc::new(LighthouseStore::new(LighthouseConfig::with_api_key(&api_key))?);
//! let reference = store.put("donation-alice-1700000000000", bytes).await?;
//! let objects = store.list().await?;
//! ```
//!
//! [`ContentStore`]: almoner_core::ports::ContentStore

mod lighthouse;
mod memory;

pub use lighthouse::{LighthouseConfig, LighthouseStore};
pub use memory::MemoryStore;

//! Key-value store subsystem.
//!
//! Both the control-plane store (where gateway resources are authored) and
//! the data-plane store (read by the proxy) speak the same revisioned
//! key-value contract.
//!
//! # Data Flow
//! ```text
//! list(prefix)          → snapshot of keys + store revision
//! watch(prefix, rev)    → stream of event batches starting at `rev`
//!     Err(Compacted)        history before `rev` is gone, full resync needed
//!     Err(FutureRevision)   `rev` is ahead of the store, full resync needed
//!     Err(other) / end      transient, resume from last seen revision + 1
//! put / delete          → single key writes
//! ```
//!
//! # Design Decisions
//! - One trait for both stores so every consumer can run against
//!   [`MemoryStore`] in tests and [`EtcdStore`] in production
//! - Watch streams are `'static` boxed streams owned by the consumer
//! - Errors carry enough detail to pick between resume and resync

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// A single stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last modification of this key.
    pub mod_revision: i64,
}

/// Result of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision the listing was served at.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change observed by a watch.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// For deletes the value is empty and `mod_revision` is the delete revision.
    pub kv: KeyValue,
}

/// Events delivered together by one watch response.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    /// Highest event revision in this batch, 0 when it carries no events.
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

pub type WatchStream = BoxStream<'static, StoreResult<WatchBatch>>;

/// Errors returned by store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection or request failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Request did not finish within its deadline.
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// Watch start revision is older than the compaction point.
    #[error("revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted { requested: i64, compact_revision: i64 },

    /// Watch start revision is newer than the store.
    #[error("revision {requested} is a future revision")]
    FutureRevision { requested: i64 },

    /// The server cancelled or closed the watch.
    #[error("watch stream closed: {0}")]
    WatchClosed(String),
}

impl StoreError {
    /// Whether resuming from the last seen revision is impossible and a
    /// full listing must be taken first.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            StoreError::Compacted { .. } | StoreError::FutureRevision { .. }
        )
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Revisioned key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<ListResponse>;

    /// Write `value` at `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Watch every key under `prefix`, starting at `start_revision`
    /// (0 means "from now").
    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<WatchStream>;
}

/// Run a store call with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

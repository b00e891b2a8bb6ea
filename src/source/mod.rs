//! Control-plane side of the pipeline.
//!
//! # Data Flow
//! ```text
//! control-plane store
//!     │ watch(prefix, revision)
//!     ▼
//! watcher.rs (SourceWatcher) → SourceEvent::Resource(metadata) / Resynced(targets)
//!     │
//!     ▼  (commit pipeline decides when)
//! fetcher.rs (ConfigFetcher) → list target prefix → validator.rs → ConfigBundle
//! ```

pub mod fetcher;
pub mod validator;
pub mod watcher;

pub use fetcher::{list_targets, ConfigFetcher, FetchError, FetchResult};
pub use validator::{JsonObjectValidator, SchemaError, Validator};
pub use watcher::{SourceEvent, SourceWatcher, WatchState, WatchTrigger};

//! Commit subsystem.
//!
//! # Data Flow
//! ```text
//! SourceEvent → ReleaseRequest → debounce.rs (coalesce per target)
//!     │ tick: list_for_commit()
//!     ▼
//! pipeline.rs: segments of N targets, committed concurrently
//!     stage target  → registry.rs token(gateway) → fetch → sync
//!     global target → fetch → sync_global
//!     failure       → retry_count + 1 → back into debounce.rs (until max_retry)
//! ```

pub mod debounce;
pub mod pipeline;
pub mod registry;

pub use debounce::DebounceScheduler;
pub use pipeline::CommitPipeline;
pub use registry::GatewayTokenRegistry;

use thiserror::Error;

use crate::source::FetchError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),
}

pub type CommitResult<T> = Result<T, CommitError>;

//! Data-plane side of the pipeline.
//!
//! # Data Flow
//! ```text
//! desired ConfigBundle ─┐
//!                       ├─▶ differ.rs (diff) ─▶ applier.rs (ordered writes) ─▶ data-plane store
//! replica view ─────────┘                              │
//!                                                      └─▶ replica write-through
//! ```
//!
//! synchronizer.rs serializes every reconciliation behind one lock and
//! re-applies virtual_stage.rs on each global sync.

pub mod applier;
pub mod differ;
pub mod synchronizer;
pub mod virtual_stage;

pub use applier::{Applier, ApplyError, ApplyStats};
pub use differ::{diff, Diff};
pub use synchronizer::Synchronizer;
pub use virtual_stage::VirtualStage;

use thiserror::Error;

use crate::resource::ResourceError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("invalid virtual-stage resource: {0}")]
    Resource(#[from] ResourceError),

    #[error("failed to load extra resources from {path}: {message}")]
    ExtraResources { path: String, message: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

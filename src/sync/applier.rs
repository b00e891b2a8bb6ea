//! Dependency-safe writes to the data plane.
//!
//! Writes go out in an order that never leaves a dangling reference:
//! ```text
//! puts:    ssls, plugin_metadata, services ── pause ── routes
//! deletes: routes, plugin_metadata, ssls   ── pause ── services
//! ```
//! Puts always precede deletes. The first failed write aborts the rest.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::observability::metrics;
use crate::replica::ReplicaStore;
use crate::resource::{ConfigBundle, DataPlaneCodec, Resource, ResourceError, ResourceKind};
use crate::store::{KvStore, StoreError};
use crate::sync::differ::Diff;

const PUT_PHASES: [&[ResourceKind]; 2] = [
    &[ResourceKind::Ssl, ResourceKind::PluginMetadata, ResourceKind::Service],
    &[ResourceKind::Route],
];

const DELETE_PHASES: [&[ResourceKind]; 2] = [
    &[ResourceKind::Route, ResourceKind::PluginMetadata, ResourceKind::Ssl],
    &[ResourceKind::Service],
];

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to {operation} {kind} '{id}': {source}")]
    Write {
        operation: &'static str,
        kind: ResourceKind,
        id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Encode(#[from] ResourceError),
}

pub type ApplyResult<T> = Result<T, ApplyError>;

/// Number of writes issued by one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub puts: usize,
    pub deletes: usize,
}

impl ApplyStats {
    pub fn total(&self) -> usize {
        self.puts + self.deletes
    }

    pub fn add(&mut self, other: ApplyStats) {
        self.puts += other.puts;
        self.deletes += other.deletes;
    }
}

pub struct Applier {
    store: Arc<dyn KvStore>,
    codec: DataPlaneCodec,
    replica: Arc<ReplicaStore>,
    phase_pause: Duration,
}

impl Applier {
    pub fn new(
        store: Arc<dyn KvStore>,
        codec: DataPlaneCodec,
        replica: Arc<ReplicaStore>,
        phase_pause: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            replica,
            phase_pause,
        }
    }

    /// Write `diff` to the data plane, puts first.
    pub async fn apply(&self, diff: &Diff) -> ApplyResult<ApplyStats> {
        let mut stats = ApplyStats::default();
        if let Some(put) = &diff.put {
            record_diff(put, |size| (size, 0));
            stats.puts = self.run_phases(put, &PUT_PHASES, Write::Put).await?;
        }
        if let Some(delete) = &diff.delete {
            record_diff(delete, |size| (0, size));
            stats.deletes = self.run_phases(delete, &DELETE_PHASES, Write::Delete).await?;
        }
        Ok(stats)
    }

    async fn run_phases(
        &self,
        bundle: &ConfigBundle,
        phases: &[&[ResourceKind]],
        write: Write,
    ) -> ApplyResult<usize> {
        let mut written = 0;
        for (index, phase) in phases.iter().enumerate() {
            let pending: Vec<&Resource> = phase
                .iter()
                .filter_map(|kind| bundle.category(*kind))
                .flat_map(|category| category.values())
                .collect();
            if pending.is_empty() {
                continue;
            }
            if index > 0 && written > 0 && !self.phase_pause.is_zero() {
                tokio::time::sleep(self.phase_pause).await;
            }
            for resource in pending {
                self.write(resource, write).await?;
                written += 1;
            }
        }
        Ok(written)
    }

    async fn write(&self, resource: &Resource, write: Write) -> ApplyResult<()> {
        let kind = resource.kind();
        let Some(key) = self.codec.key(kind, &resource.id) else {
            return Err(ResourceError::Unsupported(kind).into());
        };
        let category = kind.category().unwrap_or("unknown");

        let result = match write {
            Write::Put => {
                let body = resource.encode()?;
                self.store.put(&key, body).await
            }
            Write::Delete => self.store.delete(&key).await,
        };
        metrics::record_write(category, write.as_str(), result.is_ok());

        match result {
            Ok(()) => {
                match write {
                    Write::Put => self.replica.record_put(resource),
                    Write::Delete => self.replica.record_delete(kind, &resource.id),
                }
                tracing::debug!(key = %key, operation = write.as_str(), "Data-plane write");
                Ok(())
            }
            Err(source) => {
                tracing::error!(key = %key, operation = write.as_str(), error = %source, "Data-plane write failed");
                Err(ApplyError::Write {
                    operation: write.as_str(),
                    kind,
                    id: resource.id.clone(),
                    source,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Write {
    Put,
    Delete,
}

impl Write {
    fn as_str(self) -> &'static str {
        match self {
            Write::Put => "put",
            Write::Delete => "delete",
        }
    }
}

fn record_diff(bundle: &ConfigBundle, split: impl Fn(usize) -> (usize, usize)) {
    for kind in ResourceKind::SUPPORTED {
        if let (Some(category), Some(size)) = (kind.category(), bundle.category(kind).map(|c| c.len())) {
            let (puts, deletes) = split(size);
            metrics::record_diff(category, puts, deletes);
        }
    }
}

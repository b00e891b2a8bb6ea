//! Operator orchestration.
//!
//! # Responsibilities
//! - Wait for leadership before touching the data plane
//! - Build the replica, synchronizer and commit pipeline in dependency order
//! - Reconcile every live target once, then follow the control-plane watch
//! - Tear everything down when leadership is lost or shutdown is requested
//!
//! # Design Decisions
//! - Store failures while a term starts are retried after a fixed backoff;
//!   a bad virtual-stage extras file is fatal
//! - Each leadership term gets its own cancellation scope
//! - The watch resumes from the revision of the initial listing, so nothing
//!   changed in between is missed

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::commit::CommitPipeline;
use crate::config::OperatorConfig;
use crate::leader::LeaderElector;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::replica::ReplicaStore;
use crate::resource::{DataPlaneCodec, KeyCodec, ReleaseRequest, ReleaseTarget};
use crate::source::{ConfigFetcher, FetchError, SourceEvent, SourceWatcher, Validator};
use crate::store::{KvStore, StoreError};
use crate::sync::{Applier, SyncError, Synchronizer, VirtualStage};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("initial replica sync failed: {0}")]
    Replica(#[source] StoreError),

    #[error("initial control-plane listing failed: {0}")]
    Listing(#[from] FetchError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl StartupError {
    /// Store failures while starting a term; the term is retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StartupError::Replica(_) | StartupError::Listing(_))
    }
}

/// The long-running gateway operator.
pub struct Operator {
    config: OperatorConfig,
    source: Arc<dyn KvStore>,
    target: Arc<dyn KvStore>,
    validator: Arc<dyn Validator>,
    leader: Arc<dyn LeaderElector>,
}

/// Components alive for one leadership term.
struct Term {
    replica: Arc<ReplicaStore>,
    fetcher: Arc<ConfigFetcher>,
    synchronizer: Arc<Synchronizer>,
    pipeline: Arc<CommitPipeline>,
}

impl Operator {
    pub fn new(
        config: OperatorConfig,
        source: Arc<dyn KvStore>,
        target: Arc<dyn KvStore>,
        validator: Arc<dyn Validator>,
        leader: Arc<dyn LeaderElector>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            validator,
            leader,
        }
    }

    /// Run until `shutdown` is triggered.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), StartupError> {
        let mut signal = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = signal.recv() => break,
                _ = self.leader.wait_for_leading() => {}
            }
            tracing::info!("Leadership acquired, starting reconciliation");

            let scope = Shutdown::new();
            let result = tokio::select! {
                result = self.lead(&scope) => result,
                _ = signal.recv() => Ok(()),
                _ = self.leader.wait_for_losing() => {
                    tracing::warn!("Leadership lost, standing by");
                    Ok(())
                }
            };
            scope.trigger();

            match result {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    let backoff = self.backoff_for(&e);
                    tracing::error!(error = %e, backoff = ?backoff, "Leadership term failed to start, retrying");
                    tokio::select! {
                        _ = signal.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }

            if signal.is_triggered() {
                break;
            }
        }
        tracing::info!("Operator stopped");
        Ok(())
    }

    fn backoff_for(&self, error: &StartupError) -> Duration {
        match error {
            StartupError::Replica(_) => self.config.target.watch_backoff(),
            _ => self.config.source.watch_backoff(),
        }
    }

    async fn lead(&self, scope: &Shutdown) -> Result<(), StartupError> {
        let term = self.build(scope).await?;
        let result = self.follow(&term, scope).await;
        term.replica.close();
        result
    }

    async fn build(&self, scope: &Shutdown) -> Result<Term, StartupError> {
        let target = &self.config.target;
        let dp_codec = DataPlaneCodec::new(&target.prefix);
        let replica = ReplicaStore::start(
            self.target.clone(),
            dp_codec.clone(),
            target.full_sync_timeout(),
            target.watch_backoff(),
            scope.subscribe(),
        )
        .await
        .map_err(StartupError::Replica)?;

        let applier = Applier::new(
            self.target.clone(),
            dp_codec,
            replica.clone(),
            self.config.apply.phase_pause(),
        );
        let virtual_stage = VirtualStage::new(&self.config.virtual_stage)?;
        let synchronizer = Arc::new(Synchronizer::new(applier, replica.clone(), virtual_stage));

        let source = &self.config.source;
        let fetcher = Arc::new(ConfigFetcher::new(
            self.source.clone(),
            KeyCodec::new(&source.prefix),
            &source.api_version,
            self.validator.clone(),
            source.fetch_timeout(),
        ));
        let pipeline = Arc::new(CommitPipeline::new(
            &self.config.commit,
            fetcher.clone(),
            synchronizer.clone(),
        ));

        Ok(Term {
            replica,
            fetcher,
            synchronizer,
            pipeline,
        })
    }

    async fn follow(&self, term: &Term, scope: &Shutdown) -> Result<(), StartupError> {
        let (targets, revision) = term.fetcher.list_targets().await?;
        let total = targets.len();
        let committed = term.pipeline.force_commit(targets.clone()).await;
        remove_stale_stages(term, &targets).await;
        tracing::info!(targets = total, committed, revision, "Initial reconciliation complete");

        tokio::spawn(term.pipeline.clone().run(scope.subscribe()));

        let source = &self.config.source;
        let mut events = SourceWatcher::new(
            self.source.clone(),
            KeyCodec::new(&source.prefix),
            source.watch_backoff(),
            source.fetch_timeout(),
        )
        .with_revision(revision)
        .watch(scope.subscribe());

        let mut signal: ShutdownSignal = scope.subscribe();
        loop {
            let event = tokio::select! {
                _ = signal.recv() => break,
                event = events.recv() => event,
            };
            match event {
                Some(SourceEvent::Resource(metadata)) => {
                    if let Some(request) = ReleaseRequest::from_metadata(&metadata) {
                        term.pipeline.scheduler().update(request);
                    }
                }
                Some(SourceEvent::Resynced(targets)) => {
                    let requests = targets.iter().cloned().map(ReleaseRequest::new).collect();
                    if term.pipeline.commit_sender().send(requests).await.is_err() {
                        break;
                    }
                    remove_stale_stages(term, &targets).await;
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Empty data-plane stages whose control-plane stage is gone.
async fn remove_stale_stages(term: &Term, live: &[ReleaseTarget]) {
    let keep: HashSet<String> = live
        .iter()
        .filter(|target| matches!(target, ReleaseTarget::Stage { .. }))
        .map(ReleaseTarget::key)
        .collect();
    match term.synchronizer.remove_not_exist_stage(&keep).await {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(stages = ?removed, "Removed stale data-plane stages")
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Failed to remove stale data-plane stages"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_failures_are_transient() {
        assert!(StartupError::Replica(StoreError::Unavailable("down".into())).is_transient());
        let listing = FetchError::Store(StoreError::Timeout(Duration::from_secs(1)));
        assert!(StartupError::Listing(listing).is_transient());

        let extras = SyncError::ExtraResources {
            path: "extras.json".into(),
            message: "expected an object".into(),
        };
        assert!(!StartupError::Sync(extras).is_transient());
    }
}

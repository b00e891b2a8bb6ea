//! Commit loop: debounced targets in, converged data plane out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::MissedTickBehavior;

use crate::commit::debounce::DebounceScheduler;
use crate::commit::registry::GatewayTokenRegistry;
use crate::commit::CommitResult;
use crate::config::schema::CommitConfig;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::observability::metrics;
use crate::resource::{ReleaseRequest, ReleaseTarget};
use crate::source::ConfigFetcher;
use crate::sync::Synchronizer;

struct Channels {
    batch_rx: mpsc::Receiver<Vec<ReleaseRequest>>,
    retry_rx: mpsc::UnboundedReceiver<ReleaseRequest>,
}

/// Commits targets in fixed-size concurrent segments.
///
/// Stage commits of one gateway never overlap. Failed commits go back through
/// the debounce scheduler until their retry budget is spent.
pub struct CommitPipeline {
    scheduler: DebounceScheduler,
    registry: GatewayTokenRegistry,
    fetcher: Arc<ConfigFetcher>,
    synchronizer: Arc<Synchronizer>,
    segment_size: usize,
    max_retry: u32,
    tick_interval: Duration,
    batch_tx: mpsc::Sender<Vec<ReleaseRequest>>,
    retry_tx: mpsc::UnboundedSender<ReleaseRequest>,
    channels: Mutex<Option<Channels>>,
}

impl CommitPipeline {
    pub fn new(
        config: &CommitConfig,
        fetcher: Arc<ConfigFetcher>,
        synchronizer: Arc<Synchronizer>,
    ) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: DebounceScheduler::new(config.debounce_window(), config.force_flush()),
            registry: GatewayTokenRegistry::new(),
            fetcher,
            synchronizer,
            segment_size: config.segment_size.max(1),
            max_retry: config.max_retry,
            tick_interval: config.tick_interval(),
            batch_tx,
            retry_tx,
            channels: Mutex::new(Some(Channels { batch_rx, retry_rx })),
        }
    }

    /// Scheduler that feeds this pipeline.
    pub fn scheduler(&self) -> &DebounceScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &GatewayTokenRegistry {
        &self.registry
    }

    /// Sender for batches that skip debouncing.
    pub fn commit_sender(&self) -> mpsc::Sender<Vec<ReleaseRequest>> {
        self.batch_tx.clone()
    }

    /// Commit `targets` now, bypassing the debounce window.
    ///
    /// Returns how many committed successfully; failures are queued for retry.
    pub async fn force_commit(&self, targets: Vec<ReleaseTarget>) -> usize {
        let requests = targets.into_iter().map(ReleaseRequest::new).collect();
        self.commit_batch(requests).await
    }

    /// Drop a gateway's commit token.
    pub fn cleanup_gateway(&self, gateway: &str) -> bool {
        let removed = self.registry.cleanup(gateway);
        if removed {
            tracing::info!(gateway = %gateway, "Released commit token of removed gateway");
        }
        removed
    }

    /// Run the commit loop until shutdown. Only the first call runs.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let Some(Channels { mut batch_rx, mut retry_rx }) = self.channels.lock().take() else {
            tracing::error!("Commit pipeline is already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            segment_size = self.segment_size,
            max_retry = self.max_retry,
            "Commit pipeline started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(batch) = batch_rx.recv() => {
                    self.commit_batch(batch).await;
                }
                Some(request) = retry_rx.recv() => self.handle_retry(request),
                _ = ticker.tick() => {
                    let due = self.scheduler.list_for_commit();
                    if !due.is_empty() {
                        self.commit_batch(due).await;
                    }
                }
            }
        }

        tracing::info!(pending = self.scheduler.len(), "Commit pipeline stopped");
    }

    async fn commit_batch(&self, requests: Vec<ReleaseRequest>) -> usize {
        let mut committed = 0;
        for segment in requests.chunks(self.segment_size) {
            let results = join_all(segment.iter().cloned().map(|request| self.commit(request))).await;
            committed += results.into_iter().filter(|ok| *ok).count();
        }
        committed
    }

    async fn commit(&self, request: ReleaseRequest) -> bool {
        let started = Instant::now();
        let target_type = target_type(&request.target);
        let result = match &request.target {
            ReleaseTarget::Stage { gateway, stage } => {
                self.commit_stage(&request, gateway, stage).await
            }
            ReleaseTarget::Global => self.commit_global(&request).await,
        };
        metrics::record_commit(target_type, result.is_ok(), started);

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    trace_id = %request.trace_id,
                    target = %request.target,
                    retry_count = request.retry_count,
                    error = %e,
                    "Commit failed"
                );
                // The receiver lives in `run`; before it starts retries wait in the channel.
                let _ = self.retry_tx.send(request);
                false
            }
        }
    }

    async fn commit_stage(&self, request: &ReleaseRequest, gateway: &str, stage: &str) -> CommitResult<()> {
        let permit = self.acquire(gateway).await;
        let bundle = self.fetcher.fetch(request).await?;
        let stats = self.synchronizer.sync(gateway, stage, &bundle).await?;
        tracing::info!(
            trace_id = %request.trace_id,
            target = %request.target,
            publish_id = request.publish_id,
            resources = bundle.len(),
            puts = stats.puts,
            deletes = stats.deletes,
            "Stage committed"
        );

        if bundle.is_empty() {
            match self.fetcher.gateway_exists(gateway).await {
                Ok(true) => {}
                Ok(false) => {
                    drop(permit);
                    self.cleanup_gateway(gateway);
                }
                // The data plane has converged; the token is retried on the next empty commit.
                Err(e) => tracing::warn!(
                    gateway = %gateway,
                    error = %e,
                    "Gateway lookup failed, keeping commit token"
                ),
            }
        }
        Ok(())
    }

    async fn commit_global(&self, request: &ReleaseRequest) -> CommitResult<()> {
        let bundle = self.fetcher.fetch(request).await?;
        let stats = self.synchronizer.sync_global(&bundle).await?;
        tracing::info!(
            trace_id = %request.trace_id,
            resources = bundle.len(),
            puts = stats.puts,
            deletes = stats.deletes,
            "Global resources committed"
        );
        Ok(())
    }

    /// Hold the gateway's token; a token closed by cleanup is replaced.
    async fn acquire(&self, gateway: &str) -> OwnedSemaphorePermit {
        loop {
            if let Ok(permit) = self.registry.token(gateway).acquire_owned().await {
                return permit;
            }
        }
    }

    fn handle_retry(&self, mut request: ReleaseRequest) {
        let target_type = target_type(&request.target);
        if request.retry_count >= self.max_retry {
            tracing::error!(
                trace_id = %request.trace_id,
                target = %request.target,
                retry_count = request.retry_count,
                "Dropping commit after exhausting retries"
            );
            metrics::record_dropped(target_type);
            return;
        }

        request.retry_count += 1;
        metrics::record_retry(target_type);
        if !self.scheduler.requeue(request) {
            tracing::debug!(target_type, "Newer request pending, retry superseded");
        }
    }
}

fn target_type(target: &ReleaseTarget) -> &'static str {
    match target {
        ReleaseTarget::Stage { .. } => "stage",
        ReleaseTarget::Global => "global",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::VirtualStageConfig;
    use crate::lifecycle::Shutdown;
    use crate::replica::ReplicaStore;
    use crate::resource::{DataPlaneCodec, KeyCodec, ResourceKind};
    use crate::source::JsonObjectValidator;
    use crate::store::{KvStore, MemoryStore};
    use crate::sync::{Applier, VirtualStage};

    const V: &str = "v2";

    struct Harness {
        source: MemoryStore,
        target: MemoryStore,
        codec: KeyCodec,
        pipeline: Arc<CommitPipeline>,
        shutdown: Shutdown,
    }

    async fn harness(max_retry: u32) -> Harness {
        harness_with(CommitConfig {
            max_retry,
            ..CommitConfig::default()
        })
        .await
    }

    async fn harness_with(config: CommitConfig) -> Harness {
        let source = MemoryStore::new();
        let target = MemoryStore::new();
        let codec = KeyCodec::new("/bk-gateway-apigw");
        let shutdown = Shutdown::new();

        let fetcher = Arc::new(ConfigFetcher::new(
            Arc::new(source.clone()),
            codec.clone(),
            V,
            Arc::new(JsonObjectValidator),
            Duration::from_secs(5),
        ));
        let dp_codec = DataPlaneCodec::new("/apisix");
        let replica = ReplicaStore::start(
            Arc::new(target.clone()),
            dp_codec.clone(),
            Duration::from_secs(5),
            Duration::from_millis(100),
            shutdown.subscribe(),
        )
        .await
        .unwrap();
        let applier = Applier::new(Arc::new(target.clone()), dp_codec, replica.clone(), Duration::ZERO);
        let synchronizer = Arc::new(Synchronizer::new(
            applier,
            replica,
            VirtualStage::new(&VirtualStageConfig::default()).unwrap(),
        ));
        let pipeline = Arc::new(CommitPipeline::new(&config, fetcher, synchronizer));
        tokio::spawn(pipeline.clone().run(shutdown.subscribe()));

        Harness {
            source,
            target,
            codec,
            pipeline,
            shutdown,
        }
    }

    async fn put_route(h: &Harness, gateway: &str, stage: &str, name: &str) {
        let key = h.codec.stage_key(V, gateway, stage, ResourceKind::Route, name);
        h.source.put(&key, br#"{"uris": ["/"]}"#.to_vec()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_request_is_committed() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;

        h.pipeline.scheduler().update(ReleaseRequest::new(ReleaseTarget::stage("demo", "prod")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_some());
        assert!(h.pipeline.scheduler().is_empty());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_at_cap() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;
        h.source.fail_next_lists(4);

        h.pipeline.scheduler().update(ReleaseRequest::new(ReleaseTarget::stage("demo", "prod")));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_none());
        assert!(h.pipeline.scheduler().is_empty());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_allowed_retry_succeeds() {
        let h = harness(4).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;
        h.source.fail_next_lists(4);

        h.pipeline.scheduler().update(ReleaseRequest::new(ReleaseTarget::stage("demo", "prod")));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_some());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_token_serializes_commits() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;

        let held = h.pipeline.registry().token("demo").acquire_owned().await.unwrap();
        let pipeline = h.pipeline.clone();
        let commit = tokio::spawn(async move {
            pipeline.force_commit(vec![ReleaseTarget::stage("demo", "prod")]).await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!commit.is_finished());
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_none());

        drop(held);
        assert_eq!(commit.await.unwrap(), 1);
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_some());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_gateway_releases_token() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;
        assert_eq!(h.pipeline.force_commit(vec![ReleaseTarget::stage("demo", "prod")]).await, 1);
        assert_eq!(h.pipeline.registry().len(), 1);

        h.source
            .delete(&h.codec.stage_key(V, "demo", "prod", ResourceKind::Route, "demo.prod.r1"))
            .await
            .unwrap();
        assert_eq!(h.pipeline.force_commit(vec![ReleaseTarget::stage("demo", "prod")]).await, 1);
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_none());
        assert!(h.pipeline.registry().is_empty());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_gateway_lookup_keeps_converged_commit() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;
        assert_eq!(h.pipeline.force_commit(vec![ReleaseTarget::stage("demo", "prod")]).await, 1);

        h.source
            .delete(&h.codec.stage_key(V, "demo", "prod", ResourceKind::Route, "demo.prod.r1"))
            .await
            .unwrap();
        h.source.fail_next_lists_of(&h.codec.gateway_prefix(V, "demo"), 1);
        assert_eq!(h.pipeline.force_commit(vec![ReleaseTarget::stage("demo", "prod")]).await, 1);
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_none());
        assert_eq!(h.pipeline.registry().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.pipeline.scheduler().is_empty());
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_capacity_bounds_batch_channel() {
        let h = harness_with(CommitConfig {
            channel_capacity: 7,
            ..CommitConfig::default()
        })
        .await;
        assert_eq!(h.pipeline.commit_sender().max_capacity(), 7);
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_sender_skips_debounce() {
        let h = harness(3).await;
        put_route(&h, "demo", "prod", "demo.prod.r1").await;

        h.pipeline
            .commit_sender()
            .send(vec![ReleaseRequest::new(ReleaseTarget::stage("demo", "prod"))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.target.get("/apisix/routes/demo.prod.r1").is_some());
        h.shutdown.trigger();
    }
}

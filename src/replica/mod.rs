//! In-memory mirror of the data-plane store.
//!
//! # Data Flow
//! ```text
//! start():  list(prefix) → parse → cache (grouped by stage key) + revision
//! task:     watch(prefix, revision + 1)
//!               Put    → upsert
//!               Delete → remove by id
//!               error  → back off, re-watch (full sync first when history is gone)
//! applier:  record_put / record_delete after each successful write
//! ```
//!
//! # Design Decisions
//! - Readers only ever take the read side of the lock
//! - Successful writes are recorded immediately so back-to-back commits never
//!   diff against a view that misses their own writes; the watch echo is idempotent
//! - Unparseable entries are skipped, never fatal

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::observability::metrics;
use crate::resource::{ConfigBundle, DataPlaneCodec, Resource, ResourceKind};
use crate::store::{with_timeout, EventType, KeyValue, KvStore, StoreResult, WatchEvent};

/// Value the data plane stores under bare category directories.
const DIR_MARKER: &[u8] = b"init_dir";

#[derive(Default)]
struct ReplicaCache {
    stages: BTreeMap<String, ConfigBundle>,
    owners: HashMap<(ResourceKind, String), String>,
}

impl ReplicaCache {
    fn upsert(&mut self, resource: Resource) {
        let stage = resource.stage_key();
        let key = (resource.kind(), resource.id.clone());
        if let Some(previous) = self.owners.insert(key.clone(), stage.clone()) {
            if previous != stage {
                self.remove_from(&previous, key.0, &key.1);
            }
        }
        self.stages.entry(stage).or_default().insert(resource);
    }

    fn remove(&mut self, kind: ResourceKind, id: &str) -> bool {
        match self.owners.remove(&(kind, id.to_string())) {
            Some(stage) => {
                self.remove_from(&stage, kind, id);
                true
            }
            None => false,
        }
    }

    fn remove_from(&mut self, stage: &str, kind: ResourceKind, id: &str) {
        if let Some(bundle) = self.stages.get_mut(stage) {
            bundle.remove(kind, id);
            if bundle.is_empty() {
                self.stages.remove(stage);
            }
        }
    }

    fn len(&self) -> usize {
        self.owners.len()
    }
}

/// Cached view of the data plane, kept current by a background watch.
pub struct ReplicaStore {
    store: Arc<dyn KvStore>,
    codec: DataPlaneCodec,
    cache: RwLock<ReplicaCache>,
    revision: AtomicI64,
    full_sync_timeout: Duration,
    backoff: Duration,
    closed: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaStore {
    /// Take a full snapshot and start incremental sync.
    ///
    /// Fails when the initial snapshot cannot be taken.
    pub async fn start(
        store: Arc<dyn KvStore>,
        codec: DataPlaneCodec,
        full_sync_timeout: Duration,
        backoff: Duration,
        shutdown: ShutdownSignal,
    ) -> StoreResult<Arc<Self>> {
        let replica = Arc::new(Self {
            store,
            codec,
            cache: RwLock::new(ReplicaCache::default()),
            revision: AtomicI64::new(0),
            full_sync_timeout,
            backoff,
            closed: Shutdown::new(),
            task: Mutex::new(None),
        });
        replica.full_sync().await?;

        let handle = tokio::spawn(Arc::clone(&replica).incremental_sync(shutdown));
        *replica.task.lock() = Some(handle);
        Ok(replica)
    }

    /// Resources of one stage key.
    pub fn get(&self, stage_key: &str) -> Option<ConfigBundle> {
        self.cache.read().stages.get(stage_key).cloned()
    }

    /// Every cached stage.
    pub fn get_all(&self) -> BTreeMap<String, ConfigBundle> {
        self.cache.read().stages.clone()
    }

    pub fn stage_keys(&self) -> Vec<String> {
        self.cache.read().stages.keys().cloned().collect()
    }

    /// Last data-plane revision applied to the cache.
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a resource just written to the data plane.
    pub fn record_put(&self, resource: &Resource) {
        self.cache.write().upsert(resource.clone());
    }

    /// Record a resource just deleted from the data plane.
    pub fn record_delete(&self, kind: ResourceKind, id: &str) {
        self.cache.write().remove(kind, id);
    }

    /// Stop incremental sync. Idempotent.
    pub fn close(&self) {
        self.closed.trigger();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::info!("Replica closed");
        }
    }

    async fn full_sync(&self) -> StoreResult<()> {
        let prefix = self.codec.watch_prefix();
        let listed = with_timeout(self.full_sync_timeout, self.store.list(&prefix)).await?;

        let mut cache = ReplicaCache::default();
        for kv in &listed.kvs {
            if let Some(resource) = self.parse(kv) {
                cache.upsert(resource);
            }
        }

        let size = cache.len();
        *self.cache.write() = cache;
        self.revision.store(listed.revision, Ordering::Release);
        metrics::record_replica_size(size);
        tracing::info!(
            prefix = %prefix,
            revision = listed.revision,
            resources = size,
            "Replica full sync complete"
        );
        Ok(())
    }

    fn parse(&self, kv: &KeyValue) -> Option<Resource> {
        let (kind, id) = self.codec.parse(&kv.key)?;
        let trimmed = kv.value.trim_ascii();
        if trimmed.is_empty() || trimmed == DIR_MARKER || trimmed == b"{}" {
            return None;
        }
        match Resource::decode(kind, &id, &kv.value) {
            Ok(resource) => Some(resource),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "Skipping unparseable data-plane entry");
                None
            }
        }
    }

    async fn incremental_sync(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let prefix = self.codec.watch_prefix();
        let mut closed = self.closed.subscribe();

        loop {
            let start = self.revision() + 1;
            let result = tokio::select! {
                _ = shutdown.recv() => break,
                _ = closed.recv() => break,
                result = self.store.watch(&prefix, start) => result,
            };

            let error = match result {
                Ok(mut stream) => loop {
                    let item = tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = closed.recv() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(batch)) => self.apply_batch(batch.events),
                        Some(Err(e)) => break Some(e),
                        None => break None,
                    }
                },
                Err(e) => Some(e),
            };

            match error {
                Some(e) if e.requires_resync() => {
                    tracing::warn!(error = %e, "Replica watch lost history, running full sync");
                    if let Err(e) = self.full_sync().await {
                        tracing::error!(error = %e, "Replica full sync failed");
                        self.revision.store(0, Ordering::Release);
                    } else {
                        continue;
                    }
                }
                Some(e) => tracing::warn!(error = %e, revision = self.revision(), "Replica watch failed"),
                None => tracing::warn!(revision = self.revision(), "Replica watch closed"),
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = closed.recv() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
        tracing::debug!("Replica incremental sync stopped");
    }

    fn apply_batch(&self, events: Vec<WatchEvent>) {
        let mut cache = self.cache.write();
        for event in events {
            match event.event_type {
                EventType::Put => {
                    if let Some(resource) = self.parse(&event.kv) {
                        cache.upsert(resource);
                    }
                }
                EventType::Delete => {
                    if let Some((kind, id)) = self.codec.parse(&event.kv.key) {
                        cache.remove(kind, &id);
                    }
                }
            }
            self.revision.fetch_max(event.kv.mod_revision, Ordering::AcqRel);
        }
        metrics::record_replica_size(cache.len());
    }
}

impl Drop for ReplicaStore {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{GATEWAY_LABEL, GLOBAL_STAGE_KEY, STAGE_LABEL};
    use crate::store::{MemoryStore, StoreError};
    use serde_json::json;

    fn labelled(gateway: &str, stage: &str) -> serde_json::Value {
        json!({GATEWAY_LABEL: gateway, STAGE_LABEL: stage})
    }

    async fn put(store: &MemoryStore, key: &str, value: serde_json::Value) {
        store.put(key, value.to_string().into_bytes()).await.unwrap();
    }

    async fn start(store: &MemoryStore, shutdown: &Shutdown) -> Arc<ReplicaStore> {
        ReplicaStore::start(
            Arc::new(store.clone()),
            DataPlaneCodec::new("/apisix"),
            Duration::from_secs(5),
            Duration::from_millis(100),
            shutdown.subscribe(),
        )
        .await
        .unwrap()
    }

    async fn caught_up(replica: &ReplicaStore, store: &MemoryStore) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while replica.revision() < store.revision() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replica should catch up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_groups_by_stage_and_skips_markers() {
        let store = MemoryStore::new();
        store.put("/apisix/routes", b"init_dir".to_vec()).await.unwrap();
        store.put("/apisix/routes/placeholder", b"{}".to_vec()).await.unwrap();
        put(&store, "/apisix/routes/demo.prod.r1", json!({"uri": "/", "labels": labelled("demo", "prod")})).await;
        put(&store, "/apisix/services/demo.prod.s1", json!({"labels": labelled("demo", "prod")})).await;
        put(&store, "/apisix/plugin_metadata/bk-cors", json!({"log_format": {}})).await;
        store.put("/apisix/ssls/broken", b"not json".to_vec()).await.unwrap();

        let shutdown = Shutdown::new();
        let replica = start(&store, &shutdown).await;

        assert_eq!(replica.revision(), 6);
        assert_eq!(replica.stage_keys(), vec!["demo/prod".to_string(), GLOBAL_STAGE_KEY.to_string()]);
        let stage = replica.get("demo/prod").unwrap();
        assert_eq!(stage.routes.len(), 1);
        assert_eq!(stage.services.len(), 1);
        assert_eq!(replica.get(GLOBAL_STAGE_KEY).unwrap().plugin_metadata.len(), 1);
        assert_eq!(replica.len(), 3);
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_sync_applies_puts_and_deletes() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let replica = start(&store, &shutdown).await;

        put(&store, "/apisix/routes/r1", json!({"uri": "/a", "labels": labelled("demo", "prod")})).await;
        put(&store, "/apisix/routes/r2", json!({"uri": "/b", "labels": labelled("demo", "test")})).await;
        caught_up(&replica, &store).await;
        assert_eq!(replica.stage_keys(), vec!["demo/prod", "demo/test"]);

        store.delete("/apisix/routes/r2").await.unwrap();
        caught_up(&replica, &store).await;
        assert_eq!(replica.stage_keys(), vec!["demo/prod"]);
        assert!(replica.get("demo/test").is_none());
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_after_compaction() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let replica = start(&store, &shutdown).await;

        put(&store, "/apisix/routes/r1", json!({"uri": "/a"})).await;
        caught_up(&replica, &store).await;

        store.break_watches(StoreError::Compacted { requested: 1, compact_revision: 1 });
        put(&store, "/apisix/routes/r2", json!({"uri": "/b"})).await;
        caught_up(&replica, &store).await;
        assert_eq!(replica.get(GLOBAL_STAGE_KEY).unwrap().routes.len(), 2);
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorded_writes_and_close() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let replica = start(&store, &shutdown).await;

        let route = Resource::from_value(
            ResourceKind::Route,
            "r1",
            json!({"uri": "/", "labels": labelled("demo", "prod")}),
        )
        .unwrap();
        replica.record_put(&route);
        assert_eq!(replica.get("demo/prod").unwrap().routes.len(), 1);
        replica.record_delete(ResourceKind::Route, "r1");
        assert!(replica.is_empty());

        replica.close();
        replica.close();
        put(&store, "/apisix/routes/r9", json!({"uri": "/"})).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(replica.is_empty());
    }
}

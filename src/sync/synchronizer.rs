//! Reconciliation of desired bundles against the replica.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::replica::ReplicaStore;
use crate::resource::{stage_key, ConfigBundle, GLOBAL_STAGE_KEY};
use crate::sync::applier::{Applier, ApplyStats};
use crate::sync::differ::diff;
use crate::sync::virtual_stage::VirtualStage;
use crate::sync::SyncResult;

/// Applies desired state stage by stage.
///
/// Every entry point holds one process-wide lock, so no two reconciliations
/// interleave their writes.
pub struct Synchronizer {
    applier: Applier,
    replica: Arc<ReplicaStore>,
    virtual_stage: VirtualStage,
    lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(applier: Applier, replica: Arc<ReplicaStore>, virtual_stage: VirtualStage) -> Self {
        Self {
            applier,
            replica,
            virtual_stage,
            lock: Mutex::new(()),
        }
    }

    /// Converge one stage to `desired`. An empty bundle removes the stage.
    pub async fn sync(&self, gateway: &str, stage: &str, desired: &ConfigBundle) -> SyncResult<ApplyStats> {
        let _guard = self.lock.lock().await;
        let key = stage_key(gateway, stage);
        let current = self.replica.get(&key);
        let stats = self.applier.apply(&diff(current.as_ref(), Some(desired))).await?;
        tracing::info!(stage = %key, puts = stats.puts, deletes = stats.deletes, "Stage synced");
        Ok(stats)
    }

    /// Converge global plugin metadata and re-apply the virtual stage.
    pub async fn sync_global(&self, desired: &ConfigBundle) -> SyncResult<ApplyStats> {
        let _guard = self.lock.lock().await;

        // Unlabelled data-plane resources of other kinds are not ours to remove.
        let current = self.replica.get(GLOBAL_STAGE_KEY).map(|bundle| ConfigBundle {
            plugin_metadata: bundle.plugin_metadata,
            ..ConfigBundle::default()
        });
        let mut stats = self.applier.apply(&diff(current.as_ref(), Some(desired))).await?;

        let virtual_current = self.replica.get(&self.virtual_stage.stage_key());
        stats.add(
            self.applier
                .apply(&diff(virtual_current.as_ref(), Some(self.virtual_stage.bundle())))
                .await?,
        );

        tracing::info!(puts = stats.puts, deletes = stats.deletes, "Global resources synced");
        Ok(stats)
    }

    /// Empty every replica stage not in `keep`, sparing the virtual stage and
    /// global resources. Returns the stages removed.
    pub async fn remove_not_exist_stage(&self, keep: &HashSet<String>) -> SyncResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let virtual_key = self.virtual_stage.stage_key();

        let mut removed = Vec::new();
        for (key, bundle) in self.replica.get_all() {
            if key == GLOBAL_STAGE_KEY || key == virtual_key || keep.contains(&key) {
                continue;
            }
            let stats = self.applier.apply(&diff(Some(&bundle), None)).await?;
            tracing::info!(stage = %key, deletes = stats.deletes, "Removed stage missing from control plane");
            removed.push(key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::VirtualStageConfig;
    use crate::lifecycle::Shutdown;
    use crate::resource::{DataPlaneCodec, Resource, ResourceKind, GATEWAY_LABEL, STAGE_LABEL};
    use crate::store::{KvStore, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    async fn synchronizer(store: &MemoryStore, shutdown: &Shutdown) -> (Synchronizer, Arc<ReplicaStore>) {
        let codec = DataPlaneCodec::new("/apisix");
        let replica = ReplicaStore::start(
            Arc::new(store.clone()),
            codec.clone(),
            Duration::from_secs(5),
            Duration::from_millis(100),
            shutdown.subscribe(),
        )
        .await
        .unwrap();
        let applier = Applier::new(Arc::new(store.clone()), codec, replica.clone(), Duration::ZERO);
        let virtual_stage = VirtualStage::new(&VirtualStageConfig::default()).unwrap();
        (Synchronizer::new(applier, replica.clone(), virtual_stage), replica)
    }

    fn stage_bundle(gateway: &str, stage: &str, routes: &[&str]) -> ConfigBundle {
        let mut bundle = ConfigBundle::new();
        for id in routes {
            let mut route = Resource::from_value(ResourceKind::Route, id, json!({"uri": format!("/{id}")})).unwrap();
            route.set_label(GATEWAY_LABEL, gateway);
            route.set_label(STAGE_LABEL, stage);
            bundle.insert(route);
        }
        bundle
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_is_idempotent_and_converges_deletes() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let (sync, replica) = synchronizer(&store, &shutdown).await;

        let stats = sync.sync("demo", "prod", &stage_bundle("demo", "prod", &["r1", "r2"])).await.unwrap();
        assert_eq!(stats.puts, 2);
        let stats = sync.sync("demo", "prod", &stage_bundle("demo", "prod", &["r1", "r2"])).await.unwrap();
        assert_eq!(stats.total(), 0);

        let stats = sync.sync("demo", "prod", &stage_bundle("demo", "prod", &["r1"])).await.unwrap();
        assert_eq!(stats, ApplyStats { puts: 0, deletes: 1 });
        assert_eq!(store.keys("/apisix/routes/"), vec!["/apisix/routes/r1"]);

        sync.sync("demo", "prod", &ConfigBundle::new()).await.unwrap();
        assert!(replica.get("demo/prod").is_none());
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_global_keeps_virtual_stage_and_foreign_resources() {
        let store = MemoryStore::new();
        store.put("/apisix/routes/manual", br#"{"uri": "/manual"}"#.to_vec()).await.unwrap();
        let shutdown = Shutdown::new();
        let (sync, _replica) = synchronizer(&store, &shutdown).await;

        let mut desired = ConfigBundle::new();
        desired.insert(Resource::from_value(ResourceKind::PluginMetadata, "bk-cors", json!({})).unwrap());
        let stats = sync.sync_global(&desired).await.unwrap();
        assert_eq!(stats.puts, 3);
        assert!(store.get("/apisix/routes/manual").is_some());
        assert!(store.get("/apisix/routes/-.-.healthz").is_some());

        let stats = sync.sync_global(&ConfigBundle::new()).await.unwrap();
        assert_eq!(stats, ApplyStats { puts: 0, deletes: 1 });
        assert!(store.get("/apisix/routes/-.-.not-found").is_some());
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_not_exist_stage() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let (sync, replica) = synchronizer(&store, &shutdown).await;

        sync.sync("a", "prod", &stage_bundle("a", "prod", &["a1"])).await.unwrap();
        sync.sync("b", "prod", &stage_bundle("b", "prod", &["b1", "b2"])).await.unwrap();
        sync.sync_global(&ConfigBundle::new()).await.unwrap();

        let keep: HashSet<String> = ["a/prod".to_string()].into();
        let removed = sync.remove_not_exist_stage(&keep).await.unwrap();
        assert_eq!(removed, vec!["b/prod"]);
        assert_eq!(replica.stage_keys(), vec!["-/-", "a/prod"]);
        shutdown.trigger();
    }
}

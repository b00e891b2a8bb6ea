//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use gateway_operator::config::OperatorConfig;
use gateway_operator::leader::StandaloneLeader;
use gateway_operator::lifecycle::{Operator, Shutdown, StartupError};
use gateway_operator::resource::{KeyCodec, ResourceKind};
use gateway_operator::source::JsonObjectValidator;
use gateway_operator::store::{KvStore, MemoryStore};

pub const API_VERSION: &str = "v2";

/// An operator wired to two in-memory stores.
pub struct Harness {
    pub source: MemoryStore,
    pub target: MemoryStore,
    pub codec: KeyCodec,
    pub shutdown: Shutdown,
    pub leader: Arc<StandaloneLeader>,
    pub handle: JoinHandle<Result<(), StartupError>>,
}

impl Harness {
    /// Start an operator over `source` with a fresh data plane.
    pub fn start(source: MemoryStore, config: OperatorConfig) -> Self {
        Self::start_with(source, MemoryStore::new(), config, StandaloneLeader::new())
    }

    pub fn start_with(
        source: MemoryStore,
        target: MemoryStore,
        config: OperatorConfig,
        leader: StandaloneLeader,
    ) -> Self {
        let codec = KeyCodec::new(&config.source.prefix);
        let shutdown = Shutdown::new();
        let leader = Arc::new(leader);
        let operator = Operator::new(
            config,
            Arc::new(source.clone()),
            Arc::new(target.clone()),
            Arc::new(JsonObjectValidator),
            leader.clone(),
        );
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { operator.run(shutdown).await })
        };
        Self {
            source,
            target,
            codec,
            shutdown,
            leader,
            handle,
        }
    }

    pub async fn put_stage(&self, gateway: &str, stage: &str, kind: ResourceKind, name: &str, body: Value) {
        let key = self.codec.stage_key(API_VERSION, gateway, stage, kind, name);
        self.source.put(&key, body.to_string().into_bytes()).await.unwrap();
    }

    pub async fn delete_stage(&self, gateway: &str, stage: &str, kind: ResourceKind, name: &str) {
        let key = self.codec.stage_key(API_VERSION, gateway, stage, kind, name);
        self.source.delete(&key).await.unwrap();
    }

    pub async fn put_global(&self, kind: ResourceKind, name: &str, body: Value) {
        let key = self.codec.global_key(API_VERSION, kind, name);
        self.source.put(&key, body.to_string().into_bytes()).await.unwrap();
    }

    /// Data-plane body at `/apisix/{category}/{id}`.
    pub fn data_plane(&self, category: &str, id: &str) -> Option<Value> {
        self.target
            .get(&format!("/apisix/{category}/{id}"))
            .and_then(|raw| serde_json::from_slice(&raw).ok())
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .expect("operator should stop")
            .unwrap()
            .unwrap();
    }
}

/// Operator config with the stock prefixes and no phase pause.
pub fn test_config() -> OperatorConfig {
    let mut config = OperatorConfig::default();
    config.apply.phase_pause_ms = 0;
    config.observability.metrics_enabled = false;
    config
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

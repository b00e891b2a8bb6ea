//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the operator.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the gateway operator.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OperatorConfig {
    /// Control-plane store holding authored gateway resources.
    pub source: SourceConfig,

    /// Data-plane store read by the proxy.
    pub target: TargetConfig,

    /// Debounce and commit pipeline settings.
    pub commit: CommitConfig,

    /// Apply ordering settings.
    pub apply: ApplyConfig,

    /// Built-in routes kept alive in the data plane.
    pub virtual_stage: VirtualStageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Connection settings for an etcd cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Endpoints (e.g., "http://127.0.0.1:2379").
    pub endpoints: Vec<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

/// Control-plane side.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub etcd: EtcdConfig,

    /// Key prefix of the control plane (e.g., "/bk-gateway-apigw").
    pub prefix: String,

    /// Key-space version segment (e.g., "v2").
    pub api_version: String,

    /// Fixed backoff before re-establishing a broken watch, in seconds.
    pub watch_backoff_secs: u64,

    /// Timeout for a single target fetch, in seconds.
    pub fetch_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            etcd: EtcdConfig::default(),
            prefix: "/bk-gateway-apigw".to_string(),
            api_version: "v2".to_string(),
            watch_backoff_secs: 5,
            fetch_timeout_secs: 10,
        }
    }
}

impl SourceConfig {
    pub fn watch_backoff(&self) -> Duration {
        Duration::from_secs(self.watch_backoff_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Data-plane side.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub etcd: EtcdConfig,

    /// Key prefix of the data plane (e.g., "/apisix").
    pub prefix: String,

    /// Timeout for a full listing of the data plane, in seconds.
    pub full_sync_timeout_secs: u64,

    /// Fixed backoff before re-watching the data plane, in seconds.
    pub watch_backoff_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            etcd: EtcdConfig::default(),
            prefix: "/apisix".to_string(),
            full_sync_timeout_secs: 30,
            watch_backoff_secs: 2,
        }
    }
}

impl TargetConfig {
    pub fn full_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.full_sync_timeout_secs)
    }

    pub fn watch_backoff(&self) -> Duration {
        Duration::from_secs(self.watch_backoff_secs)
    }
}

/// Debounce scheduler and commit pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Sliding debounce window in milliseconds.
    pub debounce_window_ms: u64,

    /// Maximum time a target may stay pending under continuous churn, in seconds.
    pub force_flush_secs: u64,

    /// Interval of the flush scan, in milliseconds.
    pub tick_interval_ms: u64,

    /// Number of targets committed concurrently per segment.
    pub segment_size: usize,

    /// Retries allowed per target before it is dropped.
    pub max_retry: u32,

    /// Capacity of the batch channel behind `commit_sender`. Retries are queued unbounded.
    pub channel_capacity: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 2_000,
            force_flush_secs: 10,
            tick_interval_ms: 500,
            segment_size: 10,
            max_retry: 3,
            channel_capacity: 100,
        }
    }
}

impl CommitConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn force_flush(&self) -> Duration {
        Duration::from_secs(self.force_flush_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Apply ordering configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Pause between dependency phases in milliseconds.
    pub phase_pause_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self { phase_pause_ms: 500 }
    }
}

impl ApplyConfig {
    pub fn phase_pause(&self) -> Duration {
        Duration::from_millis(self.phase_pause_ms)
    }
}

/// Virtual stage carrying built-in routes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualStageConfig {
    pub gateway: String,
    pub stage: String,

    /// Path answered by the health-check route.
    pub health_check_path: String,

    /// Optional JSON file with extra resources for the virtual stage.
    pub extra_resources_path: Option<String>,
}

impl Default for VirtualStageConfig {
    fn default() -> Self {
        Self {
            gateway: "-".to_string(),
            stage: "-".to_string(),
            health_check_path: "/healthz".to_string(),
            extra_resources_path: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

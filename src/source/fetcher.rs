//! Desired-state assembly from the control plane.
//!
//! # Responsibilities
//! - List every key of one target
//! - Skip kinds that are not translated to the data plane
//! - Validate, decode and label each resource
//! - Abort the whole target on the first bad key or resource

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::observability::metrics;
use crate::resource::key::{KeyError, SourceKey};
use crate::resource::metadata::ReleaseInfo;
use crate::resource::{
    ConfigBundle, KeyCodec, Operation, ReleaseRequest, ReleaseTarget, Resource, ResourceError,
    ResourceKind, ResourceMetadata, APISIX_VERSION_LABEL, GATEWAY_LABEL, PUBLISH_ID_LABEL,
    STAGE_LABEL,
};
use crate::source::validator::{SchemaError, Validator};
use crate::store::{with_timeout, KvStore, StoreError};

/// Errors that abort a target fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed key: {0}")]
    Key(#[from] KeyError),

    #[error("invalid resource: {0}")]
    Resource(#[from] ResourceError),

    #[error("validation failed: {0}")]
    Validation(#[from] SchemaError),

    #[error("key '{key}' does not belong to target {target}")]
    ForeignKey { key: String, target: ReleaseTarget },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// List every live target of the control plane.
///
/// Returns the targets (global always included) and the listing revision.
pub async fn list_targets(
    store: &dyn KvStore,
    codec: &KeyCodec,
    limit: Duration,
) -> FetchResult<(Vec<ReleaseTarget>, i64)> {
    let listed = with_timeout(limit, store.list(&codec.watch_prefix())).await?;

    let mut keys = BTreeSet::new();
    let mut targets = vec![ReleaseTarget::Global];
    for kv in &listed.kvs {
        let parsed = match codec.parse(&kv.key) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "Skipping malformed key while listing targets");
                continue;
            }
        };
        if let Some(target) = ResourceMetadata::from_key(&parsed, Operation::Put).target() {
            if target != ReleaseTarget::Global && keys.insert(target.key()) {
                targets.push(target);
            }
        }
    }
    Ok((targets, listed.revision))
}

/// Builds desired-state bundles for commit targets.
pub struct ConfigFetcher {
    store: Arc<dyn KvStore>,
    codec: KeyCodec,
    api_version: String,
    validator: Arc<dyn Validator>,
    timeout: Duration,
}

impl ConfigFetcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        codec: KeyCodec,
        api_version: &str,
        validator: Arc<dyn Validator>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            api_version: api_version.to_string(),
            validator,
            timeout,
        }
    }

    /// Desired state of the request's target.
    pub async fn fetch(&self, request: &ReleaseRequest) -> FetchResult<ConfigBundle> {
        match &request.target {
            ReleaseTarget::Stage { gateway, stage } => {
                self.fetch_stage(request, gateway, stage).await
            }
            ReleaseTarget::Global => self.fetch_global(request).await,
        }
    }

    /// Whether any key of `gateway` is left in the control plane.
    pub async fn gateway_exists(&self, gateway: &str) -> FetchResult<bool> {
        let prefix = self.codec.gateway_prefix(&self.api_version, gateway);
        let listed = with_timeout(self.timeout, self.store.list(&prefix)).await?;
        Ok(!listed.kvs.is_empty())
    }

    pub async fn list_targets(&self) -> FetchResult<(Vec<ReleaseTarget>, i64)> {
        list_targets(self.store.as_ref(), &self.codec, self.timeout).await
    }

    async fn fetch_stage(
        &self,
        request: &ReleaseRequest,
        gateway: &str,
        stage: &str,
    ) -> FetchResult<ConfigBundle> {
        let prefix = self.codec.stage_prefix(&self.api_version, gateway, stage);
        let listed = with_timeout(self.timeout, self.store.list(&prefix)).await?;

        let mut parsed = Vec::with_capacity(listed.kvs.len());
        let mut release = ReleaseInfo::default();
        for kv in listed.kvs {
            let key = self.codec.parse(&kv.key)?;
            match &key {
                SourceKey::Release { .. } => {
                    if let Ok(value) = serde_json::from_slice(&kv.value) {
                        release = ReleaseInfo::from_value(&value);
                    }
                }
                SourceKey::Stage {
                    gateway: g,
                    stage: s,
                    ..
                } if g == gateway && s == stage => parsed.push((key, kv.value)),
                _ => {
                    return Err(FetchError::ForeignKey {
                        key: kv.key,
                        target: request.target.clone(),
                    })
                }
            }
        }

        let publish_id = if request.publish_id > 0 {
            request.publish_id
        } else {
            release.publish_id
        };
        let apisix_version = if request.apisix_version.is_empty() {
            release.apisix_version
        } else {
            request.apisix_version.clone()
        };

        let mut bundle = ConfigBundle::new();
        for (key, raw) in parsed {
            let Some(mut resource) = self.convert(&key, &apisix_version, &raw)? else {
                continue;
            };
            resource.set_label(GATEWAY_LABEL, gateway);
            resource.set_label(STAGE_LABEL, stage);
            if publish_id > 0 {
                resource.set_label(PUBLISH_ID_LABEL, publish_id.to_string());
            }
            if !apisix_version.is_empty() {
                resource.set_label(APISIX_VERSION_LABEL, apisix_version.as_str());
            }
            bundle.insert(resource);
        }

        tracing::debug!(
            trace_id = %request.trace_id,
            target = %request.target,
            publish_id,
            resources = bundle.len(),
            "Fetched stage configuration"
        );
        Ok(bundle)
    }

    async fn fetch_global(&self, request: &ReleaseRequest) -> FetchResult<ConfigBundle> {
        let prefix = self.codec.global_prefix(&self.api_version);
        let listed = with_timeout(self.timeout, self.store.list(&prefix)).await?;

        let mut bundle = ConfigBundle::new();
        for kv in listed.kvs {
            let key = self.codec.parse(&kv.key)?;
            if !matches!(key, SourceKey::Global { .. }) {
                return Err(FetchError::ForeignKey {
                    key: kv.key,
                    target: ReleaseTarget::Global,
                });
            }
            if key.kind() != Some(ResourceKind::PluginMetadata) {
                tracing::debug!(key = %kv.key, "Skipping global resource kind without translation");
                continue;
            }
            if let Some(resource) = self.convert(&key, &request.apisix_version, &kv.value)? {
                bundle.insert(resource);
            }
        }

        tracing::debug!(
            trace_id = %request.trace_id,
            resources = bundle.len(),
            "Fetched global configuration"
        );
        Ok(bundle)
    }

    /// Validate and decode one resource; `Ok(None)` for skipped kinds.
    fn convert(
        &self,
        key: &SourceKey,
        apisix_version: &str,
        raw: &[u8],
    ) -> FetchResult<Option<Resource>> {
        let Some(kind) = key.kind().filter(|kind| kind.is_supported()) else {
            tracing::debug!(
                kind = key.kind_segment(),
                name = key.name(),
                "Skipping kind without data-plane translation"
            );
            return Ok(None);
        };

        let result = self
            .validator
            .validate(apisix_version, kind, raw)
            .map_err(FetchError::from)
            .and_then(|()| Resource::decode(kind, key.name(), raw).map_err(FetchError::from));
        metrics::record_conversion(kind.segment(), if result.is_ok() { "success" } else { "fail" });
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::validator::JsonObjectValidator;
    use crate::store::MemoryStore;
    use serde_json::json;

    const V: &str = "v2";

    fn setup() -> (MemoryStore, ConfigFetcher, KeyCodec) {
        let store = MemoryStore::new();
        let codec = KeyCodec::new("/prefix");
        let fetcher = ConfigFetcher::new(
            Arc::new(store.clone()),
            codec.clone(),
            V,
            Arc::new(JsonObjectValidator),
            Duration::from_secs(5),
        );
        (store, fetcher, codec)
    }

    async fn put(store: &MemoryStore, key: String, value: serde_json::Value) {
        store.put(&key, value.to_string().into_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_stage_labels_and_skips_unsupported() {
        let (store, fetcher, codec) = setup();
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Route, "demo.prod.r1"),
            json!({"uris": ["/r1"], "service_id": "demo.prod.s1"})).await;
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Service, "demo.prod.s1"),
            json!({"upstream": {"type": "roundrobin"}})).await;
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Consumer, "alice"),
            json!({"username": "alice"})).await;
        put(&store, codec.release_key(V, "demo", "prod", "demo-prod"),
            json!({"publish_id": 12, "apisix_version": "3.13"})).await;
        put(&store, codec.stage_key(V, "demo", "test", ResourceKind::Route, "demo.test.r1"),
            json!({"uris": ["/other"]})).await;

        let request = ReleaseRequest::new(ReleaseTarget::stage("demo", "prod"));
        let bundle = fetcher.fetch(&request).await.unwrap();

        assert_eq!(bundle.len(), 2);
        let route = bundle.get(ResourceKind::Route, "demo.prod.r1").unwrap();
        assert_eq!(route.labels.get(GATEWAY_LABEL).map(String::as_str), Some("demo"));
        assert_eq!(route.labels.get(PUBLISH_ID_LABEL).map(String::as_str), Some("12"));
        assert_eq!(route.labels.get(APISIX_VERSION_LABEL).map(String::as_str), Some("3.13"));
        assert_eq!(route.stage_key(), "demo/prod");
    }

    #[tokio::test]
    async fn test_one_bad_resource_aborts_target() {
        let (store, fetcher, codec) = setup();
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Route, "ok"), json!({"uri": "/"})).await;
        store
            .put(&codec.stage_key(V, "demo", "prod", ResourceKind::Service, "broken"), b"not json".to_vec())
            .await
            .unwrap();

        let request = ReleaseRequest::new(ReleaseTarget::stage("demo", "prod"));
        assert!(matches!(fetcher.fetch(&request).await, Err(FetchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_fetch_global_plugin_metadata_only() {
        let (store, fetcher, codec) = setup();
        put(&store, codec.global_key(V, ResourceKind::PluginMetadata, "bk-concurrency-limit"),
            json!({"conn": 100})).await;
        put(&store, codec.global_key(V, ResourceKind::Ssl, "wildcard"), json!({"cert": "c"})).await;

        let bundle = fetcher.fetch(&ReleaseRequest::new(ReleaseTarget::Global)).await.unwrap();
        assert_eq!(bundle.len(), 1);
        let metadata = bundle.get(ResourceKind::PluginMetadata, "bk-concurrency-limit").unwrap();
        assert_eq!(metadata.stage_key(), crate::resource::GLOBAL_STAGE_KEY);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_fetch() {
        let (store, fetcher, _) = setup();
        store.fail_next_lists(1);
        let request = ReleaseRequest::new(ReleaseTarget::stage("demo", "prod"));
        assert!(matches!(fetcher.fetch(&request).await, Err(FetchError::Store(_))));
    }

    #[tokio::test]
    async fn test_list_targets_and_gateway_exists() {
        let (store, fetcher, codec) = setup();
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Route, "r1"), json!({})).await;
        put(&store, codec.stage_key(V, "demo", "prod", ResourceKind::Route, "r2"), json!({})).await;
        put(&store, codec.release_key(V, "other", "test", "rel"), json!({})).await;

        let (targets, revision) = fetcher.list_targets().await.unwrap();
        assert_eq!(revision, 3);
        assert_eq!(
            targets,
            vec![
                ReleaseTarget::Global,
                ReleaseTarget::stage("demo", "prod"),
                ReleaseTarget::stage("other", "test"),
            ]
        );
        assert!(fetcher.gateway_exists("demo").await.unwrap());
        assert!(!fetcher.gateway_exists("ghost").await.unwrap());
    }
}

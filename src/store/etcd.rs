//! etcd v3 backed store.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, WatchOptions};
use futures_util::stream::{self, StreamExt};

use crate::config::schema::EtcdConfig;
use crate::store::{
    EventType, KeyValue, KvStore, ListResponse, StoreError, StoreResult, WatchBatch, WatchEvent,
    WatchStream,
};

const FUTURE_REVISION_REASON: &str = "future revision";

/// etcd client wrapper implementing [`KvStore`].
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the cluster described by `config`.
    pub async fn connect(config: &EtcdConfig) -> StoreResult<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .with_timeout(Duration::from_secs(config.request_timeout_secs));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(unavailable)?;

        tracing::info!(
            endpoints = ?config.endpoints,
            "Connected to etcd"
        );
        Ok(Self { client })
    }
}

fn unavailable(e: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
    }
}

fn convert_response(
    resp: etcd_client::WatchResponse,
    start_revision: i64,
) -> StoreResult<WatchBatch> {
    if resp.canceled() {
        if resp.compact_revision() > 0 {
            return Err(StoreError::Compacted {
                requested: start_revision,
                compact_revision: resp.compact_revision(),
            });
        }
        if resp.cancel_reason().contains(FUTURE_REVISION_REASON) {
            return Err(StoreError::FutureRevision {
                requested: start_revision,
            });
        }
        return Err(StoreError::WatchClosed(resp.cancel_reason().to_string()));
    }

    // Resume points must come from delivered events, never from the header.
    let mut revision = 0;
    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let event_type = match event.event_type() {
            etcd_client::EventType::Put => EventType::Put,
            etcd_client::EventType::Delete => EventType::Delete,
        };
        let kv = convert_kv(kv);
        revision = revision.max(kv.mod_revision);
        events.push(WatchEvent { event_type, kv });
    }
    Ok(WatchBatch { revision, events })
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn list(&self, prefix: &str) -> StoreResult<ListResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(ListResponse {
            kvs: resp.kvs().iter().map(convert_kv).collect(),
            revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (watcher, events) = client
            .watch(prefix, Some(options))
            .await
            .map_err(unavailable)?;

        // The watcher handle keeps the request side open; it lives as long as the stream.
        let stream = stream::unfold(
            Some((watcher, events)),
            move |state| async move {
                let (watcher, mut events) = state?;
                match events.message().await {
                    Ok(Some(resp)) => {
                        let item = convert_response(resp, start_revision);
                        let next = if item.is_err() { None } else { Some((watcher, events)) };
                        Some((item, next))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(unavailable(e)), None)),
                }
            },
        );
        Ok(stream.boxed())
    }
}

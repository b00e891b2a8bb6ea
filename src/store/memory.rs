//! In-memory revisioned store.
//!
//! Mirrors the etcd v3 semantics the operator relies on: a global revision
//! bumped by every write, prefix watches that replay history from a start
//! revision, and compaction that makes older revisions unwatchable.
//! Also records every applied write so callers can assert on write order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::store::{
    EventType, KeyValue, KvStore, ListResponse, StoreError, StoreResult, WatchBatch, WatchEvent,
    WatchStream,
};

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    compact_revision: i64,
    history: Vec<WatchEvent>,
    subscribers: Vec<Subscriber>,
    write_log: Vec<(EventType, String)>,
    failing_writes: u32,
    failing_lists: u32,
    failing_prefix_lists: HashMap<String, u32>,
}

impl Inner {
    fn publish(&mut self, event: WatchEvent) {
        let revision = event.kv.mod_revision;
        self.history.push(event.clone());
        self.subscribers.retain(|sub| {
            if !event.kv.key.starts_with(&sub.prefix) {
                return !sub.tx.is_closed();
            }
            let batch = WatchBatch {
                revision,
                events: vec![event.clone()],
            };
            sub.tx.send(Ok(batch)).is_ok()
        });
    }
}

/// Shared in-memory store. Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Read a single key.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().data.get(key).map(|kv| kv.value.clone())
    }

    /// Every key currently stored under `prefix`.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Writes applied so far, in order.
    pub fn write_log(&self) -> Vec<(EventType, String)> {
        self.inner.lock().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.inner.lock().write_log.clear();
    }

    /// Discard history up to `revision`; watches starting before it fail
    /// with [`StoreError::Compacted`].
    pub fn compact(&self, revision: i64) {
        let mut inner = self.inner.lock();
        inner.compact_revision = revision.min(inner.revision);
        let compact_revision = inner.compact_revision;
        inner
            .history
            .retain(|event| event.kv.mod_revision >= compact_revision);
    }

    /// Terminate every open watch with `error`.
    pub fn break_watches(&self, error: StoreError) {
        let mut inner = self.inner.lock();
        for sub in inner.subscribers.drain(..) {
            let _ = sub.tx.send(Err(error.clone()));
        }
    }

    /// Close every open watch without an error.
    pub fn close_watches(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Fail the next `count` put/delete calls with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().failing_writes = count;
    }

    /// Fail the next `count` list calls with [`StoreError::Unavailable`].
    pub fn fail_next_lists(&self, count: u32) {
        self.inner.lock().failing_lists = count;
    }

    /// Fail the next `count` list calls made for exactly `prefix`.
    pub fn fail_next_lists_of(&self, prefix: &str, count: u32) {
        self.inner
            .lock()
            .failing_prefix_lists
            .insert(prefix.to_string(), count);
    }

    fn take_write_failure(inner: &mut Inner) -> StoreResult<()> {
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list(&self, prefix: &str) -> StoreResult<ListResponse> {
        let mut inner = self.inner.lock();
        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(StoreError::Unavailable("injected list failure".to_string()));
        }
        if let Some(remaining) = inner.failing_prefix_lists.get_mut(prefix).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(StoreError::Unavailable(format!("injected list failure for {prefix}")));
        }
        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(ListResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        Self::take_write_failure(&mut inner)?;
        inner.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            mod_revision: inner.revision,
        };
        inner.data.insert(key.to_string(), kv.clone());
        inner.write_log.push((EventType::Put, key.to_string()));
        inner.publish(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        Self::take_write_failure(&mut inner)?;
        if inner.data.remove(key).is_none() {
            return Ok(());
        }
        inner.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            mod_revision: inner.revision,
        };
        inner.write_log.push((EventType::Delete, key.to_string()));
        inner.publish(WatchEvent {
            event_type: EventType::Delete,
            kv,
        });
        Ok(())
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> StoreResult<WatchStream> {
        let mut inner = self.inner.lock();
        if start_revision > 0 && start_revision < inner.compact_revision {
            return Err(StoreError::Compacted {
                requested: start_revision,
                compact_revision: inner.compact_revision,
            });
        }
        if start_revision > inner.revision + 1 {
            return Err(StoreError::FutureRevision {
                requested: start_revision,
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        if start_revision > 0 {
            for event in inner
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= start_revision && e.kv.key.starts_with(prefix))
            {
                let batch = WatchBatch {
                    revision: event.kv.mod_revision,
                    events: vec![event.clone()],
                };
                let _ = tx.send(Ok(batch));
            }
        }
        inner.subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_list_delete() {
        let store = MemoryStore::new();
        store.put("/a/1", b"one".to_vec()).await.unwrap();
        store.put("/a/2", b"two".to_vec()).await.unwrap();
        store.put("/b/1", b"other".to_vec()).await.unwrap();

        let listed = store.list("/a/").await.unwrap();
        assert_eq!(listed.kvs.len(), 2);
        assert_eq!(listed.revision, 3);

        store.delete("/a/1").await.unwrap();
        store.delete("/a/missing").await.unwrap();
        assert_eq!(store.revision(), 4);
        assert_eq!(store.keys("/a/"), vec!["/a/2".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_replays_history_then_streams() {
        let store = MemoryStore::new();
        store.put("/a/1", b"one".to_vec()).await.unwrap();
        store.put("/a/2", b"two".to_vec()).await.unwrap();

        let mut stream = store.watch("/a/", 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.events[0].kv.key, "/a/2");

        store.delete("/a/2").await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.events[0].event_type, EventType::Delete);
        assert_eq!(second.revision, 3);
    }

    #[tokio::test]
    async fn test_watch_compacted_and_future_revisions() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.put(&format!("/k/{i}"), b"v".to_vec()).await.unwrap();
        }
        store.compact(4);

        assert!(matches!(
            store.watch("/k/", 2).await,
            Err(StoreError::Compacted { requested: 2, compact_revision: 4 })
        ));
        assert!(store.watch("/k/", 4).await.is_ok());
        assert!(matches!(
            store.watch("/k/", 42).await,
            Err(StoreError::FutureRevision { requested: 42 })
        ));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.put("/x", b"1".to_vec()).await.is_err());
        assert!(store.put("/x", b"1".to_vec()).await.is_ok());
        assert_eq!(store.write_log(), vec![(EventType::Put, "/x".to_string())]);
    }
}

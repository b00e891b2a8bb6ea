//! Control-plane watch loop.
//!
//! # State Machine
//! ```text
//! Connecting ──ok──▶ Streaming ──stream closed / error──▶ BackingOff ──▶ Connecting
//!     │                  │
//!     │                  └──compacted / future revision──▶ Resyncing ──▶ Connecting
//!     └──compacted──▶ Resyncing
//! any state ──cancelled──▶ Stopped
//! ```
//!
//! Resuming always starts at the last seen revision + 1, so delivery is
//! at-least-once with no gaps. When the history needed to resume is gone the
//! watcher lists the whole prefix, emits [`SourceEvent::Resynced`] with every
//! live target and continues from the listing revision.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::lifecycle::shutdown::ShutdownSignal;
use crate::observability::metrics;
use crate::resource::key::KeyError;
use crate::resource::{KeyCodec, Operation, ReleaseTarget, ResourceMetadata};
use crate::source::fetcher::list_targets;
use crate::store::{EventType, KvStore, StoreError, WatchEvent, WatchStream};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the watcher hands to the reconciliation loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// One changed control-plane key.
    Resource(ResourceMetadata),
    /// The watch lost history; every listed target must be reconciled.
    Resynced(Vec<ReleaseTarget>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Streaming,
    BackingOff,
    Resyncing,
    Stopped,
}

/// Why the watcher left its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTrigger {
    StreamClosed,
    Compacted,
    Failed,
    Cancelled,
}

impl WatchTrigger {
    fn from_error(error: &StoreError) -> Self {
        if error.requires_resync() {
            WatchTrigger::Compacted
        } else {
            WatchTrigger::Failed
        }
    }
}

impl WatchState {
    pub fn on(self, trigger: WatchTrigger) -> WatchState {
        match trigger {
            WatchTrigger::Cancelled => WatchState::Stopped,
            _ if self == WatchState::Stopped => WatchState::Stopped,
            WatchTrigger::Compacted => WatchState::Resyncing,
            WatchTrigger::StreamClosed | WatchTrigger::Failed => WatchState::BackingOff,
        }
    }
}

/// Long-lived watch over the control-plane prefix.
pub struct SourceWatcher {
    store: Arc<dyn KvStore>,
    codec: KeyCodec,
    backoff: Duration,
    list_timeout: Duration,
    /// Last revision delivered downstream.
    revision: i64,
    state: WatchState,
}

impl SourceWatcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        codec: KeyCodec,
        backoff: Duration,
        list_timeout: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            backoff,
            list_timeout,
            revision: 0,
            state: WatchState::Connecting,
        }
    }

    /// Resume after `revision`, typically the revision of an initial listing.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    /// Start the watch loop and return its event channel.
    ///
    /// The channel closes once the loop stops.
    pub fn watch(self, shutdown: ShutdownSignal) -> mpsc::Receiver<SourceEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx, shutdown));
        rx
    }

    async fn run(mut self, tx: mpsc::Sender<SourceEvent>, mut shutdown: ShutdownSignal) {
        let prefix = self.codec.watch_prefix();
        tracing::info!(prefix = %prefix, revision = self.revision, "Control-plane watcher started");

        loop {
            match self.state {
                WatchState::Connecting => {
                    let start = self.revision + 1;
                    let result = tokio::select! {
                        _ = shutdown.recv() => {
                            self.transition(WatchTrigger::Cancelled);
                            continue;
                        }
                        result = self.store.watch(&prefix, start) => result,
                    };
                    match result {
                        Ok(stream) => {
                            tracing::debug!(start_revision = start, "Watch established");
                            self.state = WatchState::Streaming;
                            let trigger = self.stream(stream, &tx, &mut shutdown).await;
                            self.transition(trigger);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, start_revision = start, "Failed to establish watch");
                            self.transition(WatchTrigger::from_error(&e));
                        }
                    }
                }
                WatchState::BackingOff => {
                    tokio::select! {
                        _ = shutdown.recv() => self.transition(WatchTrigger::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => self.state = WatchState::Connecting,
                    }
                }
                WatchState::Resyncing => {
                    match list_targets(self.store.as_ref(), &self.codec, self.list_timeout).await {
                        Ok((targets, revision)) => {
                            tracing::info!(
                                targets = targets.len(),
                                revision,
                                "Resynced control-plane state after lost history"
                            );
                            self.revision = revision;
                            if tx.send(SourceEvent::Resynced(targets)).await.is_err() {
                                self.transition(WatchTrigger::Cancelled);
                            } else {
                                self.state = WatchState::Connecting;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Resync listing failed, retrying");
                            tokio::select! {
                                _ = shutdown.recv() => self.transition(WatchTrigger::Cancelled),
                                _ = tokio::time::sleep(self.backoff) => {}
                            }
                        }
                    }
                }
                WatchState::Streaming => self.state = WatchState::Connecting,
                WatchState::Stopped => break,
            }
        }

        tracing::info!(revision = self.revision, "Control-plane watcher stopped");
    }

    fn transition(&mut self, trigger: WatchTrigger) {
        let next = self.state.on(trigger);
        tracing::debug!(from = ?self.state, to = ?next, trigger = ?trigger, "Watcher state change");
        self.state = next;
    }

    async fn stream(
        &mut self,
        mut stream: WatchStream,
        tx: &mpsc::Sender<SourceEvent>,
        shutdown: &mut ShutdownSignal,
    ) -> WatchTrigger {
        loop {
            let item = tokio::select! {
                _ = shutdown.recv() => return WatchTrigger::Cancelled,
                item = stream.next() => item,
            };
            let batch = match item {
                None => {
                    tracing::warn!(revision = self.revision, "Watch stream closed");
                    return WatchTrigger::StreamClosed;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, revision = self.revision, "Watch stream failed");
                    return WatchTrigger::from_error(&e);
                }
                Some(Ok(batch)) => batch,
            };

            for event in batch.events {
                let revision = event.kv.mod_revision;
                if let Some(metadata) = self.convert(event) {
                    if tx.send(SourceEvent::Resource(metadata)).await.is_err() {
                        return WatchTrigger::Cancelled;
                    }
                }
                self.revision = self.revision.max(revision);
            }
        }
    }

    fn convert(&self, event: WatchEvent) -> Option<ResourceMetadata> {
        let (operation, label) = match event.event_type {
            EventType::Put => (Operation::Put, "put"),
            EventType::Delete => (Operation::Delete, "delete"),
        };

        let key = match self.codec.parse(&event.kv.key) {
            Ok(key) => key,
            Err(e) => {
                match (operation, &e) {
                    (Operation::Put, KeyError::TooFewSegments { .. }) => {
                        tracing::error!(key = %event.kv.key, error = %e, "Dropping put event with malformed key")
                    }
                    _ => tracing::warn!(key = %event.kv.key, error = %e, "Skipping event with malformed key"),
                }
                metrics::record_source_event("unknown", label, "malformed");
                return None;
            }
        };

        let mut metadata = ResourceMetadata::from_key(&key, operation);
        if operation == Operation::Put {
            metadata = metadata.with_value(&event.kv.value);
        }
        if metadata.is_empty() {
            tracing::debug!(key = %event.kv.key, "Ignoring event outside any stage");
            metrics::record_source_event(&metadata.kind, label, "ignored");
            return None;
        }

        tracing::debug!(
            trace_id = %metadata.trace_id,
            kind = %metadata.kind,
            id = %metadata.id,
            gateway = %metadata.labels.gateway,
            stage = %metadata.labels.stage,
            operation = label,
            revision = event.kv.mod_revision,
            "Control-plane event"
        );
        metrics::record_source_event(&metadata.kind, label, "accepted");
        Some(metadata)
    }
}

//! Per-target coalescing of change bursts.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::resource::ReleaseRequest;

#[derive(Debug, Clone)]
struct DebounceEntry {
    first_seen: Instant,
    deadline: Instant,
    request: ReleaseRequest,
}

impl DebounceEntry {
    fn is_due(&self, now: Instant, force_flush: Duration) -> bool {
        now >= self.deadline || now.duration_since(self.first_seen) >= force_flush
    }
}

/// Sliding-window debounce keyed by target.
///
/// Each update pushes the target's deadline out by `window`; a target that
/// keeps changing still flushes once `force_flush` has passed since its
/// first pending change.
#[derive(Clone)]
pub struct DebounceScheduler {
    entries: Arc<DashMap<String, DebounceEntry>>,
    window: Duration,
    force_flush: Duration,
}

impl DebounceScheduler {
    pub fn new(window: Duration, force_flush: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
            force_flush,
        }
    }

    /// Record a pending commit, replacing any queued request for the same target.
    pub fn update(&self, request: ReleaseRequest) {
        let now = Instant::now();
        match self.entries.entry(request.key()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.deadline = now + self.window;
                entry.request = request;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DebounceEntry {
                    first_seen: now,
                    deadline: now + self.window,
                    request,
                });
            }
        }
    }

    /// Queue a failed request again unless a newer one is already pending.
    pub fn requeue(&self, request: ReleaseRequest) -> bool {
        match self.entries.entry(request.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let now = Instant::now();
                vacant.insert(DebounceEntry {
                    first_seen: now,
                    deadline: now + self.window,
                    request,
                });
                true
            }
        }
    }

    /// Remove and return every request that is ready to commit.
    pub fn list_for_commit(&self) -> Vec<ReleaseRequest> {
        let now = Instant::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_due(now, self.force_flush))
            .map(|entry| entry.key().clone())
            .collect();

        let mut ready: Vec<ReleaseRequest> = due
            .iter()
            .filter_map(|key| {
                self.entries
                    .remove_if(key, |_, entry| entry.is_due(now, self.force_flush))
                    .map(|(_, entry)| entry.request)
            })
            .collect();
        ready.sort_by_key(|request| request.key());
        ready
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ReleaseTarget;
    use tokio::time::advance;

    fn scheduler() -> DebounceScheduler {
        DebounceScheduler::new(Duration::from_secs(2), Duration::from_secs(10))
    }

    fn request(gateway: &str, stage: &str, publish_id: i64) -> ReleaseRequest {
        let mut request = ReleaseRequest::new(ReleaseTarget::stage(gateway, stage));
        request.publish_id = publish_id;
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_latest_request() {
        let scheduler = scheduler();
        for publish_id in 1..=5 {
            scheduler.update(request("demo", "prod", publish_id));
            advance(Duration::from_millis(100)).await;
        }
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.list_for_commit().is_empty());

        advance(Duration::from_secs(2)).await;
        let ready = scheduler.list_for_commit();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].publish_id, 5);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_churn_flushes_at_ceiling() {
        let scheduler = scheduler();
        let mut flushed_at = None;
        for step in 1..=30u64 {
            scheduler.update(request("demo", "prod", step as i64));
            advance(Duration::from_secs(1)).await;
            if !scheduler.list_for_commit().is_empty() {
                flushed_at = Some(step);
                break;
            }
        }
        assert_eq!(flushed_at, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_never_replaces_pending_request() {
        let scheduler = scheduler();
        scheduler.update(request("demo", "prod", 7));

        let mut retry = request("demo", "prod", 3);
        retry.retry_count = 1;
        assert!(!scheduler.requeue(retry));
        assert!(scheduler.requeue(request("demo", "test", 1)));

        advance(Duration::from_secs(2)).await;
        let ready = scheduler.list_for_commit();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].publish_id, 7);
        assert_eq!(ready[0].retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_are_independent() {
        let scheduler = scheduler();
        scheduler.update(request("a", "prod", 1));
        advance(Duration::from_secs(1)).await;
        scheduler.update(request("b", "prod", 1));
        scheduler.update(ReleaseRequest::new(ReleaseTarget::Global));

        advance(Duration::from_secs(1)).await;
        let ready: Vec<String> = scheduler.list_for_commit().iter().map(|r| r.key()).collect();
        assert_eq!(ready, vec!["a/prod"]);

        advance(Duration::from_secs(1)).await;
        let ready: Vec<String> = scheduler.list_for_commit().iter().map(|r| r.key()).collect();
        assert_eq!(ready, vec!["b/prod", "global"]);
    }
}

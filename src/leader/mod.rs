//! Leadership gate for the reconciliation loop.
//!
//! Only the leader writes to the data plane. The election protocol itself
//! lives outside the operator; this module defines the seam and a
//! single-instance implementation.

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Whether this instance currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Resolve once this instance is leading.
    async fn wait_for_leading(&self);

    /// Resolve once leadership is lost.
    async fn wait_for_losing(&self);
}

/// Elector for deployments with a single operator instance.
///
/// Leads from construction; `step_down` exists for tests and controlled handover.
pub struct StandaloneLeader {
    leading: watch::Sender<bool>,
}

impl StandaloneLeader {
    pub fn new() -> Self {
        let (leading, _) = watch::channel(true);
        Self { leading }
    }

    /// Start without leadership.
    pub fn follower() -> Self {
        let (leading, _) = watch::channel(false);
        Self { leading }
    }

    pub fn step_up(&self) {
        self.leading.send_replace(true);
    }

    pub fn step_down(&self) {
        self.leading.send_replace(false);
    }

    async fn wait_for(&self, leading: bool) {
        let mut rx = self.leading.subscribe();
        let _ = rx.wait_for(|state| *state == leading).await;
    }
}

impl Default for StandaloneLeader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderElector for StandaloneLeader {
    fn is_leader(&self) -> bool {
        *self.leading.borrow()
    }

    async fn wait_for_leading(&self) {
        self.wait_for(true).await;
    }

    async fn wait_for_losing(&self) {
        self.wait_for(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_standalone_leads_immediately() {
        let leader = StandaloneLeader::new();
        assert!(leader.is_leader());
        tokio::time::timeout(Duration::from_secs(1), leader.wait_for_leading())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_follower_waits_for_step_up() {
        let leader = Arc::new(StandaloneLeader::follower());
        assert!(!leader.is_leader());

        let waiter = {
            let leader = leader.clone();
            tokio::spawn(async move { leader.wait_for_leading().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        leader.step_up();
        waiter.await.unwrap();

        leader.step_down();
        tokio::time::timeout(Duration::from_secs(1), leader.wait_for_losing())
            .await
            .unwrap();
    }
}

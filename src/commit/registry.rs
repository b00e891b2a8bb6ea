//! Per-gateway commit tokens.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Semaphore;

/// Hands out one capacity-1 semaphore per gateway so that at most one commit
/// writes a gateway's resources at a time.
#[derive(Default)]
pub struct GatewayTokenRegistry {
    tokens: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl GatewayTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `gateway`, created on first use.
    pub fn token(&self, gateway: &str) -> Arc<Semaphore> {
        if let Some(token) = self.tokens.read().get(gateway) {
            return token.clone();
        }
        self.tokens
            .write()
            .entry(gateway.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Drop a gateway's token and close it.
    ///
    /// Waiters on the closed token fail to acquire and must fetch a fresh one.
    pub fn cleanup(&self, gateway: &str) -> bool {
        match self.tokens.write().remove(gateway) {
            Some(token) => {
                token.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

//! Pending authorization flows keyed by their `state` parameter.
//!
//! A flow is registered when the tenant is sent to the marketplace's consent
//! page and taken back out exactly once when the redirect arrives. Flows the
//! tenant abandons are swept by [`TokenLifecycleManager::begin_authorization`]
//! on each new flow; long-running services can additionally spawn
//! [`run_state_cleanup`] to bound memory between flows.
//!
//! [`TokenLifecycleManager::begin_authorization`]: crate::lifecycle::TokenLifecycleManager::begin_authorization

use crate::marketplace::Marketplace;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Who started a pending flow, and when.
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub tenant_id: String,
    pub marketplace: Marketplace,
    pub created_at: DateTime<Utc>,
}

impl StateEntry {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }
}

/// In-memory registry of pending authorization flows.
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct StateManager {
    states: Arc<DashMap<String, StateEntry>>,
    ttl: Duration,
}

impl StateManager {
    /// `ttl_seconds` is how long a tenant has to finish the consent screen.
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Registers a flow and returns its unguessable state value.
    pub fn create_state(&self, tenant_id: &str, marketplace: Marketplace) -> String {
        let state = Uuid::new_v4().to_string();
        self.states.insert(
            state.clone(),
            StateEntry {
                tenant_id: tenant_id.to_string(),
                marketplace,
                created_at: Utc::now(),
            },
        );
        state
    }

    /// Takes the flow for `state` out of the registry.
    ///
    /// `None` for unknown, already used, or expired states. An expired entry
    /// is removed all the same.
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let (_, entry) = self.states.remove(state)?;
        (!entry.is_expired(Utc::now(), self.ttl)).then_some(entry)
    }

    /// Drops expired flows, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.states.len();
        let now = Utc::now();
        self.states.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before.saturating_sub(self.states.len())
    }

    pub fn count(&self) -> usize {
        self.states.len()
    }
}

/// Sweeps expired flows every `interval_seconds`. Runs until aborted.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = manager.cleanup_expired();
        if removed > 0 {
            debug!(removed, pending = manager.count(), "Expired authorization states swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate_state() {
        let manager = StateManager::new(600);

        let state = manager.create_state("t1", Marketplace::MercadoLivre);
        assert!(!state.is_empty());

        let entry = manager.validate_and_consume(&state).unwrap();
        assert_eq!(entry.tenant_id, "t1");
        assert_eq!(entry.marketplace, Marketplace::MercadoLivre);
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = StateManager::new(600);

        let state = manager.create_state("t1", Marketplace::Amazon);

        assert!(manager.validate_and_consume(&state).is_some());
        assert!(manager.validate_and_consume(&state).is_none());
    }

    #[test]
    fn test_states_are_distinct() {
        let manager = StateManager::new(600);

        let a = manager.create_state("t1", Marketplace::Shopee);
        let b = manager.create_state("t1", Marketplace::Shopee);
        assert_ne!(a, b);
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn test_invalid_state_rejected() {
        let manager = StateManager::new(600);
        assert!(manager.validate_and_consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        let manager = StateManager::new(-1); // Already expired on creation

        let state = manager.create_state("t1", Marketplace::Shopee);

        assert!(manager.validate_and_consume(&state).is_none());
        // Consumed even though expired
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let expired = StateManager::new(-1);
        expired.create_state("t1", Marketplace::MercadoLivre);
        expired.create_state("t2", Marketplace::Amazon);
        assert_eq!(expired.count(), 2);

        assert_eq!(expired.cleanup_expired(), 2);
        assert_eq!(expired.count(), 0);

        let fresh = StateManager::new(600);
        fresh.create_state("t1", Marketplace::MercadoLivre);
        assert_eq!(fresh.cleanup_expired(), 0);
        assert_eq!(fresh.count(), 1);
    }

    #[tokio::test]
    async fn test_background_cleanup_runs_on_first_tick() {
        let manager = StateManager::new(-1);
        manager.create_state("t1", Marketplace::MercadoLivre);

        let handle = tokio::spawn(run_state_cleanup(manager.clone(), 60));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(manager.count(), 0);
        handle.abort();
    }
}

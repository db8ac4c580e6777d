//! OAuth state management for CSRF protection.
//!
//! Manages temporary state tokens used to prevent CSRF attacks during OAuth flow.

use crate::provider::Provider;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// OAuth state entry (tracks state parameter for CSRF protection)
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub provider: Provider,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// OAuth state manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// Create a new state manager
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    // A panic mid-insert cannot leave the map inconsistent
    fn states(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a new state token and store it
    pub fn create_state(&self, provider: Provider, user_id: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            provider,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };

        self.states().insert(state.clone(), entry);
        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the StateEntry if valid and not expired. The state is removed
    /// either way (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let entry = self.states().remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Clean up expired states (should be called periodically)
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let expiry = self.expiry_duration;
        self.states()
            .retain(|_, entry| now - entry.created_at <= expiry);
    }

    /// Get count of active states (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.states().len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!("OAuth state cleanup complete, {} states remaining", manager.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate_state() {
        let manager = StateManager::new(600);

        let state = manager.create_state(Provider::Google, "user123");
        assert!(!state.is_empty());

        let entry = manager.validate_and_consume(&state).unwrap();
        assert_eq!(entry.provider, Provider::Google);
        assert_eq!(entry.user_id, "user123");
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = StateManager::new(600);

        let state = manager.create_state(Provider::Slack, "alice");

        assert!(manager.validate_and_consume(&state).is_some());
        assert!(manager.validate_and_consume(&state).is_none());
    }

    #[test]
    fn test_invalid_state_rejected() {
        let manager = StateManager::new(600);
        assert!(manager.validate_and_consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        // Negative expiry: every state is already stale
        let manager = StateManager::new(-1);

        let state = manager.create_state(Provider::Asana, "bob");
        assert!(manager.validate_and_consume(&state).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let manager = StateManager::new(-1);

        manager.create_state(Provider::Google, "user1");
        manager.create_state(Provider::Slack, "user2");
        assert_eq!(manager.count(), 2);

        manager.cleanup_expired();
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_live_states() {
        let manager = StateManager::new(600);
        manager.create_state(Provider::Google, "user1");

        manager.cleanup_expired();
        assert_eq!(manager.count(), 1);
    }
}

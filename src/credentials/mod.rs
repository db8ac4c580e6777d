//! Credential lifecycle: store, refresh, status, disconnect.
//!
//! # Architecture
//!
//! ```text
//!   capture ──▶ TokenStore ─────────┐
//!                  ▲                ▼
//!   feature ──▶ TokenRefresher ──▶ RecordStore (one row per user+provider)
//!                  │                │ holds SecretRef only
//!                  ▼                ▼
//!            ProviderClient     SecretVault (raw tokens)
//!
//!   ConnectionStateQuery  ── reads RecordStore + probes SecretVault
//!   DisconnectService     ── releases SecretVault entries, deletes row
//! ```
//!
//! Every write to a (user, provider) row happens under that key's async lock
//! in [`KeyLocks`]. Independently of the lock, the row's refresh reference is
//! never overwritten with NULL by an upsert.

use crate::config::TokenConfig;
use crate::provider::{Provider, ProviderRegistry};
use crate::vault::{SecretRef, SecretVault};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

mod disconnect;
mod refresher;
mod status;
mod storage;
mod token_store;

pub use disconnect::DisconnectService;
pub use refresher::{TokenRefresher, ValidToken};
pub use status::{ConnectionStateQuery, ConnectionStatus};
pub use storage::RecordStore;
pub use token_store::{StoreOutcome, TokenGrant, TokenStore};

/// Persisted credential metadata for one (user, provider) pair.
///
/// Holds vault references only. The raw tokens never appear here.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CredentialRecord {
    pub user_id: String,
    pub provider: Provider,
    /// Display only
    pub provider_email: Option<String>,
    pub access_secret_ref: SecretRef,
    pub refresh_secret_ref: Option<SecretRef>,
    pub scopes: BTreeSet<String>,
    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
    /// Set after a terminal refresh failure; cleared by the next store
    pub reauth_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type LockKey = (String, Provider);

/// Per-(user, provider) async locks serializing credential writes.
///
/// An entry lives only while some caller holds or waits on it.
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Exclusive access to one (user, provider) record.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone, so a count of one means the map's is the last
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the (user, provider) record.
    pub async fn lock(&self, user_id: &str, provider: Provider) -> KeyGuard<'_> {
        let key = (user_id.to_string(), provider);
        let lock = self.locks.entry(key.clone()).or_default().clone();
        // DashMap shard guard is dropped before awaiting
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// The four server-side operations wired to one vault and one record table.
#[derive(Clone)]
pub struct CredentialServices {
    pub store: Arc<TokenStore>,
    pub refresher: Arc<TokenRefresher>,
    pub status: Arc<ConnectionStateQuery>,
    pub disconnect: Arc<DisconnectService>,
}

impl CredentialServices {
    pub fn new(
        vault: Arc<dyn SecretVault>,
        records: Arc<RecordStore>,
        providers: ProviderRegistry,
        tokens: &TokenConfig,
    ) -> Self {
        let locks = Arc::new(KeyLocks::new());
        let store = Arc::new(TokenStore::new(
            Arc::clone(&vault),
            Arc::clone(&records),
            Arc::clone(&locks),
            tokens.default_lifetime(),
        ));
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&store),
            providers,
            tokens.refresh_buffer(),
            tokens.refresh_timeout(),
        ));
        let status = Arc::new(ConnectionStateQuery::new(
            Arc::clone(&vault),
            Arc::clone(&records),
        ));
        let disconnect = Arc::new(DisconnectService::new(vault, records, locks));

        Self {
            store,
            refresher,
            status,
            disconnect,
        }
    }
}

//! Upserting freshly obtained tokens.

use super::{CredentialRecord, KeyLocks, RecordStore};
use crate::error::StorageError;
use crate::provider::Provider;
use crate::vault::{SecretRef, SecretString, SecretVault};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest access token lifetime taken at face value (one year). Anything
/// outside `1..=MAX_LIFETIME_SECS` falls back to the default lifetime.
pub const MAX_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// Tokens handed to [`TokenStore::store`].
#[derive(Clone, Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Absent when the provider did not issue (or rotate) one
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Provider-stated lifetime of the access token, in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub provider_email: Option<String>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<SecretString>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            scopes: Vec::new(),
            expires_in: None,
            provider_email: None,
        }
    }
}

/// Result of a successful store.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoreOutcome {
    pub provider_email: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// True when an existing refresh token was carried forward
    pub refresh_token_preserved: bool,
}

/// How the new `expires_at` relates to the stored one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExpiryRule {
    /// New login: the provider's answer wins
    Replace,
    /// Refresh: the stored expiry never moves backwards
    NeverDecrease,
}

/// Writes tokens to the vault and upserts the credential record.
pub struct TokenStore {
    vault: Arc<dyn SecretVault>,
    records: Arc<RecordStore>,
    locks: Arc<KeyLocks>,
    default_lifetime: Duration,
}

impl TokenStore {
    pub fn new(
        vault: Arc<dyn SecretVault>,
        records: Arc<RecordStore>,
        locks: Arc<KeyLocks>,
        default_lifetime: Duration,
    ) -> Self {
        Self {
            vault,
            records,
            locks,
            default_lifetime,
        }
    }

    pub(crate) fn vault(&self) -> &Arc<dyn SecretVault> {
        &self.vault
    }

    pub(crate) fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub(crate) fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }

    /// Stores tokens for a user and provider.
    ///
    /// If `grant.refresh_token` is `None` the record's existing refresh
    /// reference is kept. Providers routinely omit the refresh token on repeat
    /// logins.
    pub async fn store(
        &self,
        user_id: &str,
        provider: Provider,
        grant: TokenGrant,
    ) -> Result<StoreOutcome, StorageError> {
        let _guard = self.locks.lock(user_id, provider).await;
        self.store_locked(user_id, provider, grant, ExpiryRule::Replace)
    }

    /// [`store`](Self::store) for callers already holding the key lock.
    pub(crate) fn store_locked(
        &self,
        user_id: &str,
        provider: Provider,
        grant: TokenGrant,
        expiry: ExpiryRule,
    ) -> Result<StoreOutcome, StorageError> {
        let existing = self
            .records
            .get(user_id, provider)
            .map_err(|e| StorageError::Record(format!("{:#}", e)))?;

        let lifetime = self.lifetime(grant.expires_in);

        let access_ref = self.vault.put(&grant.access_token).map_err(|e| {
            warn!(user_id = %user_id, provider = %provider, error = %e, "Vault rejected access token");
            StorageError::Vault(format!("{:#}", e))
        })?;

        let new_refresh_ref = match &grant.refresh_token {
            Some(token) => match self.vault.put(token) {
                Ok(reference) => Some(reference),
                Err(e) => {
                    warn!(user_id = %user_id, provider = %provider, error = %e, "Vault rejected refresh token");
                    self.release_quietly(&access_ref);
                    return Err(StorageError::Vault(format!("{:#}", e)));
                }
            },
            None => None,
        };

        let previous_refresh_ref = existing.as_ref().and_then(|r| r.refresh_secret_ref.clone());
        let refresh_token_preserved = new_refresh_ref.is_none() && previous_refresh_ref.is_some();
        let refresh_secret_ref = new_refresh_ref.clone().or_else(|| previous_refresh_ref.clone());

        let now = Utc::now();
        let mut expires_at = now
            .checked_add_signed(lifetime)
            .unwrap_or(now + self.default_lifetime);
        if expiry == ExpiryRule::NeverDecrease {
            if let Some(current) = &existing {
                expires_at = expires_at.max(current.expires_at);
            }
        }

        let scopes = if grant.scopes.is_empty() {
            existing.as_ref().map(|r| r.scopes.clone()).unwrap_or_default()
        } else {
            grant.scopes.iter().cloned().collect()
        };

        let provider_email = grant
            .provider_email
            .clone()
            .or_else(|| existing.as_ref().and_then(|r| r.provider_email.clone()));

        let record = CredentialRecord {
            user_id: user_id.to_string(),
            provider,
            provider_email: provider_email.clone(),
            access_secret_ref: access_ref.clone(),
            refresh_secret_ref,
            scopes,
            expires_at,
            reauth_required: false,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        if let Err(e) = self.records.upsert(&record) {
            warn!(user_id = %user_id, provider = %provider, error = %e, "Credential upsert failed, releasing new vault entries");
            self.release_quietly(&access_ref);
            if let Some(reference) = &new_refresh_ref {
                self.release_quietly(reference);
            }
            return Err(StorageError::Record(format!("{:#}", e)));
        }

        // The record no longer points at these
        if let Some(old) = &existing {
            if old.access_secret_ref != access_ref {
                self.release_quietly(&old.access_secret_ref);
            }
        }
        if let (Some(_), Some(old)) = (&new_refresh_ref, &previous_refresh_ref) {
            self.release_quietly(old);
        }

        debug!(
            user_id = %user_id,
            provider = %provider,
            expires_at = %expires_at,
            refresh_token_preserved,
            "Credential record upserted"
        );
        info!(user_id = %user_id, provider = %provider, "Credentials stored");

        Ok(StoreOutcome {
            provider_email,
            expires_at,
            refresh_token_preserved,
        })
    }

    fn lifetime(&self, expires_in: Option<i64>) -> Duration {
        match expires_in {
            Some(secs) if (1..=MAX_LIFETIME_SECS).contains(&secs) => Duration::seconds(secs),
            Some(secs) => {
                warn!(expires_in = secs, "Ignoring out-of-range token lifetime");
                self.default_lifetime
            }
            None => self.default_lifetime,
        }
    }

    fn release_quietly(&self, reference: &SecretRef) {
        if let Err(e) = self.vault.release(reference) {
            warn!(reference = %reference, error = %e, "Failed to release vault entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::services_with;
    use crate::error::StorageError;
    use crate::provider::{Provider, ProviderRegistry};
    use crate::vault::SecretVault;
    use super::TokenGrant;
    use chrono::{Duration, Utc};

    fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
            scopes: vec!["https://www.googleapis.com/auth/calendar".to_string()],
            expires_in: Some(3600),
            provider_email: Some("user@example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn test_store_creates_record_with_vault_refs() {
        let (services, vault, records) = services_with(ProviderRegistry::new());

        let outcome = services
            .store
            .store("user1", Provider::Google, grant("ya29.a", Some("1//r")))
            .await
            .unwrap();
        assert_eq!(outcome.provider_email.as_deref(), Some("user@example.com"));
        assert!(!outcome.refresh_token_preserved);

        let record = records.get("user1", Provider::Google).unwrap().unwrap();
        assert_eq!(
            vault.resolve(&record.access_secret_ref).unwrap().unwrap().expose(),
            "ya29.a"
        );
        let refresh_ref = record.refresh_secret_ref.unwrap();
        assert_eq!(vault.resolve(&refresh_ref).unwrap().unwrap().expose(), "1//r");
        assert_eq!(vault.len(), 2);
    }

    #[tokio::test]
    async fn test_store_without_refresh_token_preserves_existing() {
        let (services, vault, records) = services_with(ProviderRegistry::new());
        services
            .store
            .store("user1", Provider::Google, grant("ya29.first", Some("1//keep")))
            .await
            .unwrap();
        let before = records.get("user1", Provider::Google).unwrap().unwrap();

        let outcome = services
            .store
            .store("user1", Provider::Google, grant("ya29.second", None))
            .await
            .unwrap();
        assert!(outcome.refresh_token_preserved);

        let after = records.get("user1", Provider::Google).unwrap().unwrap();
        assert_eq!(after.refresh_secret_ref, before.refresh_secret_ref);
        assert_ne!(after.access_secret_ref, before.access_secret_ref);
        assert_eq!(
            vault.resolve(&after.access_secret_ref).unwrap().unwrap().expose(),
            "ya29.second"
        );
        // Superseded access entry was released
        assert!(!vault.contains(&before.access_secret_ref).unwrap());
        assert_eq!(vault.len(), 2);
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_replaces_old_entry() {
        let (services, vault, records) = services_with(ProviderRegistry::new());
        services
            .store
            .store("user1", Provider::Slack, grant("a1", Some("r1")))
            .await
            .unwrap();
        let old_refresh = records
            .get("user1", Provider::Slack)
            .unwrap()
            .unwrap()
            .refresh_secret_ref
            .unwrap();

        services
            .store
            .store("user1", Provider::Slack, grant("a2", Some("r2")))
            .await
            .unwrap();

        let record = records.get("user1", Provider::Slack).unwrap().unwrap();
        let new_refresh = record.refresh_secret_ref.unwrap();
        assert_ne!(new_refresh, old_refresh);
        assert_eq!(vault.resolve(&new_refresh).unwrap().unwrap().expose(), "r2");
        assert!(!vault.contains(&old_refresh).unwrap());
    }

    #[tokio::test]
    async fn test_vault_failure_leaves_record_untouched() {
        let (services, vault, records) = services_with(ProviderRegistry::new());
        services
            .store
            .store("user1", Provider::Asana, grant("a1", Some("r1")))
            .await
            .unwrap();
        let before = records.get("user1", Provider::Asana).unwrap().unwrap();

        vault.set_read_only(true);
        let err = services
            .store
            .store("user1", Provider::Asana, grant("a2", Some("r2")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Vault(_)));

        let after = records.get("user1", Provider::Asana).unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(vault.len(), 2);
    }

    #[tokio::test]
    async fn test_default_lifetime_when_unstated() {
        let (services, _vault, _records) = services_with(ProviderRegistry::new());
        let mut g = grant("a", None);
        g.expires_in = None;

        let outcome = services.store.store("user1", Provider::Google, g).await.unwrap();

        let lifetime = outcome.expires_at - Utc::now();
        assert!(lifetime > Duration::minutes(59));
        assert!(lifetime <= Duration::hours(1));
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_uses_default() {
        let (services, vault, records) = services_with(ProviderRegistry::new());

        for expires_in in [i64::MAX, 1_000_000_000_000_000, super::MAX_LIFETIME_SECS + 1, -5] {
            let mut g = grant("a", None);
            g.expires_in = Some(expires_in);
            let outcome = services.store.store("user1", Provider::Google, g).await.unwrap();

            let lifetime = outcome.expires_at - Utc::now();
            assert!(lifetime > Duration::minutes(59), "expires_in = {}", expires_in);
            assert!(lifetime <= Duration::hours(1), "expires_in = {}", expires_in);
        }

        // Only the latest access entry is live
        assert_eq!(vault.len(), 1);
        assert!(records.get("user1", Provider::Google).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_year_long_lifetime_is_kept() {
        let (services, _vault, _records) = services_with(ProviderRegistry::new());
        let mut g = grant("a", None);
        g.expires_in = Some(super::MAX_LIFETIME_SECS);

        let outcome = services.store.store("user1", Provider::Slack, g).await.unwrap();

        assert!(outcome.expires_at - Utc::now() > Duration::days(364));
    }

    #[tokio::test]
    async fn test_empty_scopes_and_email_carry_forward() {
        let (services, _vault, records) = services_with(ProviderRegistry::new());
        services
            .store
            .store("user1", Provider::Google, grant("a", Some("r")))
            .await
            .unwrap();

        let mut bare = grant("b", None);
        bare.scopes.clear();
        bare.provider_email = None;
        let outcome = services.store.store("user1", Provider::Google, bare).await.unwrap();

        assert_eq!(outcome.provider_email.as_deref(), Some("user@example.com"));
        let record = records.get("user1", Provider::Google).unwrap().unwrap();
        assert!(record
            .scopes
            .contains("https://www.googleapis.com/auth/calendar"));
    }

    #[tokio::test]
    async fn test_concurrent_stores_never_drop_refresh_token() {
        let (services, vault, records) = services_with(ProviderRegistry::new());
        services
            .store
            .store("user1", Provider::Google, grant("a0", Some("r0")))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = services.store.clone();
            let refresh = if i % 2 == 0 { Some(format!("r{}", i + 1)) } else { None };
            handles.push(tokio::spawn(async move {
                let g = TokenGrant {
                    refresh_token: refresh.map(Into::into),
                    ..grant(&format!("a{}", i + 1), None)
                };
                store.store("user1", Provider::Google, g).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = records.get("user1", Provider::Google).unwrap().unwrap();
        let refresh_ref = record.refresh_secret_ref.expect("refresh token lost");
        assert!(vault.contains(&refresh_ref).unwrap());
        // Exactly one live access entry and one live refresh entry
        assert_eq!(vault.len(), 2);
    }
}

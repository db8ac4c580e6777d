//! Server-side credential removal.

use super::{KeyLocks, RecordStore};
use crate::error::DisconnectError;
use crate::provider::Provider;
use crate::vault::SecretVault;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Deletes a credential record and releases its vault entries.
pub struct DisconnectService {
    vault: Arc<dyn SecretVault>,
    records: Arc<RecordStore>,
    locks: Arc<KeyLocks>,
}

impl DisconnectService {
    pub fn new(vault: Arc<dyn SecretVault>, records: Arc<RecordStore>, locks: Arc<KeyLocks>) -> Self {
        Self {
            vault,
            records,
            locks,
        }
    }

    /// Removes the credential for a user and provider.
    ///
    /// Vault entries are released before the row is deleted, so a failure
    /// part-way leaves a row that already reads as disconnected and can be
    /// retried.
    ///
    /// # Returns
    /// * `Ok(true)` - Credential removed
    /// * `Ok(false)` - Nothing was stored
    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<bool, DisconnectError> {
        let _guard = self.locks.lock(user_id, provider).await;

        let record = self
            .records
            .get(user_id, provider)
            .map_err(|e| fail(user_id, provider, "Failed to read credential record", e))?;

        let Some(record) = record else {
            debug!(user_id = %user_id, provider = %provider, "Nothing to disconnect");
            return Ok(false);
        };

        for reference in std::iter::once(&record.access_secret_ref).chain(record.refresh_secret_ref.as_ref()) {
            self.vault
                .release(reference)
                .map_err(|e| fail(user_id, provider, "Failed to release vault entry", e))?;
        }

        self.records
            .delete(user_id, provider)
            .map_err(|e| fail(user_id, provider, "Failed to delete credential record", e))?;

        info!(user_id = %user_id, provider = %provider, "Provider disconnected");
        Ok(true)
    }
}

fn fail(user_id: &str, provider: Provider, what: &str, e: anyhow::Error) -> DisconnectError {
    error!(user_id = %user_id, provider = %provider, error = %e, "{}", what);
    DisconnectError::Failed(format!("{}: {:#}", what, e))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::services_with;
    use super::super::TokenGrant;
    use crate::provider::{Provider, ProviderRegistry};

    #[tokio::test]
    async fn test_disconnect_removes_record_and_secrets() {
        let (services, vault, records) = services_with(ProviderRegistry::new());
        let grant = TokenGrant {
            refresh_token: Some("r".into()),
            ..TokenGrant::new("a")
        };
        services.store.store("user1", Provider::Google, grant).await.unwrap();
        assert_eq!(vault.len(), 2);

        assert!(services.disconnect.disconnect("user1", Provider::Google).await.unwrap());

        assert!(records.get("user1", Provider::Google).unwrap().is_none());
        assert!(vault.is_empty());
        assert!(!services.status.status("user1", Provider::Google).connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (services, _vault, _records) = services_with(ProviderRegistry::new());
        assert!(!services.disconnect.disconnect("user1", Provider::Slack).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_other_providers_alone() {
        let (services, vault, _records) = services_with(ProviderRegistry::new());
        services.store.store("user1", Provider::Google, TokenGrant::new("g")).await.unwrap();
        services.store.store("user1", Provider::Slack, TokenGrant::new("s")).await.unwrap();

        services.disconnect.disconnect("user1", Provider::Google).await.unwrap();

        assert!(services.status.status("user1", Provider::Slack).connected);
        assert_eq!(vault.len(), 1);
    }
}

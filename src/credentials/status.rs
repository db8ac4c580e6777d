//! Read-only connection status.

use super::{CredentialRecord, RecordStore};
use crate::provider::Provider;
use crate::vault::SecretVault;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// What the UI needs to render a provider card.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }

    fn from_record(record: CredentialRecord) -> Self {
        Self {
            connected: true,
            provider_email: record.provider_email,
            scopes: Some(record.scopes.into_iter().collect()),
        }
    }
}

/// Combines the credential record with a vault probe.
///
/// A record only counts as connected if its access reference still resolves.
/// This catches half-applied writes (record present, vault entry gone).
pub struct ConnectionStateQuery {
    vault: Arc<dyn SecretVault>,
    records: Arc<RecordStore>,
}

impl ConnectionStateQuery {
    pub fn new(vault: Arc<dyn SecretVault>, records: Arc<RecordStore>) -> Self {
        Self { vault, records }
    }

    /// Status for one provider. Storage errors read as disconnected.
    pub fn status(&self, user_id: &str, provider: Provider) -> ConnectionStatus {
        match self.records.get(user_id, provider) {
            Ok(Some(record)) => self.evaluate(record),
            Ok(None) => ConnectionStatus::disconnected(),
            Err(e) => {
                warn!(user_id = %user_id, provider = %provider, error = %e, "Failed to read credential record");
                ConnectionStatus::disconnected()
            }
        }
    }

    /// Status for every known provider, in catalogue order.
    pub fn list(&self, user_id: &str) -> Vec<(Provider, ConnectionStatus)> {
        let mut records = match self.records.list_by_user(user_id) {
            Ok(records) => records,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to list credential records");
                Vec::new()
            }
        };

        Provider::ALL
            .iter()
            .map(|provider| {
                let status = records
                    .iter()
                    .position(|r| r.provider == *provider)
                    .map(|i| self.evaluate(records.swap_remove(i)))
                    .unwrap_or_default();
                (*provider, status)
            })
            .collect()
    }

    fn evaluate(&self, record: CredentialRecord) -> ConnectionStatus {
        if record.reauth_required {
            return ConnectionStatus::disconnected();
        }

        match self.vault.contains(&record.access_secret_ref) {
            Ok(true) => ConnectionStatus::from_record(record),
            Ok(false) => {
                warn!(
                    user_id = %record.user_id,
                    provider = %record.provider,
                    "Credential record points at a missing vault entry"
                );
                ConnectionStatus::disconnected()
            }
            Err(e) => {
                warn!(
                    user_id = %record.user_id,
                    provider = %record.provider,
                    error = %e,
                    "Vault probe failed"
                );
                ConnectionStatus::disconnected()
            }
        }
    }
}

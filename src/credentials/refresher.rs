//! Handing out usable access tokens, refreshing them on demand.
//!
//! Refresh is pull-based: it happens inside `get_valid_token` when the stored
//! token is inside the refresh buffer. Nothing polls expiry in the background.

use super::token_store::{ExpiryRule, TokenGrant, TokenStore};
use super::CredentialRecord;
use crate::error::{StorageError, TokenError};
use crate::provider::{Provider, ProviderRegistry};
use crate::vault::SecretString;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An access token that is good for at least the refresh buffer.
#[derive(Clone, Debug)]
pub struct ValidToken {
    pub access_token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub provider_email: Option<String>,
    /// True when this call performed a refresh
    pub refreshed: bool,
}

pub struct TokenRefresher {
    store: Arc<TokenStore>,
    providers: ProviderRegistry,
    refresh_buffer: Duration,
    refresh_timeout: std::time::Duration,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<TokenStore>,
        providers: ProviderRegistry,
        refresh_buffer: Duration,
        refresh_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            providers,
            refresh_buffer,
            refresh_timeout,
        }
    }

    /// Returns true if a token expiring at `expires_at` must be refreshed
    /// before use.
    pub fn needs_refresh(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at - now < self.refresh_buffer
    }

    /// Returns a usable access token, refreshing it first if it is inside the
    /// refresh buffer.
    ///
    /// `RefreshTokenMissing` and `RefreshFailed` are terminal: the record is
    /// flagged so status reports the provider as disconnected until the user
    /// logs in again.
    pub async fn get_valid_token(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<ValidToken, TokenError> {
        let _guard = self.store.locks().lock(user_id, provider).await;

        let record = self
            .store
            .records()
            .get(user_id, provider)
            .map_err(|e| StorageError::Record(format!("{:#}", e)))?
            .ok_or(TokenError::NotConnected)?;

        if record.reauth_required {
            debug!(user_id = %user_id, provider = %provider, "Credential awaiting re-authentication");
            return Err(TokenError::NotConnected);
        }

        if !self.needs_refresh(record.expires_at, Utc::now()) {
            let access_token = self
                .store
                .vault()
                .resolve(&record.access_secret_ref)
                .map_err(|e| StorageError::Vault(format!("{:#}", e)))?
                .ok_or_else(|| {
                    warn!(user_id = %user_id, provider = %provider, "Access token missing from vault");
                    TokenError::NotConnected
                })?;

            return Ok(ValidToken {
                access_token,
                expires_at: record.expires_at,
                provider_email: record.provider_email,
                refreshed: false,
            });
        }

        match self.refresh(&record).await {
            Ok(token) => Ok(token),
            Err(e) => {
                if e.kind().requires_reauth() {
                    self.downgrade(user_id, provider);
                }
                Err(e)
            }
        }
    }

    /// Caller must hold the record's key lock.
    async fn refresh(&self, record: &CredentialRecord) -> Result<ValidToken, TokenError> {
        let user_id = record.user_id.as_str();
        let provider = record.provider;

        let refresh_ref = record
            .refresh_secret_ref
            .as_ref()
            .ok_or(TokenError::RefreshTokenMissing)?;

        let refresh_token = self
            .store
            .vault()
            .resolve(refresh_ref)
            .map_err(|e| StorageError::Vault(format!("{:#}", e)))?
            .ok_or(TokenError::RefreshTokenMissing)?;

        let client = self.providers.get(provider).ok_or_else(|| {
            error!(provider = %provider, "Provider client not configured, cannot refresh");
            TokenError::RefreshFailed(format!("provider '{}' is not configured", provider))
        })?;

        info!(user_id = %user_id, provider = %provider, "Refreshing OAuth token");

        let tokens = tokio::time::timeout(self.refresh_timeout, client.refresh(&refresh_token))
            .await
            .map_err(|_| {
                warn!(user_id = %user_id, provider = %provider, "Token refresh timed out");
                TokenError::Timeout
            })?
            .map_err(|e| {
                error!(user_id = %user_id, provider = %provider, error = %e, "Token refresh failed");
                TokenError::RefreshFailed(e.to_string())
            })?;

        let access_token = tokens.access_token.clone();
        let grant = TokenGrant {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            scopes: tokens.scopes.unwrap_or_default(),
            expires_in: tokens.expires_in,
            provider_email: None,
        };

        let outcome =
            self.store
                .store_locked(user_id, provider, grant, ExpiryRule::NeverDecrease)?;

        info!(
            user_id = %user_id,
            provider = %provider,
            rotated = !outcome.refresh_token_preserved,
            "OAuth token refreshed successfully"
        );

        Ok(ValidToken {
            access_token,
            expires_at: outcome.expires_at,
            provider_email: outcome.provider_email,
            refreshed: true,
        })
    }

    fn downgrade(&self, user_id: &str, provider: Provider) {
        match self.store.records().mark_reauth_required(user_id, provider) {
            Ok(_) => {
                warn!(user_id = %user_id, provider = %provider, "Credential marked for re-authentication")
            }
            Err(e) => {
                error!(user_id = %user_id, provider = %provider, error = %e, "Failed to flag credential for re-authentication")
            }
        }
    }
}

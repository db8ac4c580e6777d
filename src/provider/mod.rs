//! Third-party account providers.
//!
//! Each [`Provider`] has a built-in OAuth 2.0 endpoint set which config may
//! override. Client credentials only ever come from the environment:
//! `KEYLINE_OAUTH_<PROVIDER>_CLIENT_ID` / `KEYLINE_OAUTH_<PROVIDER>_CLIENT_SECRET`.

mod http;

pub use http::HttpProviderClient;

use crate::config::ProviderOverride;
use crate::vault::SecretString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A third-party account integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Calendar and mail
    Google,
    /// Work management
    Asana,
    /// Messaging
    Slack,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Google, Provider::Asana, Provider::Slack];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Asana => "asana",
            Provider::Slack => "slack",
        }
    }

    pub(crate) fn env_prefix(self) -> String {
        format!("KEYLINE_OAUTH_{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Provider::Google),
            "asana" => Ok(Provider::Asana),
            "slack" => Ok(Provider::Slack),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// OAuth endpoints and client credentials for one provider.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub auth_url: String,
    pub token_url: String,
    /// Endpoint returning the account's profile (used for `provider_email`)
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: SecretString,
}

impl ProviderConfig {
    /// Built-in endpoints for `provider` combined with explicit client credentials.
    pub fn with_credentials(
        provider: Provider,
        client_id: impl Into<String>,
        client_secret: impl Into<SecretString>,
    ) -> Self {
        let (auth_url, token_url, userinfo_url, scopes): (&str, &str, &str, &[&str]) =
            match provider {
                Provider::Google => (
                    "https://accounts.google.com/o/oauth2/v2/auth",
                    "https://oauth2.googleapis.com/token",
                    "https://openidconnect.googleapis.com/v1/userinfo",
                    &[
                        "openid",
                        "email",
                        "https://www.googleapis.com/auth/calendar",
                        "https://www.googleapis.com/auth/gmail.modify",
                    ],
                ),
                Provider::Asana => (
                    "https://app.asana.com/-/oauth_authorize",
                    "https://app.asana.com/-/oauth_token",
                    "https://app.asana.com/api/1.0/users/me",
                    &["default"],
                ),
                Provider::Slack => (
                    "https://slack.com/openid/connect/authorize",
                    "https://slack.com/api/openid.connect.token",
                    "https://slack.com/api/openid.connect.userInfo",
                    &["openid", "email", "profile"],
                ),
            };

        Self {
            provider,
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            userinfo_url: userinfo_url.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Loads client credentials from the environment. Returns `None` when the
    /// provider is not configured for this deployment.
    pub fn from_env(provider: Provider, overrides: Option<&ProviderOverride>) -> Option<Self> {
        let prefix = provider.env_prefix();
        let client_id = std::env::var(format!("{}_CLIENT_ID", prefix)).ok()?;
        let client_secret = std::env::var(format!("{}_CLIENT_SECRET", prefix)).ok()?;

        let mut config = Self::with_credentials(provider, client_id, client_secret);
        if let Some(overrides) = overrides {
            config.apply(overrides);
        }
        Some(config)
    }

    pub fn apply(&mut self, overrides: &ProviderOverride) {
        if let Some(url) = &overrides.auth_url {
            self.auth_url = url.clone();
        }
        if let Some(url) = &overrides.token_url {
            self.token_url = url.clone();
        }
        if let Some(url) = &overrides.userinfo_url {
            self.userinfo_url = url.clone();
        }
        if let Some(scopes) = &overrides.scopes {
            self.scopes = scopes.clone();
        }
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        // Google only issues a refresh token when offline access is requested
        if self.provider == Provider::Google {
            url.push_str("&access_type=offline&prompt=consent");
        }
        url
    }
}

/// Tokens returned by a provider's token endpoint.
#[derive(Clone, Debug)]
pub struct ProviderTokens {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Lifetime of the access token in seconds, if the provider stated one
    pub expires_in: Option<i64>,
    /// Scopes actually granted, if the provider reported them
    pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered and said no (e.g. `invalid_grant`).
    #[error("provider rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider returned an unreadable response: {0}")]
    InvalidResponse(String),
}

/// Outbound calls to a provider's OAuth endpoints.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Consent page URL for the authorization code flow.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchanges an authorization code (`grant_type=authorization_code`).
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens, ProviderError>;

    /// Redeems a refresh token (`grant_type=refresh_token`).
    async fn refresh(&self, refresh_token: &SecretString) -> Result<ProviderTokens, ProviderError>;

    /// Looks up the account email for display.
    async fn fetch_email(
        &self,
        access_token: &SecretString,
    ) -> Result<Option<String>, ProviderError>;
}

/// Provider clients available to this deployment.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds HTTP clients for every provider with credentials in the environment.
    pub fn from_env(overrides: &HashMap<Provider, ProviderOverride>) -> Self {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            match ProviderConfig::from_env(provider, overrides.get(&provider)) {
                Some(config) => {
                    debug!(provider = %provider, token_url = %config.token_url, "Provider configured");
                    registry.insert(Arc::new(HttpProviderClient::new(config)));
                }
                None => {
                    warn!(
                        provider = %provider,
                        "Provider not configured (set {}_CLIENT_ID and {}_CLIENT_SECRET)",
                        provider.env_prefix(),
                        provider.env_prefix()
                    );
                }
            }
        }
        registry
    }

    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }
}

use crate::provider::Provider;
use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;

/// Complete keyline configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeylineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub disconnect: DisconnectConfig,
    /// Endpoint overrides keyed by provider name (`[providers.google]`)
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderOverride>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When false every request acts as the `default` user
    #[serde(default)]
    pub auth_enabled: bool,
    /// Public base URL used to build OAuth redirect URIs
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    #[serde(default = "default_oauth_state_expiry")]
    pub oauth_state_expiry_seconds: i64,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_oauth_state_expiry() -> i64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_enabled: false,
            callback_base_url: default_callback_base_url(),
            oauth_state_expiry_seconds: default_oauth_state_expiry(),
        }
    }
}

/// Where credential records and vault entries live
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub vault: VaultBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// AES-256-GCM sealed secrets in SQLite (requires KEYLINE_ENCRYPTION_KEY)
    #[default]
    Sqlite,
    /// Process memory only; secrets are lost on restart
    Memory,
}

fn default_database_path() -> String {
    "keyline.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            vault: VaultBackend::default(),
        }
    }
}

/// Access token lifetime policy
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Tokens closer than this to expiry are refreshed before use
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_seconds: i64,
    /// Lifetime assumed when the provider does not state one
    #[serde(default = "default_lifetime")]
    pub default_lifetime_seconds: i64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,
}

fn default_refresh_buffer() -> i64 {
    300
}

fn default_lifetime() -> i64 {
    3600
}

fn default_refresh_timeout() -> u64 {
    10
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_seconds: default_refresh_buffer(),
            default_lifetime_seconds: default_lifetime(),
            refresh_timeout_seconds: default_refresh_timeout(),
        }
    }
}

impl TokenConfig {
    pub fn refresh_buffer(&self) -> Duration {
        Duration::seconds(self.refresh_buffer_seconds)
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::seconds(self.default_lifetime_seconds)
    }

    pub fn refresh_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_timeout_seconds)
    }
}

/// Client-side capture deduplication windows
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// A second sign-in signal for the same provider inside this window is
    /// treated as a duplicate
    #[serde(default = "default_sign_in_window")]
    pub sign_in_window_seconds: i64,
    /// How long a processed authorization code stays marked
    #[serde(default = "default_code_marker_ttl")]
    pub code_marker_ttl_seconds: i64,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_seconds: u64,
}

fn default_sign_in_window() -> i64 {
    30
}

fn default_code_marker_ttl() -> i64 {
    60
}

fn default_exchange_timeout() -> u64 {
    10
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sign_in_window_seconds: default_sign_in_window(),
            code_marker_ttl_seconds: default_code_marker_ttl(),
            exchange_timeout_seconds: default_exchange_timeout(),
        }
    }
}

/// Client-side disconnect fail-safe
#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectConfig {
    #[serde(default = "default_fail_safe")]
    pub fail_safe_seconds: u64,
}

fn default_fail_safe() -> u64 {
    12
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        Self {
            fail_safe_seconds: default_fail_safe(),
        }
    }
}

/// Per-provider endpoint overrides. Client credentials are never read from
/// the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOverride {
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    pub scopes: Option<Vec<String>>,
}

impl KeylineConfig {
    /// Applies `KEYLINE_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("KEYLINE_BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("KEYLINE_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.server.auth_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("KEYLINE_CALLBACK_BASE_URL") {
            self.server.callback_base_url = v;
        }
        if let Ok(v) = std::env::var("KEYLINE_DATABASE_PATH") {
            self.storage.database_path = v;
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<KeylineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: KeylineConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KeylineConfig::default();
        assert_eq!(config.server.bind, "0.0.0.0:3000");
        assert!(!config.server.auth_enabled);
        assert_eq!(config.storage.vault, VaultBackend::Sqlite);
        assert_eq!(config.tokens.refresh_buffer(), Duration::minutes(5));
        assert_eq!(config.tokens.default_lifetime(), Duration::hours(1));
        assert_eq!(config.tokens.refresh_timeout_seconds, 10);
        assert_eq!(config.capture.sign_in_window_seconds, 30);
        assert_eq!(config.capture.exchange_timeout_seconds, 10);
        assert_eq!(config.disconnect.fail_safe_seconds, 12);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind = "127.0.0.1:8080"
            auth_enabled = true

            [storage]
            database_path = "/var/lib/keyline/creds.db"
            vault = "memory"

            [tokens]
            refresh_buffer_seconds = 120

            [disconnect]
            fail_safe_seconds = 5

            [providers.slack]
            token_url = "http://localhost:9000/token"
            scopes = ["openid", "email"]
        "#;

        let config: KeylineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.server.auth_enabled);
        assert_eq!(config.storage.vault, VaultBackend::Memory);
        assert_eq!(config.tokens.refresh_buffer_seconds, 120);
        assert_eq!(config.tokens.default_lifetime_seconds, 3600); // Default
        assert_eq!(config.disconnect.fail_safe_seconds, 5);

        let slack = &config.providers[&Provider::Slack];
        assert_eq!(slack.token_url.as_deref(), Some("http://localhost:9000/token"));
        assert!(slack.auth_url.is_none());
    }

    #[test]
    fn test_unknown_provider_section_is_rejected() {
        let toml = r#"
            [providers.myspace]
            token_url = "http://example.com"
        "#;
        assert!(toml::from_str::<KeylineConfig>(toml).is_err());
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [capture]
            sign_in_window_seconds = 10
        "#;

        let config: KeylineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.capture.sign_in_window_seconds, 10);
        assert_eq!(config.capture.code_marker_ttl_seconds, 60); // Default
        assert_eq!(config.server.oauth_state_expiry_seconds, 600); // Default
    }
}

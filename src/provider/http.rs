//! reqwest-based provider client.

use super::{Provider, ProviderClient, ProviderConfig, ProviderError, ProviderTokens};
use crate::vault::SecretString;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space-separated granted scopes
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for ProviderTokens {
    fn from(response: TokenResponse) -> Self {
        let scopes = response.scope.map(|s| {
            s.split(|c: char| c == ' ' || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        });

        Self {
            access_token: SecretString::from(response.access_token),
            // Some providers send "" instead of omitting the field
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            expires_in: response.expires_in,
            scopes,
        }
    }
}

/// Talks to a provider's token and userinfo endpoints over HTTPS.
pub struct HttpProviderClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn token_request(
        &self,
        mut form: HashMap<&'static str, String>,
    ) -> Result<ProviderTokens, ProviderError> {
        form.insert("client_id", self.config.client_id.clone());
        form.insert(
            "client_secret",
            self.config.client_secret.expose().to_string(),
        );

        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(ProviderError::Rejected { status, body });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        debug!(
            provider = %self.config.provider,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint call succeeded"
        );

        Ok(token_response.into())
    }
}

/// Pulls an email address out of a userinfo payload. Providers either put it
/// at the top level or wrap the profile in `data`.
fn extract_email(profile: &serde_json::Value) -> Option<String> {
    profile
        .get("email")
        .or_else(|| profile.get("data").and_then(|d| d.get("email")))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String {
        self.config.build_auth_url(state, redirect_uri)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens, ProviderError> {
        debug!(provider = %self.config.provider, "Exchanging authorization code for token");

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", redirect_uri.to_string());
        self.token_request(form).await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<ProviderTokens, ProviderError> {
        debug!(provider = %self.config.provider, "Redeeming refresh token");

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.expose().to_string());
        self.token_request(form).await
    }

    async fn fetch_email(
        &self,
        access_token: &SecretString,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token.expose())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected { status, body });
        }

        let profile: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(extract_email(&profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::Server) -> HttpProviderClient {
        let mut config = ProviderConfig::with_credentials(Provider::Google, "cid", "csecret");
        config.token_url = format!("{}/token", server.url());
        config.userinfo_url = format!("{}/userinfo", server.url());
        HttpProviderClient::new(config)
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "ya29.a0",
            "refresh_token": "1//0g",
            "expires_in": 3599,
            "scope": "openid email https://www.googleapis.com/auth/calendar",
            "token_type": "Bearer"
        }"#;

        let tokens: ProviderTokens = serde_json::from_str::<TokenResponse>(json).unwrap().into();
        assert_eq!(tokens.access_token.expose(), "ya29.a0");
        assert_eq!(tokens.refresh_token.unwrap().expose(), "1//0g");
        assert_eq!(tokens.expires_in, Some(3599));
        assert_eq!(tokens.scopes.unwrap().len(), 3);
    }

    #[test]
    fn test_token_response_minimal() {
        let json = r#"{"access_token": "token_12345", "refresh_token": ""}"#;
        let tokens: ProviderTokens = serde_json::from_str::<TokenResponse>(json).unwrap().into();
        assert_eq!(tokens.access_token.expose(), "token_12345");
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.expires_in.is_none());
        assert!(tokens.scopes.is_none());
    }

    #[test]
    fn test_extract_email_shapes() {
        let flat = serde_json::json!({"email": "a@example.com"});
        let nested = serde_json::json!({"data": {"gid": "1", "email": "b@example.com"}});
        let missing = serde_json::json!({"name": "c"});
        assert_eq!(extract_email(&flat).as_deref(), Some("a@example.com"));
        assert_eq!(extract_email(&nested).as_deref(), Some("b@example.com"));
        assert_eq!(extract_email(&missing), None);
    }

    #[tokio::test]
    async fn test_refresh_posts_refresh_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "1//old".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.new","expires_in":3600}"#)
            .create_async()
            .await;

        let tokens = client_for(&server)
            .refresh(&SecretString::new("1//old"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(tokens.access_token.expose(), "ya29.new");
        assert!(tokens.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_rejected_refresh_reports_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .refresh(&SecretString::new("revoked"))
            .await
            .unwrap_err();

        match err {
            ProviderError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_email_sends_bearer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/userinfo")
            .match_header("authorization", "Bearer ya29.abc")
            .with_status(200)
            .with_body(r#"{"sub":"1","email":"user@example.com"}"#)
            .create_async()
            .await;

        let email = client_for(&server)
            .fetch_email(&SecretString::new("ya29.abc"))
            .await
            .unwrap();
        assert_eq!(email.as_deref(), Some("user@example.com"));
    }
}

//! [`CredentialApi`] over the provider HTTP API.

use super::{CredentialApi, ProviderSession};
use crate::credentials::ConnectionStatus;
use crate::error::{ErrorKind, Failure};
use crate::provider::Provider;
use crate::vault::SecretString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct StoreTokensRequest<'a> {
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    scopes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct OperationResponse {
    success: bool,
    #[serde(default)]
    provider_email: Option<String>,
    #[serde(default)]
    error: Option<Failure>,
}

pub struct HttpCredentialApi {
    base_url: String,
    bearer: Option<SecretString>,
    http: reqwest::Client,
}

impl HttpCredentialApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: None,
            http: reqwest::Client::new(),
        }
    }

    /// Identifies the signed-in user to the backend.
    pub fn with_bearer(mut self, token: impl Into<SecretString>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, provider: Provider, suffix: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/providers/{}{}", self.base_url, provider, suffix);
        let builder = self.http.request(method, url);
        match &self.bearer {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }
}

/// Transport failure: `Timeout` when the request timed out, `kind` otherwise.
fn transport_failure(kind: ErrorKind, e: reqwest::Error) -> Failure {
    let kind = if e.is_timeout() { ErrorKind::Timeout } else { kind };
    Failure::new(kind, e.to_string())
}

async fn read_operation(
    response: reqwest::Response,
    fallback: ErrorKind,
) -> Result<OperationResponse, Failure> {
    let status = response.status();
    let body: OperationResponse = response.json().await.map_err(|e| {
        Failure::new(fallback, format!("unreadable response ({}): {}", status, e))
    })?;

    if body.success {
        Ok(body)
    } else {
        Err(body.error.unwrap_or_else(|| {
            Failure::new(fallback, format!("request failed with status {}", status))
        }))
    }
}

#[async_trait]
impl CredentialApi for HttpCredentialApi {
    async fn store(&self, provider: Provider, tokens: &ProviderSession) -> Result<Option<String>, Failure> {
        let access_token = tokens
            .provider_token
            .as_ref()
            .ok_or_else(|| Failure::new(ErrorKind::NoProviderTokenFound, "no provider token to store"))?;

        let body = StoreTokensRequest {
            access_token: access_token.expose(),
            refresh_token: tokens.provider_refresh_token.as_ref().map(SecretString::expose),
            scopes: &tokens.scopes,
            expires_in: tokens.expires_in,
        };

        let response = self
            .request(reqwest::Method::POST, provider, "/tokens")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_failure(ErrorKind::StorageFailed, e))?;

        Ok(read_operation(response, ErrorKind::StorageFailed)
            .await?
            .provider_email)
    }

    async fn disconnect(&self, provider: Provider) -> Result<(), Failure> {
        let response = self
            .request(reqwest::Method::DELETE, provider, "")
            .send()
            .await
            .map_err(|e| transport_failure(ErrorKind::DisconnectFailed, e))?;

        read_operation(response, ErrorKind::DisconnectFailed).await?;
        Ok(())
    }

    /// Failures the backend reports keep their kind. A backend that cannot be
    /// reached or read is `StorageFailed` (or `Timeout`): the stored state is
    /// unknown, which is not the same as "no token".
    async fn status(&self, provider: Provider) -> Result<ConnectionStatus, Failure> {
        let response = self
            .request(reqwest::Method::GET, provider, "/status")
            .send()
            .await
            .map_err(|e| transport_failure(ErrorKind::StorageFailed, e))?;

        if !response.status().is_success() {
            read_operation(response, ErrorKind::StorageFailed).await?;
            return Ok(ConnectionStatus::disconnected());
        }
        response
            .json()
            .await
            .map_err(|e| Failure::new(ErrorKind::StorageFailed, format!("unreadable status: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn google_session() -> ProviderSession {
        ProviderSession {
            provider: Provider::Google,
            provider_token: Some(SecretString::from("ya29.access")),
            provider_refresh_token: Some(SecretString::from("1//refresh")),
            scopes: vec!["email".to_string()],
            expires_in: Some(3599),
        }
    }

    #[tokio::test]
    async fn test_store_posts_tokens_with_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/providers/google/tokens")
            .match_header("authorization", "Bearer user-jwt")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "access_token": "ya29.access",
                "refresh_token": "1//refresh",
                "scopes": ["email"],
                "expires_in": 3599
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"provider_email":"a@example.com"}"#)
            .create_async()
            .await;

        let api = HttpCredentialApi::new(server.url()).with_bearer("user-jwt");
        let email = api.store(Provider::Google, &google_session()).await.unwrap();

        assert_eq!(email.as_deref(), Some("a@example.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_store_failure_is_tagged() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/providers/google/tokens")
            .with_status(500)
            .with_body(r#"{"success":false,"error":{"kind":"StorageFailed","message":"vault down"}}"#)
            .create_async()
            .await;

        let api = HttpCredentialApi::new(server.url());
        let failure = api.store(Provider::Google, &google_session()).await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::StorageFailed);
        assert_eq!(failure.message, "vault down");
    }

    #[tokio::test]
    async fn test_disconnect_and_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/api/providers/slack")
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/providers/slack/status")
            .with_status(200)
            .with_body(r#"{"connected":false}"#)
            .create_async()
            .await;

        let api = HttpCredentialApi::new(format!("{}/", server.url()));
        api.disconnect(Provider::Slack).await.unwrap();
        assert_eq!(
            api.status(Provider::Slack).await.unwrap(),
            ConnectionStatus::disconnected()
        );
    }

    #[tokio::test]
    async fn test_backend_failure_kinds_survive() {
        let mut server = mockito::Server::new_async().await;
        let unauthenticated =
            r#"{"success":false,"error":{"kind":"NoAuthenticatedUser","message":"Authorization token not provided"}}"#;
        server
            .mock("DELETE", "/api/providers/asana")
            .with_status(401)
            .with_body(unauthenticated)
            .create_async()
            .await;
        server
            .mock("GET", "/api/providers/asana/status")
            .with_status(401)
            .with_body(unauthenticated)
            .create_async()
            .await;

        let api = HttpCredentialApi::new(server.url());
        let failure = api.disconnect(Provider::Asana).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::NoAuthenticatedUser);
        let failure = api.status(Provider::Asana).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::NoAuthenticatedUser);
    }

    #[tokio::test]
    async fn test_unreadable_status_is_not_reported_as_missing_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/providers/google/status")
            .with_status(200)
            .with_body("<html>proxy error</html>")
            .create_async()
            .await;

        let api = HttpCredentialApi::new(server.url());
        let failure = api.status(Provider::Google).await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::StorageFailed);
    }
}

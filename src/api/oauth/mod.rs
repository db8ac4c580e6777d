//! Server-side OAuth 2.0 authorization code flow.
//!
//! 1. GET /api/providers/:provider/oauth/start → redirect to provider
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /api/providers/:provider/oauth/callback
//! 4. Exchange code for tokens and store them through the token store
//!
//! The state parameter is single-use, so a replayed callback cannot store the
//! same login twice.

mod state_manager;

pub use state_manager::{run_state_cleanup, StateEntry, StateManager};

use super::error::{parse_provider, AppError};
use super::lookup_email;
use crate::auth::resolve_user;
use crate::credentials::{CredentialServices, TokenGrant};
use crate::error::{ErrorKind, Failure};
use crate::provider::{Provider, ProviderRegistry};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub services: CredentialServices,
    pub providers: ProviderRegistry,
    pub state_manager: StateManager,
    pub auth_enabled: bool,
    pub callback_base_url: String,
    pub exchange_timeout: Duration,
}

impl OAuthAppState {
    fn redirect_uri(&self, provider: Provider) -> String {
        format!(
            "{}/api/providers/{}/oauth/callback",
            self.callback_base_url.trim_end_matches('/'),
            provider
        )
    }
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth success response
#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    success: bool,
    message: String,
    provider: Provider,
    provider_email: Option<String>,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/providers/:provider/oauth/start", get(oauth_start))
        .route("/api/providers/:provider/oauth/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

/// GET /api/providers/:provider/oauth/start
///
/// Redirects the user to the provider's consent page with a fresh CSRF state.
async fn oauth_start(
    State(state): State<Arc<OAuthAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let provider = parse_provider(&name).map_err(|f| AppError::NotFound(f.message))?;
    let user_id = resolve_user(&headers, state.auth_enabled)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

    let client = state.providers.get(provider).ok_or_else(|| {
        error!(provider = %provider, "OAuth client not configured (missing env vars?)");
        AppError::ServerError(format!(
            "OAuth not configured for provider '{}'. Set {}_CLIENT_ID and {}_CLIENT_SECRET environment variables.",
            provider,
            provider.env_prefix(),
            provider.env_prefix()
        ))
    })?;

    let csrf_state = state.state_manager.create_state(provider, &user_id);
    let auth_url = client.authorization_url(&csrf_state, &state.redirect_uri(provider));

    info!(provider = %provider, user_id = %user_id, "Redirecting to OAuth provider");

    Ok(Redirect::temporary(&auth_url))
}

/// GET /api/providers/:provider/oauth/callback
///
/// Exchanges the authorization code and stores the resulting tokens for the
/// user who started the flow.
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Path(name): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    let provider = parse_provider(&name).map_err(|f| AppError::NotFound(f.message))?;
    debug!(provider = %provider, "OAuth callback received");

    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            provider = %provider,
            error = %error,
            description = %description,
            "OAuth authorization failed"
        );
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let entry = state
        .state_manager
        .validate_and_consume(&csrf_state)
        .ok_or_else(|| {
            warn!(provider = %provider, "Invalid or expired OAuth state");
            AppError::Unauthorized("Invalid or expired OAuth state (possible CSRF attack)".to_string())
        })?;

    if entry.provider != provider {
        error!(expected = %entry.provider, actual = %provider, "Provider mismatch");
        return Err(AppError::BadRequest("Provider mismatch".to_string()));
    }
    let user_id = entry.user_id;

    let client = state.providers.get(provider).ok_or_else(|| {
        error!(provider = %provider, "OAuth client not configured");
        AppError::ServerError(format!("OAuth not configured for provider '{}'", provider))
    })?;

    debug!(provider = %provider, "Exchanging authorization code");
    let exchanged = tokio::time::timeout(
        state.exchange_timeout,
        client.exchange_code(&code, &state.redirect_uri(provider)),
    )
    .await;
    let tokens = match exchanged {
        Ok(Ok(tokens)) => tokens,
        Ok(Err(e)) => {
            error!(provider = %provider, error = %e, "Token exchange failed");
            return Err(AppError::Operation(Failure::new(
                ErrorKind::CodeExchangeFailed,
                format!("Failed to exchange authorization code: {}", e),
            )));
        }
        Err(_) => {
            error!(provider = %provider, "Token exchange timed out");
            return Err(AppError::Operation(Failure::new(
                ErrorKind::Timeout,
                "Token exchange did not complete in time",
            )));
        }
    };

    let provider_email = lookup_email(&state.providers, provider, &tokens.access_token).await;
    let has_refresh_token = tokens.refresh_token.is_some();
    let grant = TokenGrant {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        scopes: tokens.scopes.unwrap_or_default(),
        expires_in: tokens.expires_in,
        provider_email,
    };

    let outcome = state
        .services
        .store
        .store(&user_id, provider, grant)
        .await
        .map_err(|e| {
            error!(provider = %provider, user_id = %user_id, error = %e, "Failed to store credentials");
            AppError::Operation(Failure::from(&e))
        })?;

    info!(
        provider = %provider,
        user_id = %user_id,
        has_refresh_token,
        "OAuth flow completed successfully"
    );

    Ok(Json(OAuthSuccessResponse {
        success: true,
        message: format!("Successfully connected {}", provider),
        provider,
        provider_email: outcome.provider_email,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        let query = "code=auth_code_123&state=csrf_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("csrf_state_456".to_string()));
        assert_eq!(callback.error, None);

        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_oauth_success_response_serialization() {
        let response = OAuthSuccessResponse {
            success: true,
            message: "Successfully connected slack".to_string(),
            provider: Provider::Slack,
            provider_email: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"provider\":\"slack\""));
    }
}

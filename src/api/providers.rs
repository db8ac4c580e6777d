//! Provider credential endpoints.
//!
//! Every route acts on the calling user's own credentials; the user comes from
//! the bearer token (or is the default user when auth is disabled).

use super::error::{parse_provider, AppError};
use super::lookup_email;
use crate::auth::resolve_user;
use crate::credentials::{ConnectionStatus, CredentialServices, TokenGrant};
use crate::error::{ErrorKind, Failure};
use crate::provider::{Provider, ProviderRegistry};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
mod tests;

/// Shared application state for provider API
#[derive(Clone)]
pub struct ProviderAppState {
    pub services: CredentialServices,
    pub providers: ProviderRegistry,
    pub auth_enabled: bool,
}

/// Response for POST /api/providers/:provider/tokens
#[derive(Serialize, Debug)]
pub struct StoreTokensResponse {
    pub success: bool,
    pub provider_email: Option<String>,
}

/// Response for GET /api/providers/:provider/token
#[derive(Serialize)]
pub struct AccessTokenResponse {
    pub connected: bool,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,
}

/// Response for DELETE /api/providers/:provider
#[derive(Serialize, Debug)]
pub struct DisconnectResponse {
    pub success: bool,
    /// False when there was nothing to remove
    pub removed: bool,
}

/// One entry of the list endpoint
#[derive(Serialize, Debug, PartialEq)]
pub struct ProviderSummary {
    pub provider: Provider,
    /// OAuth client credentials are present for the server-side flow
    pub oauth_configured: bool,
    #[serde(flatten)]
    pub status: ConnectionStatus,
}

#[derive(Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderSummary>,
}

/// Create provider API router
pub fn create_provider_router(state: ProviderAppState) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/:provider", delete(disconnect_provider))
        .route("/api/providers/:provider/tokens", post(store_tokens))
        .route("/api/providers/:provider/token", get(get_token))
        .route("/api/providers/:provider/status", get(get_status))
        .with_state(Arc::new(state))
}

/// POST /api/providers/:provider/tokens
///
/// Stores tokens captured after a provider login. An omitted refresh token
/// keeps the one already on file.
async fn store_tokens(
    State(state): State<Arc<ProviderAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(mut grant): Json<TokenGrant>,
) -> Result<Json<StoreTokensResponse>, AppError> {
    let provider = parse_provider(&name).map_err(AppError::Operation)?;
    let user_id = resolve_user(&headers, state.auth_enabled).map_err(AppError::unauthenticated)?;

    if grant.access_token.is_empty() {
        return Err(AppError::Operation(Failure::new(
            ErrorKind::NoProviderTokenFound,
            "access_token is empty",
        )));
    }

    debug!(
        user_id = %user_id,
        provider = %provider,
        has_refresh_token = grant.refresh_token.is_some(),
        "Storing provider tokens"
    );

    if grant.provider_email.is_none() {
        grant.provider_email = lookup_email(&state.providers, provider, &grant.access_token).await;
    }

    let outcome = state
        .services
        .store
        .store(&user_id, provider, grant)
        .await
        .map_err(|e| AppError::Operation(Failure::from(&e)))?;

    info!(
        user_id = %user_id,
        provider = %provider,
        refresh_token_preserved = outcome.refresh_token_preserved,
        "Provider tokens stored"
    );

    Ok(Json(StoreTokensResponse {
        success: true,
        provider_email: outcome.provider_email,
    }))
}

/// GET /api/providers/:provider/token
///
/// Returns an access token good for at least the refresh buffer, refreshing
/// it first if needed.
async fn get_token(
    State(state): State<Arc<ProviderAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AccessTokenResponse>, AppError> {
    let provider = parse_provider(&name).map_err(AppError::TokenUnavailable)?;
    let user_id = resolve_user(&headers, state.auth_enabled).map_err(|e| {
        AppError::TokenUnavailable(Failure::new(ErrorKind::NoAuthenticatedUser, e.to_string()))
    })?;

    let token = state
        .services
        .refresher
        .get_valid_token(&user_id, provider)
        .await
        .map_err(|e| AppError::TokenUnavailable(Failure::from(&e)))?;

    Ok(Json(AccessTokenResponse {
        connected: true,
        access_token: token.access_token.expose().to_string(),
        expires_at: token.expires_at,
        provider_email: token.provider_email,
    }))
}

/// GET /api/providers/:provider/status
async fn get_status(
    State(state): State<Arc<ProviderAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ConnectionStatus>, AppError> {
    let provider = parse_provider(&name).map_err(AppError::Operation)?;
    let user_id = resolve_user(&headers, state.auth_enabled).map_err(AppError::unauthenticated)?;

    Ok(Json(state.services.status.status(&user_id, provider)))
}

/// GET /api/providers
async fn list_providers(
    State(state): State<Arc<ProviderAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListProvidersResponse>, AppError> {
    let user_id = resolve_user(&headers, state.auth_enabled).map_err(AppError::unauthenticated)?;

    let providers = state
        .services
        .status
        .list(&user_id)
        .into_iter()
        .map(|(provider, status)| ProviderSummary {
            provider,
            oauth_configured: state.providers.get(provider).is_some(),
            status,
        })
        .collect();

    Ok(Json(ListProvidersResponse { providers }))
}

/// DELETE /api/providers/:provider
///
/// Removes the stored credential. Disconnecting a provider that is not
/// connected succeeds with `removed: false`.
async fn disconnect_provider(
    State(state): State<Arc<ProviderAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let provider = parse_provider(&name).map_err(AppError::Operation)?;
    let user_id = resolve_user(&headers, state.auth_enabled).map_err(AppError::unauthenticated)?;

    let removed = state
        .services
        .disconnect
        .disconnect(&user_id, provider)
        .await
        .map_err(|e| AppError::Operation(Failure::from(&e)))?;

    Ok(Json(DisconnectResponse {
        success: true,
        removed,
    }))
}

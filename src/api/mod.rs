//! HTTP API for the credential services.

mod error;
pub mod oauth;
pub mod providers;

pub use oauth::{create_oauth_router, run_state_cleanup, OAuthAppState, StateManager};
pub use providers::{create_provider_router, ProviderAppState};

use crate::provider::{Provider, ProviderRegistry};
use crate::vault::SecretString;
use std::time::Duration;
use tracing::{debug, warn};

const EMAIL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort account email lookup. Failures are logged and ignored.
pub(crate) async fn lookup_email(
    providers: &ProviderRegistry,
    provider: Provider,
    access_token: &SecretString,
) -> Option<String> {
    let client = providers.get(provider)?;
    match tokio::time::timeout(EMAIL_LOOKUP_TIMEOUT, client.fetch_email(access_token)).await {
        Ok(Ok(email)) => email,
        Ok(Err(e)) => {
            warn!(provider = %provider, error = %e, "Account email lookup failed");
            None
        }
        Err(_) => {
            debug!(provider = %provider, "Account email lookup timed out");
            None
        }
    }
}

//! Exactly-once capture of provider tokens after a redirect.
//!
//! Two signals can carry the same login: the authorization `code` on the
//! landing URL, and the auth layer's sign-in notification. Either may fire
//! more than once (reloads, re-mounts, duplicate events). The coordinator
//! forwards each login to the token store once and drops the rest.

use super::session::{CaptureGuard, CapturePhase, CaptureSession};
use super::{CaptureNotice, ClientEvent, CredentialApi};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, ErrorKind, Failure};
use crate::provider::Provider;
use crate::vault::SecretString;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

/// Provider tokens surfaced by the hosting auth layer after sign-in.
#[derive(Clone, Debug)]
pub struct ProviderSession {
    pub provider: Provider,
    pub provider_token: Option<SecretString>,
    pub provider_refresh_token: Option<SecretString>,
    pub scopes: Vec<String>,
    pub expires_in: Option<i64>,
}

/// The hosting auth layer's code exchange.
#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn exchange_code_for_session(&self, code: &str) -> Result<ProviderSession, CaptureError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Nothing to capture in this signal.
    NoArtifact,
    /// This login was already captured.
    Duplicate,
    /// Another capture was running; the signal was dropped.
    Busy,
    Stored {
        provider: Provider,
        provider_email: Option<String>,
    },
    Failed(CaptureError),
}

/// Removes `code` and `state` from the landing URL and returns the code.
///
/// The URL is left untouched when it carries no code.
pub fn take_authorization_code(location: &mut Url) -> Option<String> {
    let mut code = None;
    let retained: Vec<(String, String)> = location
        .query_pairs()
        .filter_map(|(key, value)| match key.as_ref() {
            "code" => {
                code = Some(value.into_owned());
                None
            }
            "state" => None,
            _ => Some((key.into_owned(), value.into_owned())),
        })
        .collect();

    let code = code.filter(|c| !c.is_empty())?;
    if retained.is_empty() {
        location.set_query(None);
    } else {
        location.query_pairs_mut().clear().extend_pairs(retained);
    }
    Some(code)
}

pub struct TokenCaptureCoordinator {
    session: Arc<CaptureSession>,
    auth: Arc<dyn AuthSession>,
    api: Arc<dyn CredentialApi>,
    events: broadcast::Sender<ClientEvent>,
    exchange_timeout: Duration,
}

impl TokenCaptureCoordinator {
    pub fn new(
        session: Arc<CaptureSession>,
        auth: Arc<dyn AuthSession>,
        api: Arc<dyn CredentialApi>,
        config: &CaptureConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session,
            auth,
            api,
            events,
            exchange_timeout: Duration::from_secs(config.exchange_timeout_seconds),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Arc<CaptureSession> {
        &self.session
    }

    /// Handles the landing URL. The code is stripped from `location` before
    /// anything else happens.
    ///
    /// Returns [`CaptureOutcome::NoArtifact`] when there is no code; the shell
    /// should then feed sign-in notifications through [`Self::listen`].
    pub async fn handle_page_load(&self, location: &mut Url) -> CaptureOutcome {
        self.session.purge_expired();
        let Some(code) = take_authorization_code(location) else {
            return CaptureOutcome::NoArtifact;
        };

        let Some(guard) = self.session.try_begin() else {
            debug!("Capture already in flight, dropping authorization code");
            return CaptureOutcome::Busy;
        };
        if !self.session.claim_code(&code) {
            debug!("Authorization code already processed");
            return CaptureOutcome::Duplicate;
        }
        guard.start();

        let exchanged =
            tokio::time::timeout(self.exchange_timeout, self.auth.exchange_code_for_session(&code))
                .await;
        let provider_session = match exchanged {
            Ok(Ok(provider_session)) => provider_session,
            Ok(Err(e)) => {
                self.session.release_code(&code);
                return self.fail(guard, None, e);
            }
            Err(_) => {
                self.session.release_code(&code);
                return self.fail(guard, None, CaptureError::Timeout);
            }
        };

        if provider_session.provider_token.is_none() {
            return self.fail(
                guard,
                Some(provider_session.provider),
                CaptureError::NoProviderTokenFound,
            );
        }
        self.forward(guard, provider_session).await
    }

    /// Handles one sign-in notification from the auth layer.
    pub async fn handle_sign_in(&self, signal: ProviderSession) -> CaptureOutcome {
        if signal.provider_token.is_none() {
            return CaptureOutcome::NoArtifact;
        }
        let Some(guard) = self.session.try_begin() else {
            debug!(provider = %signal.provider, "Capture already in flight, dropping sign-in");
            return CaptureOutcome::Busy;
        };
        if self.session.recently_captured(signal.provider) {
            debug!(provider = %signal.provider, "Sign-in already captured inside window");
            return CaptureOutcome::Duplicate;
        }
        guard.start();
        self.forward(guard, signal).await
    }

    /// Feeds sign-in notifications to [`Self::handle_sign_in`] until the
    /// channel closes. Signals are handled concurrently so overlaps are
    /// dropped rather than queued.
    pub async fn listen(self: Arc<Self>, mut signals: mpsc::Receiver<ProviderSession>) {
        while let Some(signal) = signals.recv().await {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                coordinator.handle_sign_in(signal).await;
            });
        }
    }

    async fn forward(&self, guard: CaptureGuard<'_>, tokens: ProviderSession) -> CaptureOutcome {
        let provider = tokens.provider;
        let stored = tokio::time::timeout(self.exchange_timeout, self.api.store(provider, &tokens)).await;

        match stored {
            Ok(Ok(provider_email)) => {
                self.session.mark_captured(provider);
                guard.finish(CapturePhase::Stored { provider });
                info!(provider = %provider, "Provider credentials captured");
                let _ = self.events.send(ClientEvent::ProviderConnected {
                    provider,
                    provider_email: provider_email.clone(),
                });
                CaptureOutcome::Stored {
                    provider,
                    provider_email,
                }
            }
            Ok(Err(failure)) => self.fail(guard, Some(provider), store_failure(failure)),
            Err(_) => self.fail(
                guard,
                Some(provider),
                CaptureError::StorageFailed("credential store did not respond".to_string()),
            ),
        }
    }

    fn fail(
        &self,
        guard: CaptureGuard<'_>,
        provider: Option<Provider>,
        error: CaptureError,
    ) -> CaptureOutcome {
        let name = provider
            .map(|p| p.to_string())
            .unwrap_or_else(|| "the provider".to_string());

        let notice = if error.is_unsaved_login() {
            warn!(provider = %name, error = %error, "Login succeeded but credentials were not saved");
            CaptureNotice::NotSaved(format!(
                "You signed in to {}, but your credentials could not be saved. Please connect again.",
                name
            ))
        } else {
            warn!(provider = %name, error = %error, "Provider login failed");
            CaptureNotice::LoginFailed(format!("Login with {} could not be completed: {}", name, error))
        };

        guard.finish(CapturePhase::Failed { provider });
        let _ = self.events.send(ClientEvent::CaptureFailed { provider, notice });
        CaptureOutcome::Failed(error)
    }
}

fn store_failure(failure: Failure) -> CaptureError {
    match failure.kind {
        ErrorKind::NoAuthenticatedUser => CaptureError::NoAuthenticatedUser,
        _ => CaptureError::StorageFailed(failure.message),
    }
}

//! Disconnect with a fail-safe so the UI never stays in "disconnecting".

use super::session::SessionStorage;
use super::{ClientEvent, CredentialApi};
use crate::config::DisconnectConfig;
use crate::error::{DisconnectError, Failure};
use crate::provider::Provider;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// What a call to [`DisconnectCoordinator::disconnect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The backend removed the credential.
    Disconnected,
    /// A disconnect for this provider is already running. Nothing was sent.
    AlreadyInProgress,
}

fn flag_key(provider: Provider) -> String {
    format!("disconnect:in_progress:{}", provider)
}

pub struct DisconnectCoordinator {
    api: Arc<dyn CredentialApi>,
    storage: Arc<dyn SessionStorage>,
    in_progress: watch::Sender<BTreeSet<Provider>>,
    events: broadcast::Sender<ClientEvent>,
    fail_safe: Duration,
}

/// Clears the in-progress flag however the attempt ends.
struct InProgress<'a> {
    coordinator: &'a DisconnectCoordinator,
    provider: Provider,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.coordinator.clear_flag(self.provider);
    }
}

impl DisconnectCoordinator {
    pub fn new(
        api: Arc<dyn CredentialApi>,
        storage: Arc<dyn SessionStorage>,
        config: &DisconnectConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let coordinator = Self {
            api,
            storage,
            in_progress: watch::channel(BTreeSet::new()).0,
            events,
            fail_safe: Duration::from_secs(config.fail_safe_seconds),
        };
        // One coordinator per page load
        coordinator.on_page_load();
        coordinator
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<Provider>> {
        self.in_progress.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_disconnecting(&self, provider: Provider) -> bool {
        self.storage.get(&flag_key(provider)).is_some()
    }

    /// Clears every in-progress flag. A previous page may have been closed
    /// mid-disconnect.
    pub fn on_page_load(&self) {
        for provider in Provider::ALL {
            self.storage.remove(&flag_key(provider));
        }
        self.in_progress.send_replace(BTreeSet::new());
    }

    /// Disconnects `provider`.
    ///
    /// Returns [`DisconnectError::Timeout`] once the fail-safe elapses; the
    /// backend call keeps running in the background and its result is
    /// ignored. A second call while one is in progress returns
    /// [`DisconnectOutcome::AlreadyInProgress`] without calling the backend.
    pub async fn disconnect(&self, provider: Provider) -> Result<DisconnectOutcome, DisconnectError> {
        if self.is_disconnecting(provider) {
            debug!(provider = %provider, "Disconnect already in progress");
            return Ok(DisconnectOutcome::AlreadyInProgress);
        }
        let _flag = self.set_flag(provider);

        let api = Arc::clone(&self.api);
        let call = tokio::spawn(async move { api.disconnect(provider).await });

        let result = tokio::select! {
            joined = call => match joined {
                Ok(Ok(())) => Ok(DisconnectOutcome::Disconnected),
                Ok(Err(failure)) => Err(DisconnectError::Rejected(failure)),
                Err(e) => Err(DisconnectError::Failed(e.to_string())),
            },
            _ = tokio::time::sleep(self.fail_safe) => {
                warn!(provider = %provider, "Disconnect fail-safe elapsed, clearing in-progress state");
                Err(DisconnectError::Timeout)
            }
        };

        match &result {
            Ok(_) => {
                info!(provider = %provider, "Provider disconnected");
                let _ = self.events.send(ClientEvent::ProviderDisconnected { provider });
            }
            Err(e) => {
                warn!(provider = %provider, error = %e, "Disconnect failed");
                let _ = self.events.send(ClientEvent::DisconnectFailed {
                    provider,
                    failure: Failure::from(e),
                });
            }
        }
        result
    }

    fn set_flag(&self, provider: Provider) -> InProgress<'_> {
        self.storage.set(&flag_key(provider), Utc::now());
        self.in_progress.send_modify(|set| {
            set.insert(provider);
        });
        InProgress {
            coordinator: self,
            provider,
        }
    }

    fn clear_flag(&self, provider: Provider) {
        self.storage.remove(&flag_key(provider));
        self.in_progress.send_if_modified(|set| set.remove(&provider));
    }
}

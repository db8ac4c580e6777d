//! Client-side coordination: turning redirect artifacts into exactly one
//! stored credential, and disconnecting without ever leaving the UI stuck.
//!
//! These types run in the application shell, on the untrusted side of the
//! boundary. They hand transient provider tokens straight to the backend and
//! never persist them; the only thing written to [`SessionStorage`] is marker
//! keys and timestamps.

mod capture;
mod disconnect;
mod http;
mod session;

pub use capture::{
    take_authorization_code, AuthSession, CaptureOutcome, ProviderSession, TokenCaptureCoordinator,
};
pub use disconnect::{DisconnectCoordinator, DisconnectOutcome};
pub use http::HttpCredentialApi;
pub use session::{CaptureGuard, CapturePhase, CaptureSession, MemorySessionStorage, SessionStorage};

use crate::credentials::ConnectionStatus;
use crate::error::Failure;
use crate::provider::Provider;
use async_trait::async_trait;
use serde::Serialize;

/// Backend operations the client coordinators need.
///
/// Results are tagged `{kind, message}` failures because they cross the wire.
#[async_trait]
pub trait CredentialApi: Send + Sync {
    /// Forwards freshly captured tokens to the token store. Returns the
    /// provider account email, if known.
    async fn store(&self, provider: Provider, tokens: &ProviderSession) -> Result<Option<String>, Failure>;

    async fn disconnect(&self, provider: Provider) -> Result<(), Failure>;

    async fn status(&self, provider: Provider) -> Result<ConnectionStatus, Failure>;
}

/// Notifications for interested UI components.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ProviderConnected {
        provider: Provider,
        provider_email: Option<String>,
    },
    CaptureFailed {
        provider: Option<Provider>,
        notice: CaptureNotice,
    },
    ProviderDisconnected {
        provider: Provider,
    },
    DisconnectFailed {
        provider: Provider,
        failure: Failure,
    },
}

/// User-visible capture failure. `NotSaved` is the dangerous one: the user
/// finished the provider login and believes they are connected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "severity", content = "message", rename_all = "snake_case")]
pub enum CaptureNotice {
    LoginFailed(String),
    NotSaved(String),
}

impl CaptureNotice {
    pub fn message(&self) -> &str {
        match self {
            CaptureNotice::LoginFailed(m) | CaptureNotice::NotSaved(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ClientEvent::CaptureFailed {
            provider: Some(Provider::Slack),
            notice: CaptureNotice::NotSaved("try again".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "capture_failed");
        assert_eq!(json["provider"], "slack");
        assert_eq!(json["notice"]["severity"], "not_saved");
        assert_eq!(json["notice"]["message"], "try again");
    }
}

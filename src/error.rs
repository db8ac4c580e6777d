//! Error taxonomy for credential operations.
//!
//! Each operation has its own error enum so callers match exhaustively on what
//! that operation can actually produce. All of them collapse onto
//! [`ErrorKind`], which is what crosses the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoAuthenticatedUser,
    NoProviderTokenFound,
    CodeExchangeFailed,
    StorageFailed,
    RefreshTokenMissing,
    RefreshFailed,
    DisconnectFailed,
    Timeout,
}

impl ErrorKind {
    /// True for failures after which the stored token can never be used again
    /// without a fresh login.
    pub fn requires_reauth(self) -> bool {
        matches!(self, ErrorKind::RefreshTokenMissing | ErrorKind::RefreshFailed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Serializable `{kind, message}` pair used in failure payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Failure to persist a credential.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The vault refused the write. Nothing was applied to the record.
    #[error("vault write failed: {0}")]
    Vault(String),

    /// The credential record could not be read or written.
    #[error("credential record update failed: {0}")]
    Record(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageFailed
    }
}

/// Failure to hand out a usable access token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("no stored credential for this provider")]
    NotConnected,

    #[error("access token expired and no refresh token is stored; re-authentication required")]
    RefreshTokenMissing,

    #[error("provider rejected the refresh token: {0}")]
    RefreshFailed(String),

    #[error("token refresh timed out")]
    Timeout,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::NotConnected => ErrorKind::NoProviderTokenFound,
            TokenError::RefreshTokenMissing => ErrorKind::RefreshTokenMissing,
            TokenError::RefreshFailed(_) => ErrorKind::RefreshFailed,
            TokenError::Timeout => ErrorKind::Timeout,
            TokenError::Storage(e) => e.kind(),
        }
    }
}

/// Failure to remove a credential.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisconnectError {
    #[error("disconnect failed: {0}")]
    Failed(String),

    /// The backend answered with its own failure, e.g. `NoAuthenticatedUser`.
    #[error("disconnect rejected: {}", .0.message)]
    Rejected(Failure),

    #[error("disconnect did not finish in time")]
    Timeout,
}

impl DisconnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DisconnectError::Failed(_) => ErrorKind::DisconnectFailed,
            DisconnectError::Rejected(failure) => failure.kind,
            DisconnectError::Timeout => ErrorKind::Timeout,
        }
    }
}

impl From<&DisconnectError> for Failure {
    fn from(e: &DisconnectError) -> Self {
        match e {
            DisconnectError::Rejected(failure) => failure.clone(),
            other => Failure::new(other.kind(), other.to_string()),
        }
    }
}

/// Failure while turning a redirect artifact into a stored credential.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no authenticated user")]
    NoAuthenticatedUser,

    #[error("sign-in completed without a provider token")]
    NoProviderTokenFound,

    #[error("could not exchange authorization code: {0}")]
    CodeExchangeFailed(String),

    #[error("credentials could not be saved: {0}")]
    StorageFailed(String),

    #[error("login did not complete in time")]
    Timeout,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::NoAuthenticatedUser => ErrorKind::NoAuthenticatedUser,
            CaptureError::NoProviderTokenFound => ErrorKind::NoProviderTokenFound,
            CaptureError::CodeExchangeFailed(_) => ErrorKind::CodeExchangeFailed,
            CaptureError::StorageFailed(_) => ErrorKind::StorageFailed,
            CaptureError::Timeout => ErrorKind::Timeout,
        }
    }

    /// True when the user finished the provider login but the credential was
    /// not persisted.
    pub fn is_unsaved_login(&self) -> bool {
        matches!(self, CaptureError::StorageFailed(_))
    }
}

macro_rules! impl_failure_from {
    ($($ty:ty),*) => {
        $(
            impl From<&$ty> for Failure {
                fn from(e: &$ty) -> Self {
                    Failure::new(e.kind(), e.to_string())
                }
            }
        )*
    };
}

impl_failure_from!(StorageError, TokenError, CaptureError);

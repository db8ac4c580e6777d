//! Opaque secret storage.
//!
//! The vault is the only place a raw token lives at rest. Everything else in
//! the crate holds a [`SecretRef`], an opaque handle that means nothing without
//! the vault that issued it.
//!
//! ```text
//! ┌──────────────────────┐   put(secret)    ┌──────────────────────┐
//! │  TokenStore          │ ───────────────▶ │  SecretVault         │
//! │  (credential record  │ ◀─────────────── │  - SqliteVault       │
//! │   holds SecretRef)   │   SecretRef      │  - MemoryVault       │
//! └──────────────────────┘                  └──────────────────────┘
//! ```
//!
//! Adapters must never return a value for a reference they did not issue, and
//! `release` must be idempotent.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod encryption;
mod memory;
mod sqlite;

pub use encryption::VaultKey;
pub use memory::MemoryVault;
pub use sqlite::SqliteVault;

/// Opaque reference to a secret held by a [`SecretVault`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    /// Issues a fresh, unguessable reference.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Rehydrates a reference read back from persistent storage.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A token value that is wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrows the raw value. Call sites should be limited to the vault
    /// adapters and the outbound HTTP requests that need the token.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// Encrypted storage addressed by opaque reference.
///
/// Implementations are synchronous, like the SQLite layer underneath them;
/// every call is expected to complete in well under a millisecond.
pub trait SecretVault: Send + Sync {
    /// Stores `secret` and returns a new reference to it.
    fn put(&self, secret: &SecretString) -> Result<SecretRef>;

    /// Returns the secret behind `reference`, or `None` if it does not exist.
    fn resolve(&self, reference: &SecretRef) -> Result<Option<SecretString>>;

    /// Returns true if `reference` still points at a stored secret.
    fn contains(&self, reference: &SecretRef) -> Result<bool> {
        Ok(self.resolve(reference)?.is_some())
    }

    /// Deletes the secret. Returns false if it was already gone.
    fn release(&self, reference: &SecretRef) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_debug_is_redacted() {
        let secret = SecretString::new("ya29.super-secret");
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("super-secret"));
        assert_eq!(printed, "SecretString(***)");
    }

    #[test]
    fn test_secret_string_deserializes_transparently() {
        let secret: SecretString = serde_json::from_str("\"xoxb-123\"").unwrap();
        assert_eq!(secret.expose(), "xoxb-123");
    }

    #[test]
    fn test_generated_refs_are_unique() {
        assert_ne!(SecretRef::generate(), SecretRef::generate());
    }
}

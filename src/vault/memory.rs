//! In-process vault adapter for development and tests.

use super::{SecretRef, SecretString, SecretVault};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Vault held entirely in memory. Contents are lost on restart.
///
/// A vault can be switched to read-only, which makes every `put` fail. This
/// mirrors a real backend refusing writes (quota, lost connection) and lets
/// callers exercise their abort paths.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<SecretRef, SecretString>>,
    read_only: AtomicBool,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<SecretRef, SecretString>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory vault lock poisoned"))
    }
}

impl SecretVault for MemoryVault {
    fn put(&self, secret: &SecretString) -> Result<SecretRef> {
        if self.read_only.load(Ordering::SeqCst) {
            bail!("vault is read-only");
        }
        let reference = SecretRef::generate();
        self.entries()?.insert(reference.clone(), secret.clone());
        Ok(reference)
    }

    fn resolve(&self, reference: &SecretRef) -> Result<Option<SecretString>> {
        Ok(self.entries()?.get(reference).cloned())
    }

    fn release(&self, reference: &SecretRef) -> Result<bool> {
        Ok(self.entries()?.remove(reference).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_rejects_writes() {
        let vault = MemoryVault::new();
        let kept = vault.put(&SecretString::new("a")).unwrap();

        vault.set_read_only(true);
        assert!(vault.put(&SecretString::new("b")).is_err());

        // Existing entries stay readable
        assert!(vault.contains(&kept).unwrap());
        assert_eq!(vault.len(), 1);
    }
}

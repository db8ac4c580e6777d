//! SQLite-backed vault adapter.

use super::encryption::{Sealed, VaultKey};
use super::{SecretRef, SecretString, SecretVault};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Vault that keeps AES-256-GCM sealed secrets in a SQLite table.
///
/// # Schema
/// ```sql
/// CREATE TABLE vault_secrets (
///     id TEXT PRIMARY KEY,        -- SecretRef (UUID v4)
///     ciphertext TEXT NOT NULL,   -- base64
///     nonce TEXT NOT NULL,        -- base64, unique per row
///     created_at TEXT NOT NULL    -- ISO 8601
/// );
/// ```
pub struct SqliteVault {
    conn: Mutex<Connection>,
    key: VaultKey,
}

impl SqliteVault {
    /// Opens (or creates) the vault table in the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P, key: VaultKey) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open vault database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS vault_secrets (
                id TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create vault_secrets table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("vault connection lock poisoned"))
    }
}

impl SecretVault for SqliteVault {
    fn put(&self, secret: &SecretString) -> Result<SecretRef> {
        let sealed = self.key.seal(secret).context("Failed to seal secret")?;
        let reference = SecretRef::generate();

        self.conn()?
            .execute(
                "INSERT INTO vault_secrets (id, ciphertext, nonce, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    reference.as_str(),
                    sealed.ciphertext,
                    sealed.nonce,
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to write vault entry")?;

        Ok(reference)
    }

    fn resolve(&self, reference: &SecretRef) -> Result<Option<SecretString>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT ciphertext, nonce FROM vault_secrets WHERE id = ?1",
                params![reference.as_str()],
                |row| {
                    Ok(Sealed {
                        ciphertext: row.get(0)?,
                        nonce: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to read vault entry")?;

        row.map(|sealed| self.key.open(&sealed))
            .transpose()
            .context("Failed to open vault entry")
    }

    fn contains(&self, reference: &SecretRef) -> Result<bool> {
        let found = self
            .conn()?
            .query_row(
                "SELECT 1 FROM vault_secrets WHERE id = ?1",
                params![reference.as_str()],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to probe vault entry")?;

        Ok(found.is_some())
    }

    fn release(&self, reference: &SecretRef) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "DELETE FROM vault_secrets WHERE id = ?1",
                params![reference.as_str()],
            )
            .context("Failed to delete vault entry")?;

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn test_key() -> VaultKey {
        VaultKey::from_base64(&BASE64.encode([3u8; 32])).unwrap()
    }

    #[test]
    fn test_put_resolve_release() {
        let vault = SqliteVault::new(":memory:", test_key()).unwrap();

        let reference = vault.put(&SecretString::new("xoxp-access")).unwrap();
        assert!(vault.contains(&reference).unwrap());
        assert_eq!(
            vault.resolve(&reference).unwrap().unwrap().expose(),
            "xoxp-access"
        );

        assert!(vault.release(&reference).unwrap());
        assert!(!vault.contains(&reference).unwrap());
        assert!(vault.resolve(&reference).unwrap().is_none());

        // Releasing twice is harmless
        assert!(!vault.release(&reference).unwrap());
    }

    #[test]
    fn test_unknown_reference_resolves_to_none() {
        let vault = SqliteVault::new(":memory:", test_key()).unwrap();
        let stray = SecretRef::from_stored("not-issued-here".to_string());
        assert!(vault.resolve(&stray).unwrap().is_none());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let reference = {
            let vault = SqliteVault::new(&path, test_key()).unwrap();
            vault.put(&SecretString::new("persisted")).unwrap()
        };

        let vault = SqliteVault::new(&path, test_key()).unwrap();
        assert_eq!(
            vault.resolve(&reference).unwrap().unwrap().expose(),
            "persisted"
        );
    }

    #[test]
    fn test_reopen_with_other_key_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let reference = SqliteVault::new(&path, test_key())
            .unwrap()
            .put(&SecretString::new("sealed"))
            .unwrap();

        let other = VaultKey::from_base64(&BASE64.encode([9u8; 32])).unwrap();
        let vault = SqliteVault::new(&path, other).unwrap();
        assert!(vault.resolve(&reference).is_err());
    }
}

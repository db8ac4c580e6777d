//! Credential record table backed by SQLite.
//!
//! Stores one row per (user, provider) holding vault references and token
//! metadata. No raw token ever reaches this table.

use super::CredentialRecord;
use crate::provider::Provider;
use crate::vault::SecretRef;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SELECT_COLUMNS: &str = r#"
    SELECT user_id, provider, provider_email,
           access_secret_ref, refresh_secret_ref,
           scopes, expires_at, reauth_required,
           created_at, updated_at
    FROM credential_records
"#;

/// SQLite table of credential records.
///
/// # Schema
/// ```sql
/// CREATE TABLE credential_records (
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     provider_email TEXT,
///     access_secret_ref TEXT NOT NULL,    -- vault reference
///     refresh_secret_ref TEXT,            -- vault reference (optional)
///     scopes TEXT NOT NULL,               -- JSON array
///     expires_at INTEGER NOT NULL,        -- unix seconds
///     reauth_required INTEGER NOT NULL,
///     created_at TEXT NOT NULL,           -- ISO 8601
///     updated_at TEXT NOT NULL,           -- ISO 8601
///     PRIMARY KEY (user_id, provider)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Read-modify-write sequences are serialized one level up by `KeyLocks`
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Creates or opens the record table at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credential_records (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_email TEXT,
                access_secret_ref TEXT NOT NULL,
                refresh_secret_ref TEXT,
                scopes TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                reauth_required INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create credential_records table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credential database lock poisoned"))
    }

    /// Retrieves the record for a user and provider.
    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let sql = format!("{} WHERE user_id = ?1 AND provider = ?2", SELECT_COLUMNS);

        let raw = conn
            .query_row(&sql, params![user_id, provider.as_str()], read_row)
            .optional()
            .context("Failed to read credential record")?;

        raw.map(RawRecord::decode).transpose()
    }

    /// Inserts or updates the record keyed on (user_id, provider).
    ///
    /// A `None` refresh reference never clears a stored one: the column keeps
    /// its previous value unless a new reference is supplied.
    pub fn upsert(&self, record: &CredentialRecord) -> Result<()> {
        let scopes = serde_json::to_string(&record.scopes).context("Failed to encode scopes")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO credential_records (
                    user_id, provider, provider_email,
                    access_secret_ref, refresh_secret_ref,
                    scopes, expires_at, reauth_required,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    provider_email = excluded.provider_email,
                    access_secret_ref = excluded.access_secret_ref,
                    refresh_secret_ref = COALESCE(
                        excluded.refresh_secret_ref,
                        credential_records.refresh_secret_ref
                    ),
                    scopes = excluded.scopes,
                    expires_at = excluded.expires_at,
                    reauth_required = excluded.reauth_required,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.user_id,
                    record.provider.as_str(),
                    record.provider_email,
                    record.access_secret_ref.as_str(),
                    record.refresh_secret_ref.as_ref().map(|r| r.as_str()),
                    scopes,
                    record.expires_at.timestamp(),
                    record.reauth_required,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert credential record")?;

        Ok(())
    }

    /// Flags the record as needing a fresh login.
    ///
    /// Returns false if no record exists.
    pub fn mark_reauth_required(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE credential_records SET reauth_required = 1, updated_at = ?3 WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to flag credential record")?;

        Ok(rows > 0)
    }

    /// Deletes the record for a user and provider.
    ///
    /// # Returns
    /// * `Ok(true)` - Record deleted
    /// * `Ok(false)` - No record found
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "DELETE FROM credential_records WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .context("Failed to delete credential record")?;

        Ok(rows > 0)
    }

    /// Lists all records for a user, ordered by provider name.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let sql = format!("{} WHERE user_id = ?1 ORDER BY provider", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![user_id], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter().map(RawRecord::decode).collect()
    }
}

/// Column values as stored, before semantic decoding.
struct RawRecord {
    user_id: String,
    provider: String,
    provider_email: Option<String>,
    access_secret_ref: String,
    refresh_secret_ref: Option<String>,
    scopes: String,
    expires_at: i64,
    reauth_required: bool,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        provider_email: row.get(2)?,
        access_secret_ref: row.get(3)?,
        refresh_secret_ref: row.get(4)?,
        scopes: row.get(5)?,
        expires_at: row.get(6)?,
        reauth_required: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl RawRecord {
    fn decode(self) -> Result<CredentialRecord> {
        Ok(CredentialRecord {
            user_id: self.user_id,
            provider: self.provider.parse::<Provider>()?,
            provider_email: self.provider_email,
            access_secret_ref: SecretRef::from_stored(self.access_secret_ref),
            refresh_secret_ref: self.refresh_secret_ref.map(SecretRef::from_stored),
            scopes: serde_json::from_str::<BTreeSet<String>>(&self.scopes)
                .context("Failed to decode scopes")?,
            expires_at: Utc
                .timestamp_opt(self.expires_at, 0)
                .single()
                .ok_or_else(|| anyhow!("Invalid expires_at timestamp {}", self.expires_at))?,
            reauth_required: self.reauth_required,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp {}", value))
}

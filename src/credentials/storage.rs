//! Credential and token storage using SQLite.
//!
//! Client secrets arrive already encrypted. Access and refresh tokens are
//! encrypted here, with the shared [`SecretCipher`], before they touch disk.

use super::{Credential, CredentialStore, SecretCipher, TokenRecord, TokenStore};
use crate::error::{Error, Result};
use crate::marketplace::Marketplace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed [`CredentialStore`] and [`TokenStore`].
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     tenant_id TEXT,                        -- NULL = system/global
///     marketplace TEXT NOT NULL,
///     client_id TEXT NOT NULL,
///     client_secret_encrypted TEXT NOT NULL, -- nonce_hex:ciphertext_hex
///     redirect_uri TEXT,
///     is_active INTEGER NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// -- at most one active credential per (tenant, marketplace)
/// CREATE UNIQUE INDEX idx_one_active_credential
///     ON credentials(IFNULL(tenant_id, ''), marketplace) WHERE is_active = 1;
///
/// CREATE TABLE tokens (
///     tenant_id TEXT NOT NULL,
///     marketplace TEXT NOT NULL,
///     access_token TEXT NOT NULL,   -- Encrypted
///     refresh_token TEXT,           -- Encrypted (optional)
///     expires_at TEXT NOT NULL,     -- RFC 3339
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (tenant_id, marketplace)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex; no lock is held across an await
/// - Multi-statement writes run inside a transaction
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Arc<SecretCipher>,
}

impl SqliteStore {
    /// Creates or opens a store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `cipher` - Cipher used for tokens at rest
    pub fn open<P: AsRef<Path>>(db_path: P, cipher: Arc<SecretCipher>) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Store(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT,
                marketplace TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_secret_encrypted TEXT NOT NULL,
                redirect_uri TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_credential
                ON credentials(IFNULL(tenant_id, ''), marketplace)
                WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS tokens (
                tenant_id TEXT NOT NULL,
                marketplace TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, marketplace)
            );
            "#,
        )
        .map_err(|e| Error::Store(format!("failed to create schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection lock poisoned".to_string()))
    }
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let marketplace: String = row.get(2)?;
    let marketplace = marketplace.parse::<Marketplace>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Credential {
        id: Some(row.get(0)?),
        tenant_id: row.get(1)?,
        marketplace,
        client_id: row.get(3)?,
        client_secret_encrypted: row.get(4)?,
        redirect_uri: row.get(5)?,
        is_active: row.get(6)?,
    })
}

const CREDENTIAL_COLUMNS: &str =
    "id, tenant_id, marketplace, client_id, client_secret_encrypted, redirect_uri, is_active";

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn find_active(
        &self,
        tenant_id: Option<&str>,
        marketplace: Marketplace,
    ) -> Result<Option<Credential>> {
        let conn = self.lock()?;
        let credential = conn
            .query_row(
                &format!(
                    "SELECT {} FROM credentials \
                     WHERE tenant_id IS ?1 AND marketplace = ?2 AND is_active = 1",
                    CREDENTIAL_COLUMNS
                ),
                params![tenant_id, marketplace.as_str()],
                credential_from_row,
            )
            .optional()?;

        Ok(credential)
    }

    async fn save(&self, credential: &Credential) -> Result<Credential> {
        let now = Utc::now().to_rfc3339();
        let tenant_id = credential.tenant_id.as_deref();
        let marketplace = credential.marketplace.as_str();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // Activate-new and deactivate-old commit together
        if credential.is_active {
            tx.execute(
                r#"
                UPDATE credentials SET is_active = 0, updated_at = ?1
                WHERE tenant_id IS ?2 AND marketplace = ?3 AND is_active = 1 AND id IS NOT ?4
                "#,
                params![now, tenant_id, marketplace, credential.id],
            )?;
        }

        let id = match credential.id {
            Some(id) => {
                let updated = tx.execute(
                    r#"
                    UPDATE credentials SET
                        tenant_id = ?1,
                        marketplace = ?2,
                        client_id = ?3,
                        client_secret_encrypted = ?4,
                        redirect_uri = ?5,
                        is_active = ?6,
                        updated_at = ?7
                    WHERE id = ?8
                    "#,
                    params![
                        tenant_id,
                        marketplace,
                        credential.client_id,
                        credential.client_secret_encrypted,
                        credential.redirect_uri,
                        credential.is_active,
                        now,
                        id,
                    ],
                )?;
                if updated == 0 {
                    return Err(Error::Store(format!("credential {} not found", id)));
                }
                id
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO credentials (
                        tenant_id, marketplace, client_id, client_secret_encrypted,
                        redirect_uri, is_active, created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![
                        tenant_id,
                        marketplace,
                        credential.client_id,
                        credential.client_secret_encrypted,
                        credential.redirect_uri,
                        credential.is_active,
                        now,
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.commit()?;

        Ok(Credential {
            id: Some(id),
            ..credential.clone()
        })
    }

    async fn exists(&self, tenant_id: Option<&str>, marketplace: Marketplace) -> Result<bool> {
        let conn = self.lock()?;
        let found: bool = conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM credentials
                WHERE tenant_id IS ?1 AND marketplace = ?2 AND is_active = 1
            )
            "#,
            params![tenant_id, marketplace.as_str()],
            |row| row.get(0),
        )?;

        Ok(found)
    }

    async fn deactivate(&self, tenant_id: Option<&str>, marketplace: Marketplace) -> Result<bool> {
        let rows_affected = self.lock()?.execute(
            r#"
            UPDATE credentials SET is_active = 0, updated_at = ?1
            WHERE tenant_id IS ?2 AND marketplace = ?3 AND is_active = 1
            "#,
            params![Utc::now().to_rfc3339(), tenant_id, marketplace.as_str()],
        )?;

        Ok(rows_affected > 0)
    }

    async fn list_active(&self, tenant_id: &str) -> Result<Vec<Marketplace>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT marketplace FROM credentials \
             WHERE tenant_id = ?1 AND is_active = 1 ORDER BY marketplace",
        )?;

        let names = stmt
            .query_map(params![tenant_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        names.iter().map(|name| name.parse()).collect()
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn load(&self, tenant_id: &str, marketplace: Marketplace) -> Result<Option<TokenRecord>> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                r#"
                SELECT access_token, refresh_token, expires_at
                FROM tokens
                WHERE tenant_id = ?1 AND marketplace = ?2
                "#,
                params![tenant_id, marketplace.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((access_token, refresh_token, expires_at)) = row else {
            return Ok(None);
        };

        let access_token = self.cipher.decrypt(&access_token)?;
        let refresh_token = refresh_token
            .map(|token| self.cipher.decrypt(&token))
            .transpose()?;
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Store(format!("invalid expires_at timestamp: {}", e)))?;

        Ok(Some(TokenRecord {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    async fn replace(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        record: &TokenRecord,
    ) -> Result<()> {
        // Encrypt before taking the lock
        let access_token = self.cipher.encrypt(&record.access_token)?;
        let refresh_token = record
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        self.lock()?.execute(
            r#"
            INSERT INTO tokens (
                tenant_id, marketplace, access_token, refresh_token, expires_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(tenant_id, marketplace) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                marketplace.as_str(),
                access_token,
                refresh_token,
                record.expires_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn remove(&self, tenant_id: &str, marketplace: Marketplace) -> Result<bool> {
        let rows_affected = self.lock()?.execute(
            "DELETE FROM tokens WHERE tenant_id = ?1 AND marketplace = ?2",
            params![tenant_id, marketplace.as_str()],
        )?;

        Ok(rows_affected > 0)
    }
}

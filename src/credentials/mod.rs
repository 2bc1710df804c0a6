//! Marketplace credentials: encryption, storage, and resolution.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialResolver                 │
//! │  - tenant credential first               │
//! │  - system credential as fallback         │
//! └─────────────────────────────────────────┘
//!      ↓                ↓                ↓
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────────────────┐
//! │ CredentialStore│ │ SecretCipher │ │ SystemCredentialFallback │
//! │ (ciphertext)  │ │ AES-256-GCM  │ │ ({PREFIX}_CLIENT_ID ...) │
//! └──────────────┘ └──────────────┘ └──────────────────────────┘
//!      ↓
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - client secrets and tokens encrypted   │
//! │  - one active credential per tenant/mkt  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Client secrets are encrypted before they reach the store; the store only
//!   ever handles ciphertext
//! - Plaintext secrets live only in [`ResolvedCredential`], whose `Debug`
//!   output is redacted
//! - Access and refresh tokens are encrypted at rest as well
//! - Authenticated encryption (tampering detected)

use crate::error::Result;
use crate::marketplace::Marketplace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod fallback;
mod resolver;
mod storage;

pub use encryption::{validate_key, KeyMaterial, SecretCipher, ENCRYPTION_KEY_VAR};
pub use fallback::SystemCredentialFallback;
pub use resolver::CredentialResolver;
pub use storage::SqliteStore;

/// A tenant's (or the system's) registration with a marketplace, as stored.
///
/// `client_secret_encrypted` is always ciphertext in `nonce_hex:ciphertext_hex` form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Row identifier; `None` until saved
    pub id: Option<i64>,

    /// Owning tenant; `None` means system/global
    pub tenant_id: Option<String>,

    pub marketplace: Marketplace,

    /// Public identifier issued by the marketplace
    pub client_id: String,

    /// Encrypted client secret
    pub client_secret_encrypted: String,

    /// Callback URL for the authorization-code flow
    pub redirect_uri: Option<String>,

    /// Inactive credentials are never returned by the resolver
    pub is_active: bool,
}

impl Credential {
    /// New, active, unsaved credential for a tenant.
    pub fn new(
        tenant_id: impl Into<String>,
        marketplace: Marketplace,
        client_id: impl Into<String>,
        client_secret_encrypted: impl Into<String>,
        redirect_uri: Option<String>,
    ) -> Self {
        Self {
            id: None,
            tenant_id: Some(tenant_id.into()),
            marketplace,
            client_id: client_id.into(),
            client_secret_encrypted: client_secret_encrypted.into(),
            redirect_uri,
            is_active: true,
        }
    }
}

/// Where a resolved credential came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Tenant,
    System,
}

/// Ready-to-use client credentials with a plaintext secret.
///
/// Held in memory only; never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Option<String>,
    pub source: CredentialSource,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("source", &self.source)
            .finish()
    }
}

/// Access/refresh token pair for one tenant and marketplace.
///
/// Always replaced as a whole; never partially updated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Bearer token for marketplace API calls
    pub access_token: String,

    /// Token used to obtain a new access token
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Persistence of per-tenant marketplace credentials.
///
/// Implementations only ever see ciphertext secrets. Errors surface as
/// `Error::Store` and are never swallowed here.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The single active credential for the pair, if any.
    async fn find_active(
        &self,
        tenant_id: Option<&str>,
        marketplace: Marketplace,
    ) -> Result<Option<Credential>>;

    /// Insert (no id) or update (with id). Saving an active credential
    /// deactivates every other credential for the same pair atomically.
    async fn save(&self, credential: &Credential) -> Result<Credential>;

    /// Whether an active credential exists, without decrypting anything.
    async fn exists(&self, tenant_id: Option<&str>, marketplace: Marketplace) -> Result<bool>;

    /// Soft-deactivates the active credential. Returns whether one was active.
    async fn deactivate(&self, tenant_id: Option<&str>, marketplace: Marketplace) -> Result<bool>;

    /// Marketplaces with an active credential for a tenant.
    async fn list_active(&self, tenant_id: &str) -> Result<Vec<Marketplace>>;
}

/// Persistence of token records.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, tenant_id: &str, marketplace: Marketplace) -> Result<Option<TokenRecord>>;

    /// Full-record replacement in a single write.
    async fn replace(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        record: &TokenRecord,
    ) -> Result<()>;

    /// Explicit unlink only; refresh failures never call this.
    async fn remove(&self, tenant_id: &str, marketplace: Marketplace) -> Result<bool>;
}

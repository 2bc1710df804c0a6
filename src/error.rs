//! Error kinds surfaced by the token lifecycle core.
//!
//! Every variant is structured data, never user-facing text. The outer
//! API/UI layer decides how to present it.

use crate::marketplace::Marketplace;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the cipher, stores, resolver, OAuth client and manager.
///
/// The type is `Clone` so a single refresh outcome can be delivered to every
/// caller waiting on the same in-flight refresh.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Missing or invalid master key, missing system credentials, bad config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Marketplace name outside the supported set.
    #[error("unsupported marketplace '{0}'")]
    UnsupportedMarketplace(String),

    /// Ciphertext malformed, tampered with, or encrypted under another key.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Encryption failed inside the cipher.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Persistence I/O failure.
    #[error("store error: {0}")]
    Store(String),

    /// No token has been obtained yet for this tenant/marketplace.
    #[error("tenant '{tenant_id}' has not linked {marketplace}")]
    NotLinked {
        tenant_id: String,
        marketplace: Marketplace,
    },

    /// OAuth `state` unknown, already used, or expired.
    #[error("invalid or expired authorization state")]
    InvalidAuthorizationState,

    /// Authorization-code exchange failed (non-2xx, malformed body, transport error or timeout).
    #[error("{marketplace} code exchange failed (status {status:?}): {body}")]
    OAuthExchange {
        marketplace: Marketplace,
        status: Option<u16>,
        body: String,
    },

    /// Refresh-token exchange failed (non-2xx, malformed body, transport error or timeout).
    #[error("{marketplace} token refresh request failed (status {status:?}): {body}")]
    OAuthRefresh {
        marketplace: Marketplace,
        status: Option<u16>,
        body: String,
    },

    /// The manager could not refresh a near-expiry token. The stored record is untouched.
    #[error("token refresh failed for tenant '{tenant_id}' on {marketplace}: {source}")]
    TokenRefresh {
        tenant_id: String,
        marketplace: Marketplace,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the OAuth `error` code reported by the marketplace, if any.
    ///
    /// Looks through `TokenRefresh` wrappers. Callers use this to decide
    /// whether a refresh failure is terminal (`invalid_grant`) or transient.
    pub fn oauth_error_code(&self) -> Option<String> {
        match self {
            Error::OAuthExchange { body, .. } | Error::OAuthRefresh { body, .. } => {
                let value: serde_json::Value = serde_json::from_str(body).ok()?;
                value
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
            }
            Error::TokenRefresh { source, .. } => source.oauth_error_code(),
            _ => None,
        }
    }

    /// Returns the HTTP status of a failed OAuth call (`None` for transport errors).
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::OAuthExchange { status, .. } | Error::OAuthRefresh { status, .. } => *status,
            Error::TokenRefresh { source, .. } => source.http_status(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

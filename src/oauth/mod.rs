//! OAuth 2.0 authorization-server client for marketplaces.
//!
//! Implements the three network-facing operations of the authorization code
//! flow:
//! 1. Build the authorization URL the tenant is redirected to
//! 2. Exchange the returned code for a token pair
//! 3. Exchange a refresh token for a new token pair
//!
//! No retries happen here. Whether a failure means "re-authorize" or "try
//! again later" is the caller's decision.

mod exchange;
mod provider;
mod state_manager;

pub use provider::build_authorization_url;
pub use state_manager::{run_state_cleanup, StateEntry, StateManager};

use crate::config::MarketlinkConfig;
use crate::credentials::{ResolvedCredential, TokenRecord};
use crate::error::{Error, Result};
use crate::marketplace::{Marketplace, OAuthEndpoints};
use async_trait::async_trait;
use exchange::{request_token, Grant};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Authorization-server operations, one contract for every marketplace.
#[async_trait]
pub trait TokenClient: Send + Sync {
    /// Authorization URL carrying `response_type=code`, `client_id`,
    /// `redirect_uri` and the caller's `state`.
    fn authorization_url(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        state: &str,
    ) -> String;

    /// `grant_type=authorization_code` exchange.
    async fn exchange_code(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        code: &str,
    ) -> Result<TokenRecord>;

    /// `grant_type=refresh_token` exchange.
    async fn refresh(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        refresh_token: &str,
    ) -> Result<TokenRecord>;
}

/// Stateless HTTP client for marketplace token endpoints.
///
/// Every request carries the configured timeout; a timeout is reported the
/// same way as a non-2xx response.
#[derive(Clone)]
pub struct OAuthTokenClient {
    http: reqwest::Client,
    endpoints: HashMap<Marketplace, OAuthEndpoints>,
}

impl OAuthTokenClient {
    pub fn new(config: &MarketlinkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let endpoints = Marketplace::ALL
            .into_iter()
            .map(|marketplace| (marketplace, config.endpoints_for(marketplace)))
            .collect();

        Ok(Self { http, endpoints })
    }

    /// Endpoints in use for a marketplace.
    pub fn endpoints(&self, marketplace: Marketplace) -> OAuthEndpoints {
        self.endpoints
            .get(&marketplace)
            .cloned()
            .unwrap_or_else(|| marketplace.default_endpoints())
    }
}

#[async_trait]
impl TokenClient for OAuthTokenClient {
    fn authorization_url(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        state: &str,
    ) -> String {
        build_authorization_url(
            &self.endpoints(marketplace).auth_url,
            &credential.client_id,
            credential.redirect_uri.as_deref(),
            state,
        )
    }

    async fn exchange_code(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        code: &str,
    ) -> Result<TokenRecord> {
        let token_url = self.endpoints(marketplace).token_url;
        debug!(marketplace = %marketplace, "Exchanging authorization code for token at {}", token_url);

        let grant = Grant::AuthorizationCode {
            code,
            redirect_uri: credential.redirect_uri.as_deref(),
        };

        let record = request_token(&self.http, &token_url, credential, grant)
            .await
            .map_err(|failure| {
                warn!(
                    marketplace = %marketplace,
                    status = ?failure.status,
                    "Authorization code exchange failed"
                );
                Error::OAuthExchange {
                    marketplace,
                    status: failure.status,
                    body: failure.body,
                }
            })?;

        info!(
            marketplace = %marketplace,
            has_refresh_token = record.refresh_token.is_some(),
            expires_at = %record.expires_at,
            "Authorization code exchanged"
        );

        Ok(record)
    }

    async fn refresh(
        &self,
        marketplace: Marketplace,
        credential: &ResolvedCredential,
        refresh_token: &str,
    ) -> Result<TokenRecord> {
        let token_url = self.endpoints(marketplace).token_url;
        debug!(marketplace = %marketplace, "Refreshing OAuth token at {}", token_url);

        let grant = Grant::RefreshToken { refresh_token };

        let mut record = request_token(&self.http, &token_url, credential, grant)
            .await
            .map_err(|failure| {
                warn!(
                    marketplace = %marketplace,
                    status = ?failure.status,
                    "Token refresh request failed"
                );
                Error::OAuthRefresh {
                    marketplace,
                    status: failure.status,
                    body: failure.body,
                }
            })?;

        // Keep the existing refresh token if the provider did not rotate it
        if record.refresh_token.is_none() {
            record.refresh_token = Some(refresh_token.to_string());
        }

        Ok(record)
    }
}

/// Query parameters a marketplace appends to the redirect URI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthorizationCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationCallback {
    /// Parse a raw callback query string (without the leading `?`).
    pub fn from_query(query: &str) -> std::result::Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(query)
    }
}

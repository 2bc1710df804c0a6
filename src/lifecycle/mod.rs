//! Token lifecycle orchestration.
//!
//! [`TokenLifecycleManager`] is the entry point the rest of the CRM uses: it
//! hands out valid access tokens, refreshing them transparently when they get
//! close to expiry, and drives the authorization-code flow that links a
//! tenant's marketplace account in the first place.
//!
//! # Refresh coalescing
//!
//! At most one refresh runs per (tenant, marketplace) key. The first caller
//! that finds a near-expiry token spawns the refresh as its own task and
//! publishes a shared handle to it; everyone else arriving before it finishes
//! awaits that same handle. Because the refresh lives in a spawned task, a
//! caller that gives up (timeout, dropped request) does not cancel it; the new
//! token is still persisted for the remaining waiters and later callers.

mod state;

pub use state::TokenState;

use crate::config::MarketlinkConfig;
use crate::credentials::{CredentialResolver, ResolvedCredential, TokenRecord, TokenStore};
use crate::error::{Error, Result};
use crate::marketplace::Marketplace;
use crate::oauth::{AuthorizationCallback, StateManager, TokenClient};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type RefreshKey = (String, Marketplace);
type RefreshOutcome = Shared<BoxFuture<'static, Result<TokenRecord>>>;

/// A refresh currently running for one key.
struct InFlightRefresh {
    id: u64,
    outcome: RefreshOutcome,
}

/// Authorization redirect handed to the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Result of a successful code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedAccount {
    pub tenant_id: String,
    pub marketplace: Marketplace,
    pub expires_at: DateTime<Utc>,
    pub has_refresh_token: bool,
}

/// Acquires, stores and refreshes marketplace access tokens for tenants.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    resolver: Arc<CredentialResolver>,
    tokens: Arc<dyn TokenStore>,
    client: Arc<dyn TokenClient>,
    states: StateManager,
    refresh_thresholds: Arc<HashMap<Marketplace, Duration>>,
    in_flight: Arc<DashMap<RefreshKey, InFlightRefresh>>,
    next_refresh_id: Arc<AtomicU64>,
}

impl TokenLifecycleManager {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        tokens: Arc<dyn TokenStore>,
        client: Arc<dyn TokenClient>,
        config: &MarketlinkConfig,
    ) -> Self {
        let refresh_thresholds = Marketplace::ALL
            .into_iter()
            .map(|marketplace| {
                let seconds = config.lifecycle.threshold_for(marketplace);
                (marketplace, Duration::seconds(seconds))
            })
            .collect();

        Self {
            resolver,
            tokens,
            client,
            states: StateManager::new(config.authorization.state_expiry_seconds),
            refresh_thresholds: Arc::new(refresh_thresholds),
            in_flight: Arc::new(DashMap::new()),
            next_refresh_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    /// Pending authorization states.
    ///
    /// Expired states are swept whenever a flow starts; long-running
    /// services may also spawn [`run_state_cleanup`](crate::oauth::run_state_cleanup)
    /// on this manager to bound memory between flows.
    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    /// Time before expiry at which a marketplace's tokens are refreshed.
    pub fn refresh_threshold(&self, marketplace: Marketplace) -> Duration {
        self.refresh_thresholds
            .get(&marketplace)
            .copied()
            .unwrap_or_else(|| Duration::seconds(0))
    }

    /// Returns an access token that is valid for longer than the refresh threshold.
    ///
    /// Never starts the authorization flow: an unlinked pair yields
    /// `Error::NotLinked`. A failed refresh yields `Error::TokenRefresh` and
    /// leaves the stored record exactly as it was.
    pub async fn get_valid_access_token(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<String> {
        let credential = self.resolver.resolve(tenant_id, marketplace).await?;

        let record = self
            .tokens
            .load(tenant_id, marketplace)
            .await?
            .ok_or_else(|| not_linked(tenant_id, marketplace))?;

        let state = TokenState::classify(
            Some(&record),
            Utc::now(),
            self.refresh_threshold(marketplace),
        );
        if !state.needs_refresh() {
            return Ok(record.access_token);
        }

        debug!(
            tenant_id,
            marketplace = %marketplace,
            state = %state,
            expires_at = %record.expires_at,
            "Token needs refresh"
        );

        let refreshed = self
            .refresh_coalesced(tenant_id, marketplace, credential)
            .await?;
        Ok(refreshed.access_token)
    }

    /// Current lifecycle state, without any network call.
    pub async fn token_state(&self, tenant_id: &str, marketplace: Marketplace) -> Result<TokenState> {
        let record = self.tokens.load(tenant_id, marketplace).await?;
        Ok(TokenState::classify(
            record.as_ref(),
            Utc::now(),
            self.refresh_threshold(marketplace),
        ))
    }

    pub async fn has_tenant_credential(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<bool> {
        self.resolver.has_tenant_credential(tenant_id, marketplace).await
    }

    /// Authorization URL for a caller-supplied `state`.
    pub async fn authorization_url(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        state: &str,
    ) -> Result<String> {
        let credential = self.resolver.resolve(tenant_id, marketplace).await?;
        Ok(self.client.authorization_url(marketplace, &credential, state))
    }

    /// Starts the authorization-code flow with a fresh single-use state.
    pub async fn begin_authorization(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<AuthorizationRequest> {
        // Resolve first so a misconfigured marketplace doesn't leave a dangling state
        let credential = self.resolver.resolve(tenant_id, marketplace).await?;

        // Abandoned flows never reach complete_authorization
        self.states.cleanup_expired();
        let state = self.states.create_state(tenant_id, marketplace);
        let url = self.client.authorization_url(marketplace, &credential, &state);

        info!(
            tenant_id,
            marketplace = %marketplace,
            source = ?credential.source,
            "Authorization flow started"
        );

        Ok(AuthorizationRequest { url, state })
    }

    /// Finishes the flow started by [`begin_authorization`](Self::begin_authorization).
    ///
    /// The state is consumed even when the code exchange then fails.
    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<LinkedAccount> {
        let entry = self
            .states
            .validate_and_consume(state)
            .ok_or(Error::InvalidAuthorizationState)?;

        self.link_with_code(&entry.tenant_id, entry.marketplace, code)
            .await
    }

    /// Finishes the flow from the raw redirect query string.
    ///
    /// A marketplace-reported denial (`error=access_denied`, ...) surfaces as
    /// `Error::OAuthExchange` without a status, carrying the error as JSON.
    pub async fn complete_authorization_from_query(&self, query: &str) -> Result<LinkedAccount> {
        let callback = AuthorizationCallback::from_query(query).map_err(|e| {
            debug!(error = %e, "Unparseable authorization callback");
            Error::InvalidAuthorizationState
        })?;

        let state = callback
            .state
            .as_deref()
            .ok_or(Error::InvalidAuthorizationState)?;
        let entry = self
            .states
            .validate_and_consume(state)
            .ok_or(Error::InvalidAuthorizationState)?;

        if let Some(error) = callback.error {
            warn!(
                tenant_id = %entry.tenant_id,
                marketplace = %entry.marketplace,
                error = %error,
                "Marketplace denied authorization"
            );
            return Err(Error::OAuthExchange {
                marketplace: entry.marketplace,
                status: None,
                body: serde_json::json!({
                    "error": error,
                    "error_description": callback.error_description,
                })
                .to_string(),
            });
        }

        let code = callback.code.ok_or_else(|| Error::OAuthExchange {
            marketplace: entry.marketplace,
            status: None,
            body: serde_json::json!({ "error": "missing_code" }).to_string(),
        })?;

        self.link_with_code(&entry.tenant_id, entry.marketplace, &code)
            .await
    }

    /// Exchanges an authorization code and stores the first token record.
    ///
    /// For callers that manage the `state` parameter themselves.
    pub async fn link_with_code(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        code: &str,
    ) -> Result<LinkedAccount> {
        let credential = self.resolver.resolve(tenant_id, marketplace).await?;
        let record = self
            .client
            .exchange_code(marketplace, &credential, code)
            .await?;

        self.tokens.replace(tenant_id, marketplace, &record).await?;

        info!(
            tenant_id,
            marketplace = %marketplace,
            expires_at = %record.expires_at,
            "Marketplace account linked"
        );

        Ok(LinkedAccount {
            tenant_id: tenant_id.to_string(),
            marketplace,
            expires_at: record.expires_at,
            has_refresh_token: record.refresh_token.is_some(),
        })
    }

    /// Disconnects a tenant from a marketplace.
    ///
    /// Soft-deactivates the tenant's credential and removes its token record.
    /// Returns whether anything was removed.
    pub async fn unlink(&self, tenant_id: &str, marketplace: Marketplace) -> Result<bool> {
        let deactivated = self
            .resolver
            .deactivate_tenant_credential(tenant_id, marketplace)
            .await?;
        let removed = self.tokens.remove(tenant_id, marketplace).await?;

        info!(
            tenant_id,
            marketplace = %marketplace,
            credential_deactivated = deactivated,
            token_removed = removed,
            "Marketplace account unlinked"
        );

        Ok(deactivated || removed)
    }

    /// Joins the in-flight refresh for this key, or starts one.
    async fn refresh_coalesced(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        credential: ResolvedCredential,
    ) -> Result<TokenRecord> {
        let key = (tenant_id.to_string(), marketplace);

        let outcome = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(tenant_id, marketplace = %marketplace, "Joining in-flight token refresh");
                entry.get().outcome.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                let task = RefreshTask {
                    id,
                    key,
                    credential,
                    tokens: Arc::clone(&self.tokens),
                    client: Arc::clone(&self.client),
                    in_flight: Arc::clone(&self.in_flight),
                    threshold: self.refresh_threshold(marketplace),
                };
                let handle = tokio::spawn(task.run());

                let tenant = tenant_id.to_string();
                let outcome = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(Error::TokenRefresh {
                            tenant_id: tenant,
                            marketplace,
                            source: Box::new(Error::Store(format!(
                                "refresh task ended unexpectedly: {}",
                                e
                            ))),
                        })
                    })
                }
                .boxed()
                .shared();

                // The task removes this entry when it ends; it cannot do so
                // before the insert because the shard stays locked until then.
                entry.insert(InFlightRefresh {
                    id,
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        outcome.await
    }
}

fn not_linked(tenant_id: &str, marketplace: Marketplace) -> Error {
    Error::NotLinked {
        tenant_id: tenant_id.to_string(),
        marketplace,
    }
}

/// One refresh, owned by its own task.
struct RefreshTask {
    id: u64,
    key: RefreshKey,
    credential: ResolvedCredential,
    tokens: Arc<dyn TokenStore>,
    client: Arc<dyn TokenClient>,
    in_flight: Arc<DashMap<RefreshKey, InFlightRefresh>>,
    threshold: Duration,
}

/// Drops a refresh's map entry when its task ends, including by panic.
struct InFlightEntry {
    id: u64,
    key: RefreshKey,
    in_flight: Arc<DashMap<RefreshKey, InFlightRefresh>>,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.key, |_, current| current.id == self.id);
    }
}

impl RefreshTask {
    async fn run(self) -> Result<TokenRecord> {
        let _entry = InFlightEntry {
            id: self.id,
            key: self.key.clone(),
            in_flight: Arc::clone(&self.in_flight),
        };
        self.refresh().await
    }

    async fn refresh(&self) -> Result<TokenRecord> {
        let (tenant_id, marketplace) = (self.key.0.as_str(), self.key.1);

        // Re-check: a refresh that finished just before this one started has
        // already replaced the record (and possibly rotated the refresh token).
        let current = self
            .tokens
            .load(tenant_id, marketplace)
            .await?
            .ok_or_else(|| not_linked(tenant_id, marketplace))?;
        if !TokenState::classify(Some(&current), Utc::now(), self.threshold).needs_refresh() {
            debug!(tenant_id, marketplace = %marketplace, "Token already refreshed");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            warn!(
                tenant_id,
                marketplace = %marketplace,
                "Token near expiry but no refresh token stored, re-authorization required"
            );
            return Err(self.refresh_failed(Error::OAuthRefresh {
                marketplace,
                status: None,
                body: "no refresh token stored".to_string(),
            }));
        };

        info!(
            tenant_id,
            marketplace = %marketplace,
            expires_at = %current.expires_at,
            "Refreshing OAuth token"
        );

        let refreshed = match self
            .client
            .refresh(marketplace, &self.credential, refresh_token)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    tenant_id,
                    marketplace = %marketplace,
                    status = ?e.http_status(),
                    oauth_error = ?e.oauth_error_code(),
                    "Token refresh failed, keeping existing token record"
                );
                return Err(self.refresh_failed(e));
            }
        };

        if let Err(e) = self.tokens.replace(tenant_id, marketplace, &refreshed).await {
            error!(
                tenant_id,
                marketplace = %marketplace,
                error = %e,
                "Refreshed token could not be persisted"
            );
            return Err(e);
        }

        info!(
            tenant_id,
            marketplace = %marketplace,
            expires_at = %refreshed.expires_at,
            "OAuth token refreshed"
        );

        Ok(refreshed)
    }

    fn refresh_failed(&self, source: Error) -> Error {
        Error::TokenRefresh {
            tenant_id: self.key.0.clone(),
            marketplace: self.key.1,
            source: Box::new(source),
        }
    }
}

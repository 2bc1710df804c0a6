//! System-wide marketplace credentials drawn from process configuration.

use super::{CredentialSource, ResolvedCredential};
use crate::config::ConfigProvider;
use crate::error::{Error, Result};
use crate::marketplace::Marketplace;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves global (non-tenant) credentials for a marketplace.
///
/// Keys are `{PREFIX}_CLIENT_ID`, `{PREFIX}_CLIENT_SECRET` and
/// `{PREFIX}_REDIRECT_URI`, where the prefix comes from
/// [`Marketplace::env_prefix`].
#[derive(Clone)]
pub struct SystemCredentialFallback {
    provider: Arc<dyn ConfigProvider>,
}

impl SystemCredentialFallback {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self { provider }
    }

    /// Looks up a marketplace by name, then its system credential.
    pub fn get_by_name(&self, marketplace: &str) -> Result<ResolvedCredential> {
        self.get(marketplace.parse()?)
    }

    /// System credential for a marketplace.
    ///
    /// # Returns
    /// * `Ok(ResolvedCredential)` - with `source = System`
    /// * `Err(Error::Configuration)` - client id or secret missing/empty
    pub fn get(&self, marketplace: Marketplace) -> Result<ResolvedCredential> {
        let prefix = marketplace.env_prefix();
        let client_id = self.non_empty(&format!("{}_CLIENT_ID", prefix));
        let client_secret = self.non_empty(&format!("{}_CLIENT_SECRET", prefix));

        let (client_id, client_secret) = match (client_id, client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            (id, _) => {
                let missing = if id.is_none() { "CLIENT_ID" } else { "CLIENT_SECRET" };
                return Err(Error::Configuration(format!(
                    "system credentials for {} are not configured: set {}_{}",
                    marketplace, prefix, missing
                )));
            }
        };

        // Runs on every resolve; report() carries the startup warning
        let redirect_uri = self.redirect_uri(marketplace);
        if redirect_uri.is_none() {
            debug!(marketplace = %marketplace, "System credential has no redirect URI");
        }

        Ok(ResolvedCredential {
            client_id,
            client_secret,
            redirect_uri,
            source: CredentialSource::System,
        })
    }

    /// Configured system redirect URI, if any.
    pub fn redirect_uri(&self, marketplace: Marketplace) -> Option<String> {
        self.non_empty(&format!("{}_REDIRECT_URI", marketplace.env_prefix()))
    }

    /// Checks every marketplace once at startup and logs what is usable.
    ///
    /// Returns the marketplaces with complete system credentials.
    pub fn report(&self) -> Vec<Marketplace> {
        let mut configured = Vec::new();

        for marketplace in Marketplace::ALL {
            match self.get(marketplace) {
                Ok(credential) => {
                    if credential.redirect_uri.is_some() {
                        info!(marketplace = %marketplace, "System credentials configured");
                    } else {
                        warn!(
                            marketplace = %marketplace,
                            "System credentials configured without {}_REDIRECT_URI; authorization flows must supply one",
                            marketplace.env_prefix()
                        );
                    }
                    configured.push(marketplace);
                }
                Err(e) => {
                    info!(marketplace = %marketplace, reason = %e, "No system credentials");
                }
            }
        }

        configured
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.provider
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

//! Tenant → system credential resolution.

use super::{
    Credential, CredentialSource, CredentialStore, ResolvedCredential, SecretCipher,
    SystemCredentialFallback,
};
use crate::error::Result;
use crate::marketplace::Marketplace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Single entry point for obtaining usable client credentials.
///
/// Resolution order:
/// 1. The tenant's active credential, if its secret decrypts
/// 2. The system credential for the marketplace
///
/// A tenant credential that fails to decrypt is logged and skipped rather
/// than failing the call. Store errors are not skipped.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    system: SystemCredentialFallback,
    fallback_count: AtomicU64,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<SecretCipher>,
        system: SystemCredentialFallback,
    ) -> Self {
        Self {
            store,
            cipher,
            system,
            fallback_count: AtomicU64::new(0),
        }
    }

    pub async fn resolve(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<ResolvedCredential> {
        if let Some(credential) = self.store.find_active(Some(tenant_id), marketplace).await? {
            match self.cipher.decrypt(&credential.client_secret_encrypted) {
                Ok(client_secret) => {
                    debug!(tenant_id, marketplace = %marketplace, "Using tenant credentials");
                    let redirect_uri = credential
                        .redirect_uri
                        .or_else(|| self.system.redirect_uri(marketplace));
                    return Ok(ResolvedCredential {
                        client_id: credential.client_id,
                        client_secret,
                        redirect_uri,
                        source: CredentialSource::Tenant,
                    });
                }
                Err(e) => {
                    self.fallback_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = "tenant_credential_fallback",
                        tenant_id,
                        marketplace = %marketplace,
                        credential_id = ?credential.id,
                        error = %e,
                        "Tenant credential unusable, falling back to system credentials"
                    );
                }
            }
        }

        self.system.get(marketplace)
    }

    /// Whether the tenant has its own active credential. Does not decrypt.
    pub async fn has_tenant_credential(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<bool> {
        self.store.exists(Some(tenant_id), marketplace).await
    }

    /// Encrypts a plaintext secret and saves it as the tenant's active credential.
    ///
    /// Any previously active credential for the pair is deactivated.
    pub async fn register_tenant_credential(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
        client_id: &str,
        client_secret: &str,
        redirect_uri: Option<String>,
    ) -> Result<Credential> {
        let encrypted = self.cipher.encrypt(client_secret)?;
        let credential = Credential::new(
            tenant_id,
            marketplace,
            client_id,
            encrypted,
            redirect_uri,
        );
        self.store.save(&credential).await
    }

    /// Soft-deactivates the tenant's credential.
    pub async fn deactivate_tenant_credential(
        &self,
        tenant_id: &str,
        marketplace: Marketplace,
    ) -> Result<bool> {
        self.store.deactivate(Some(tenant_id), marketplace).await
    }

    /// Number of times a corrupted tenant credential was masked by system credentials.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }
}

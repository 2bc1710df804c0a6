// Integration tests for credential resolution: tenant credentials first,
// system credentials from configuration as the fallback.

use marketlink::config::MapConfigProvider;
use marketlink::credentials::{
    Credential, CredentialResolver, CredentialSource, CredentialStore, SecretCipher, SqliteStore,
    SystemCredentialFallback,
};
use marketlink::{Error, Marketplace};
use std::sync::Arc;

const MASTER_KEY: &str = "0123456789abcdef0123456789abcdef";

fn resolver_with(
    pairs: &[(&str, &str)],
) -> (CredentialResolver, Arc<SqliteStore>, Arc<SecretCipher>) {
    let cipher = Arc::new(SecretCipher::from_master_key(MASTER_KEY).unwrap());
    let store = Arc::new(SqliteStore::open(":memory:", Arc::clone(&cipher)).unwrap());
    let provider = MapConfigProvider::from_pairs(pairs.iter().copied());
    let resolver = CredentialResolver::new(
        store.clone(),
        Arc::clone(&cipher),
        SystemCredentialFallback::new(Arc::new(provider)),
    );
    (resolver, store, cipher)
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// No tenant row: system credentials from configuration are returned.
#[tokio::test]
async fn test_system_credentials_when_tenant_has_none() {
    let (resolver, _, _) =
        resolver_with(&[("ML_CLIENT_ID", "abc"), ("ML_CLIENT_SECRET", "xyz")]);

    let marketplace: Marketplace = "mercado_livre".parse().unwrap();
    let resolved = resolver.resolve("t1", marketplace).await.unwrap();

    assert_eq!(resolved.client_id, "abc");
    assert_eq!(resolved.client_secret, "xyz");
    assert_eq!(resolved.redirect_uri, None);
    assert_eq!(resolved.source, CredentialSource::System);
}

/// A tampered tenant ciphertext falls back to system credentials and is counted.
#[tokio::test]
async fn test_tampered_tenant_secret_masked_by_system_credentials() {
    let (resolver, store, cipher) =
        resolver_with(&[("ML_CLIENT_ID", "abc"), ("ML_CLIENT_SECRET", "xyz")]);

    let mut encrypted = cipher.encrypt("tenant-secret").unwrap();
    // Flip the last hex digit of the ciphertext
    let last = encrypted.pop().unwrap();
    encrypted.push(if last == '0' { '1' } else { '0' });

    store
        .save(&Credential::new(
            "t1",
            Marketplace::MercadoLivre,
            "tenant-app",
            encrypted,
            None,
        ))
        .await
        .unwrap();

    let resolved = resolver
        .resolve("t1", Marketplace::MercadoLivre)
        .await
        .unwrap();

    assert_eq!(resolved.client_id, "abc");
    assert_eq!(resolved.source, CredentialSource::System);
    assert_eq!(resolver.fallback_count(), 1);
}

/// Neither tenant nor system credentials: a configuration error.
#[tokio::test]
async fn test_nothing_configured_is_a_configuration_error() {
    let (resolver, _, _) = resolver_with(&[("ML_CLIENT_ID", "abc")]);

    let err = resolver
        .resolve("t1", Marketplace::MercadoLivre)
        .await
        .unwrap_err();

    match err {
        Error::Configuration(message) => assert!(message.contains("ML_CLIENT_SECRET")),
        other => panic!("expected Configuration, got {:?}", other),
    }
}

// ── Storage invariants ────────────────────────────────────────────────────────

/// Saving a second credential for the same pair leaves only the second active.
#[tokio::test]
async fn test_second_registration_replaces_first() {
    let (resolver, store, _) = resolver_with(&[]);

    let first = resolver
        .register_tenant_credential("t1", Marketplace::Amazon, "app-a", "secret-a", None)
        .await
        .unwrap();
    let second = resolver
        .register_tenant_credential("t1", Marketplace::Amazon, "app-b", "secret-b", None)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let active = store
        .find_active(Some("t1"), Marketplace::Amazon)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(active.client_id, "app-b");

    let resolved = resolver.resolve("t1", Marketplace::Amazon).await.unwrap();
    assert_eq!(resolved.client_secret, "secret-b");
    assert_eq!(resolved.source, CredentialSource::Tenant);
}

/// Tenants never see each other's credentials.
#[tokio::test]
async fn test_tenants_are_isolated() {
    let (resolver, store, _) =
        resolver_with(&[("SHOPEE_CLIENT_ID", "sys"), ("SHOPEE_CLIENT_SECRET", "s")]);

    resolver
        .register_tenant_credential("t1", Marketplace::Shopee, "t1-app", "t1-secret", None)
        .await
        .unwrap();

    let other = resolver.resolve("t2", Marketplace::Shopee).await.unwrap();
    assert_eq!(other.client_id, "sys");
    assert_eq!(other.source, CredentialSource::System);

    assert_eq!(
        store.list_active("t1").await.unwrap(),
        vec![Marketplace::Shopee]
    );
    assert!(store.list_active("t2").await.unwrap().is_empty());
}

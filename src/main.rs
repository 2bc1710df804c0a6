use anyhow::{Context, Result};
use marketlink::config::{load_config, EnvConfigProvider, MarketlinkConfig};
use marketlink::credentials::{
    CredentialResolver, SecretCipher, SqliteStore, SystemCredentialFallback,
};
use marketlink::oauth::OAuthTokenClient;
use marketlink::{Marketplace, TokenLifecycleManager};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketlink=info".into()),
        )
        .init();

    info!("Marketlink starting...");

    let provider = Arc::new(EnvConfigProvider);

    // Read configuration from file (optional) and environment
    let mut config = match std::env::var("MARKETLINK_CONFIG") {
        Ok(path) => load_config(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => MarketlinkConfig::default(),
    };
    config.apply_overrides(provider.as_ref());
    config.validate().context("Invalid configuration")?;

    info!(
        database_path = %config.storage.database_path,
        refresh_threshold_seconds = config.lifecycle.refresh_threshold_seconds,
        marketplace_thresholds = ?config.lifecycle.thresholds,
        http_timeout_seconds = config.http.timeout_seconds,
        "Configuration loaded"
    );

    // Validate the master key once; everything else gets the cipher injected
    let cipher = Arc::new(
        SecretCipher::from_config(provider.as_ref())
            .context("ENCRYPTION_KEY is required (at least 32 characters)")?,
    );

    let system = SystemCredentialFallback::new(provider.clone());
    let configured = system.report();
    info!(
        configured = configured.len(),
        total = Marketplace::ALL.len(),
        "System credentials checked"
    );

    let store = Arc::new(
        SqliteStore::open(&config.storage.database_path, Arc::clone(&cipher))
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let resolver = Arc::new(CredentialResolver::new(store.clone(), cipher, system));
    let client =
        Arc::new(OAuthTokenClient::new(&config).context("Failed to build OAuth client")?);
    let manager = TokenLifecycleManager::new(resolver, store, client, &config);

    let mut args = std::env::args().skip(1);
    let (Some(tenant_id), Some(marketplace)) = (args.next(), args.next()) else {
        info!("No tenant given, nothing else to do (usage: marketlink <tenant_id> <marketplace>)");
        return Ok(());
    };

    let marketplace: Marketplace = marketplace.parse()?;
    let state = manager
        .token_state(&tenant_id, marketplace)
        .await
        .context("Failed to read token state")?;
    let has_tenant_credential = manager
        .has_tenant_credential(&tenant_id, marketplace)
        .await
        .context("Failed to read tenant credentials")?;

    info!(
        tenant_id = %tenant_id,
        marketplace = %marketplace,
        state = %state,
        has_tenant_credential,
        "Token state"
    );

    Ok(())
}

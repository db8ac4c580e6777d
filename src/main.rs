use anyhow::{Context, Result};
use keyline::api::{
    create_oauth_router, create_provider_router, run_state_cleanup, OAuthAppState,
    ProviderAppState, StateManager,
};
use keyline::config::{load_config, KeylineConfig, VaultBackend};
use keyline::credentials::{CredentialServices, RecordStore};
use keyline::provider::ProviderRegistry;
use keyline::vault::{MemoryVault, SecretVault, SqliteVault, VaultKey};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "keyline.toml";

fn load() -> Result<KeylineConfig> {
    let mut config = match std::env::var("KEYLINE_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            load_config(DEFAULT_CONFIG_PATH)?
        }
        Err(_) => KeylineConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn open_vault(config: &KeylineConfig) -> Result<Arc<dyn SecretVault>> {
    match config.storage.vault {
        VaultBackend::Sqlite => {
            let encoded = std::env::var("KEYLINE_ENCRYPTION_KEY")
                .context("KEYLINE_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
            let key = VaultKey::from_base64(&encoded)?;
            let vault = SqliteVault::new(&config.storage.database_path, key)
                .context("Failed to initialize secret vault")?;
            Ok(Arc::new(vault))
        }
        VaultBackend::Memory => {
            warn!("Using in-memory vault, stored tokens will not survive a restart");
            Ok(Arc::new(MemoryVault::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyline=info".into()),
        )
        .init();

    info!("Keyline starting...");

    let config = load()?;
    info!(
        bind = %config.server.bind,
        auth_enabled = config.server.auth_enabled,
        database_path = %config.storage.database_path,
        vault = ?config.storage.vault,
        "Configuration loaded"
    );

    let vault = open_vault(&config)?;
    let records = Arc::new(
        RecordStore::new(&config.storage.database_path)
            .context("Failed to initialize credential records")?,
    );
    let providers = ProviderRegistry::from_env(&config.providers);
    let services = CredentialServices::new(vault, records, providers.clone(), &config.tokens);
    info!("Credential services initialized");

    let state_manager = StateManager::new(config.server.oauth_state_expiry_seconds);
    tokio::spawn(run_state_cleanup(state_manager.clone(), 60));

    let router = create_provider_router(ProviderAppState {
        services: services.clone(),
        providers: providers.clone(),
        auth_enabled: config.server.auth_enabled,
    })
    .merge(create_oauth_router(OAuthAppState {
        services,
        providers,
        state_manager,
        auth_enabled: config.server.auth_enabled,
        callback_base_url: config.server.callback_base_url.clone(),
        exchange_timeout: Duration::from_secs(config.capture.exchange_timeout_seconds),
    }))
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "Keyline API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Keyline API server error")?;

    Ok(())
}

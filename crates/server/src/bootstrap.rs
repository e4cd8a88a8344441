//! Daemon startup: configuration loading, mode gating and store opening.

use crate::metrics;
use crate::routes::create_router;
use crate::state::AppState;
use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use trove_core::config::AppConfig;
use trove_metadata::{MetadataStore, StoreOptions};

/// Prefix for configuration environment variables. Nested keys are separated
/// by `__`, e.g. `TROVE_METADATA__PATH`.
pub const ENV_PREFIX: &str = "TROVE_";

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "TROVE_CONFIG";

/// Load configuration from `path` (optional) and `TROVE_` environment variables.
///
/// Environment variables override the file. Fails if neither source is present
/// or the merged configuration does not validate.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = path.exists();

    if has_config_file {
        tracing::info!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    // TROVE_CONFIG only names the file; it is not configuration itself.
    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with(ENV_PREFIX) && key != CONFIG_PATH_ENV);

    if !has_config_file && !has_env_config {
        bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: troved --config /path/to/troved.toml\n  \
             2. Environment variables: TROVE_METADATA__TYPE=sqlite \
             TROVE_METADATA__PATH=/var/lib/trove/metadata.db troved\n\n\
             Set TROVE_CONFIG to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Gate the declared mode, open and migrate the store, and build the state
/// served by the HTTP surface.
pub async fn start(config: AppConfig) -> Result<AppState> {
    let opened = trove_metadata::open(&config, StoreOptions::from(&config))
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!(
        backend = %opened.store.backend(),
        mode = %opened.enforcement.effective_mode,
        trusted = opened.enforcement.is_trusted_storage,
        "Metadata store initialized"
    );

    metrics::register_metrics();
    metrics::record_mode(&opened.enforcement);
    metrics::record_pool_stats(&opened.store.pool_stats());

    Ok(AppState::new(config, opened))
}

/// Open the configured store without migrating it, for admin subcommands.
pub async fn open_for_admin(config: &AppConfig) -> Result<Arc<dyn MetadataStore>> {
    let options = StoreOptions {
        auto_migrate: false,
        ..StoreOptions::from(config)
    };
    trove_metadata::from_config(&config.metadata, options)
        .await
        .context("failed to open metadata store")
}

/// Serve the HTTP surface until `shutdown` resolves, then close the pool.
pub async fn serve(state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr: SocketAddr = state
        .config
        .node
        .bind
        .parse()
        .context("invalid bind address")?;
    let metadata = state.metadata.clone();
    let app = create_router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    tracing::info!("Shutting down; closing metadata pool");
    metadata.close().await;
    served.context("HTTP server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::NodeMode;
    use trove_core::config::MetadataConfig;

    #[test]
    fn test_load_config_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("troved.toml");
        let db_path = temp.path().join("metadata.db");
        std::fs::write(
            &path,
            format!(
                r#"
[node]
node_id = "node-a"
mode = "full"

[metadata]
type = "sqlite"
path = "{}"

[audit]
failure_policy = "fail"

[migrations]
checksum_policy = "warn"
lock_timeout_secs = 5
"#,
                db_path.display()
            ),
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.node.node_id, "node-a");
        assert_eq!(config.node.mode, NodeMode::Full);
        assert!(matches!(config.metadata, MetadataConfig::Sqlite { .. }));
        assert_eq!(
            config.audit.failure_policy,
            trove_core::config::AuditFailurePolicy::Fail
        );
        assert_eq!(config.migrations.lock_timeout_secs, 5);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("troved.toml");
        std::fs::write(&path, "[migrations]\nlock_timeout_secs = 0\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("lock_timeout_secs"));
    }

    #[tokio::test]
    async fn test_start_downgrades_full_mode_on_sqlite() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing(temp.path().join("metadata.db"));
        config.node.mode = NodeMode::Full;

        let state = start(config).await.unwrap();
        assert!(state.enforcement.downgraded);
        assert_eq!(state.enforcement.effective_mode, NodeMode::Selective);
        assert_eq!(metrics::MODE_DOWNGRADED.get(), 1);
        assert_eq!(metrics::TRUSTED_STORAGE.get(), 0);
    }

    #[tokio::test]
    async fn test_open_for_admin_does_not_migrate() {
        let temp = tempfile::tempdir().unwrap();
        let config = AppConfig::for_testing(temp.path().join("metadata.db"));

        let store = open_for_admin(&config).await.unwrap();
        let migrations = store.list_migrations().await.unwrap();
        assert!(migrations.iter().all(|m| !m.applied));
    }
}

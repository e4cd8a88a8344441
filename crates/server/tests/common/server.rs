//! Server test utilities.

use std::sync::Arc;
use tempfile::TempDir;
use trove_core::NodeMode;
use trove_core::config::AppConfig;
use trove_metadata::{MetadataStore, OpenedStore, SqliteStore, StoreOptions};
use trove_server::{AppState, create_router};

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server over a temporary SQLite store.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Declare `mode` for the node before starting.
    pub async fn with_mode(mode: NodeMode) -> Self {
        Self::with_config(|config| config.node.mode = mode).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("metadata.db");

        let mut config = AppConfig::for_testing(&db_path);
        customize(&mut config);

        let sqlite = Arc::new(
            SqliteStore::new(&db_path, None, StoreOptions::from(&config))
                .await
                .expect("Failed to create metadata store"),
        );
        let opened = OpenedStore {
            store: sqlite.clone() as Arc<dyn MetadataStore>,
            enforcement: trove_core::enforce_mode(config.node.mode, sqlite.backend()),
        };

        trove_server::metrics::register_metrics();
        let state = AppState::new(config, opened);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    /// The concrete store, for audited pool access.
    pub fn sqlite(&self) -> &Arc<SqliteStore> {
        &self.sqlite
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.state.metadata
    }
}

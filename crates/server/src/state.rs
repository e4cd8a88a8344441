//! Application state shared across handlers.

use std::sync::Arc;
use trove_core::config::AppConfig;
use trove_core::{ModeEnforcementResult, PeerStorageMetadata, peer_storage_metadata};
use trove_metadata::{MetadataStore, OpenedStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Mode the node was admitted with at startup.
    pub enforcement: Arc<ModeEnforcementResult>,
}

impl AppState {
    /// Create a new application state from a store opened under `config`.
    pub fn new(config: AppConfig, opened: OpenedStore) -> Self {
        Self {
            config: Arc::new(config),
            metadata: opened.store,
            enforcement: Arc::new(opened.enforcement),
        }
    }

    /// Storage capabilities advertised to peers.
    ///
    /// Derived from the declared mode and the live backend, so a downgraded
    /// node never advertises more trust than its storage provides.
    pub fn storage_metadata(&self) -> PeerStorageMetadata {
        peer_storage_metadata(self.metadata.backend(), self.config.node.mode)
    }
}

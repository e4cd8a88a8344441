//! Storage capability discovery endpoint.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;
use trove_core::PeerStorageMetadata;

/// Capabilities response.
#[derive(Debug, Serialize)]
pub struct StorageCapabilitiesResponse {
    pub node_id: String,
    #[serde(flatten)]
    pub storage: PeerStorageMetadata,
    /// Whether this node's database enforces per-role privileges.
    pub role_isolation: bool,
    /// API version.
    pub api_version: &'static str,
}

/// GET /v1/storage/capabilities
pub async fn get_storage_capabilities(
    State(state): State<AppState>,
) -> ApiResult<Json<StorageCapabilitiesResponse>> {
    let storage = state.storage_metadata();
    Ok(Json(StorageCapabilitiesResponse {
        node_id: state.config.node.node_id.clone(),
        role_isolation: storage.backend.supports_role_isolation(),
        storage,
        api_version: "v1",
    }))
}

//! Shared fixtures for storage tests.

use trove_core::{DbRole, OperationContext, RequestContext};
use uuid::Uuid;

/// A request carrying an operation under `role`.
#[allow(dead_code)]
pub fn request_as(role: DbRole) -> RequestContext {
    RequestContext::for_operation(
        OperationContext::new(role, "integration-test").with_actor("tester"),
    )
}

/// Fresh dataset id and a unique name derived from it.
#[allow(dead_code)]
pub fn dataset_fixture() -> (String, String) {
    let id = Uuid::new_v4().to_string();
    let name = format!("dataset-{}", &id[..8]);
    (id, name)
}

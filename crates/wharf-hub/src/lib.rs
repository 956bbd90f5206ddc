//! The long-running orchestrator server: branch catalog, environment
//! discovery and import, safety gate, and the session transport endpoint.

pub mod catalog;
pub mod discovery;
pub mod providers;
pub mod safety;
pub mod server;
pub mod session;

use wharf_core::OrchestratorError;
use wharf_storage::RegistryError;

/// Containers belonging to an environment are named
/// `wharf-<environment>-<service>`.
pub const CONTAINER_PREFIX: &str = "wharf-";

/// Registry failures cross the component boundary as orchestrator kinds.
pub(crate) fn map_registry(err: RegistryError) -> OrchestratorError {
    match err {
        RegistryError::PortExhausted { .. } => OrchestratorError::PortExhausted(err.to_string()),
        RegistryError::PortHeld { .. } => OrchestratorError::Conflict(err.to_string()),
        RegistryError::EnvironmentExists(name) => OrchestratorError::AlreadyManaged(name),
        RegistryError::EnvironmentNotFound(name) => OrchestratorError::NotFound(name),
        other => OrchestratorError::PreconditionFailed(format!("registry error: {other}")),
    }
}

use thiserror::Error;

/// Error taxonomy shared by every orchestrator component. Subprocess and
/// filesystem failures are translated into one of these kinds at the
/// component boundary; raw `io::Error`s never cross a public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already managed: {0}")]
    AlreadyManaged(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("port range exhausted: {0}")]
    PortExhausted(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("process exited: {0}")]
    ProcessExit(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind, used in wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::AlreadyManaged(_) => "already_managed",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::PreconditionFailed(_) => "precondition_failed",
            OrchestratorError::RemoteUnavailable(_) => "remote_unavailable",
            OrchestratorError::PortExhausted(_) => "port_exhausted",
            OrchestratorError::Transport(_) => "transport_error",
            OrchestratorError::ProcessExit(_) => "process_exit",
        }
    }

    /// Transport errors drive reconnection; everything else is terminal for
    /// the operation that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transport(_) | OrchestratorError::RemoteUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            OrchestratorError::NotFound("x".into()).kind(),
            "not_found"
        );
        assert_eq!(
            OrchestratorError::PortExhausted("x".into()).kind(),
            "port_exhausted"
        );
    }

    #[test]
    fn only_transport_and_remote_are_recoverable() {
        assert!(OrchestratorError::Transport("drop".into()).is_recoverable());
        assert!(OrchestratorError::RemoteUnavailable("dns".into()).is_recoverable());
        assert!(!OrchestratorError::ProcessExit("exit 1".into()).is_recoverable());
        assert!(!OrchestratorError::Conflict("dup".into()).is_recoverable());
    }
}

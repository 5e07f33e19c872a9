use thiserror::Error;

/// The error taxonomy the reconciliation loop dispatches on. Variants carry
/// enough context for logging; they deliberately don't carry the full error
/// chain (use `anyhow::Error::source()` upstream for that). `Clone` so the
/// informer can hand the same error to both its own retry logic and the
/// driver loop's `execute()` caller.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication expired")]
    AuthExpired,

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("not found")]
    NotFound,

    #[error("a relay is already registered for this organization")]
    RelayAlreadyPresent,

    #[error("failed to apply data plane configuration: {0}")]
    DataPlane(String),

    #[error("no usable local endpoint could be determined")]
    NoLocalEndpoint,

    #[error("operation canceled")]
    Canceled,
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::TransientNetwork(e.to_string())
    }
}

impl AgentError {
    /// Whether this error should cause the reconcile loop to discard its
    /// cached peer map and force a full rebuild on the next tick.
    pub fn forces_rebuild(&self) -> bool {
        matches!(self, AgentError::DataPlane(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::TransientNetwork(_))
    }
}

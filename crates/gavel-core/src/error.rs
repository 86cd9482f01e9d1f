use thiserror::Error;

/// A convenience `Result` alias using [`GavelError`].
pub type GavelResult<T> = Result<T, GavelError>;

/// Top-level error type for Gavel.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum GavelError {
    /// An error from the blackboard store (connection, command, decode).
    #[error("Store error: {0}")]
    Store(String),

    /// A requested entity does not exist in the store.
    ///
    /// Callers that probe for existence (duplicate-claim checks, context
    /// assembly) match on this variant and proceed idempotently.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind ("artefact", "claim", ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestrator engine or its state machines.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error originating inside an agent worker.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from the container runtime (Docker API).
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GavelError {
    /// Build a [`GavelError::NotFound`] for the given entity kind and id.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error is a missing-key lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

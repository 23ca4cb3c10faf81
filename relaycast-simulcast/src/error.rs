use thiserror::Error;

/// Errors returned by the simulcast engine.
///
/// Only invocation errors travel back to the caller. A destination that fails
/// while relaying is recorded on its `DestinationState` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulcastError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Simulcast already running for stream: {0}")]
    AlreadyRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn relay: {0}")]
    SpawnFailure(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl SimulcastError {
    /// Stable identifier for mapping errors onto a control surface.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotFound(_) => "not_found",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::Connection(_) => "connection_error",
        }
    }
}

pub type SimulcastResult<T> = Result<T, SimulcastError>;

//! Error types for launch-drop

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for launch-drop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for launch-drop
#[derive(Debug, Error)]
pub enum Error {
    /// The graph description could not be turned into a graph
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The configured target stage or its output edge does not exist
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The media runtime itself could not be initialized
    #[error("Failed to initialize media runtime: {0}")]
    Init(String),

    /// The runtime refused a state change
    #[error("State change failed: {0}")]
    State(String),

    /// `start` was called on a driver that already left `NotStarted`
    #[error("Graph has already been started")]
    AlreadyStarted,

    /// `run_until_terminal` was called before `start`
    #[error("Graph has not been started")]
    NotStarted,

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed graph description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to build graph: {message}")]
pub struct BuildError {
    pub message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Target stage or edge missing from a built graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("No stage named '{0}' in graph")]
    Stage(String),

    #[error("Stage '{0}' has no output edge")]
    Edge(String),
}

/// A control signal could not be routed upstream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to send control signal upstream on {edge}: {reason}")]
pub struct SignalDeliveryError {
    pub edge: String,
    pub reason: String,
}

impl SignalDeliveryError {
    pub fn new(edge: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            edge: edge.into(),
            reason: reason.into(),
        }
    }
}

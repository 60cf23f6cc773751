//! Error types for Steno

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Mode;
use crate::network::Listener;

/// Result type for Steno operations
pub type Result<T> = std::result::Result<T, StenoError>;

/// Errors that can occur in Steno
#[derive(Debug, Error)]
pub enum StenoError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cassette file could not be parsed
    #[error("Invalid cassette format: {0}")]
    InvalidFormat(String),

    /// The scenario directory does not exist
    #[error("Scenario directory not found: {}", .0.display())]
    ScenarioNotFound(PathBuf),

    /// A listener port is already bound by another process
    #[error(
        "Port {port} is already in use. Use {} to choose a different port.",
        .listener.cli_option()
    )]
    PortInUse {
        /// Which listener failed to bind
        listener: Listener,
        /// The conflicting port
        port: u16,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request body too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Invalid scenario name
    #[error("Invalid scenario name: {0}")]
    InvalidScenarioName(String),

    /// A header has no value to flatten
    #[error("Cannot flatten header {0} with no value")]
    InvalidHeader(String),

    /// Operation not available in the current mode
    #[error("This request is only valid in {required} mode.")]
    WrongMode {
        /// The mode the operation requires
        required: Mode,
    },

    /// Upstream exchange failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

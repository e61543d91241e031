//! Error types for relaynode

use thiserror::Error;

/// Main error type for relaynode
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process is already running")]
    ProcessAlreadyRunning,

    #[error("Process is not running")]
    ProcessNotRunning,

    #[error("Process is already restarting")]
    ProcessAlreadyRestarting,

    #[error("Process error: {0}")]
    Process(String),

    #[error("Failed to start runner: {0}")]
    FailedToStartRunner(String),

    #[error("Failed to get version: {0}")]
    FailedToGetVersion(String),

    #[error("Failed to parse version")]
    FailedToParseVersion,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stats error: {0}")]
    Stats(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Seed cannot be empty")]
    EmptySeed,
}

/// Result type alias for relaynode
pub type Result<T> = std::result::Result<T, Error>;

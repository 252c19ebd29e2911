use std::fmt;
use thiserror::Error;

/// Category of a configuration failure detected while loading the spec set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    DuplicateName,
    MissingName,
    MissingCommand,
    InvalidMemoryLimit,
    InvalidDateFormat,
    InvalidWorkingDirectory,
    SharedLogPath,
    Unreadable,
    Malformed,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfigErrorKind::DuplicateName => "duplicate name",
            ConfigErrorKind::MissingName => "missing name",
            ConfigErrorKind::MissingCommand => "missing command",
            ConfigErrorKind::InvalidMemoryLimit => "invalid memory limit",
            ConfigErrorKind::InvalidDateFormat => "invalid date format",
            ConfigErrorKind::InvalidWorkingDirectory => "invalid working directory",
            ConfigErrorKind::SharedLogPath => "shared log path",
            ConfigErrorKind::Unreadable => "unreadable file",
            ConfigErrorKind::Malformed => "malformed file",
        };
        f.write_str(label)
    }
}

/// A fatal configuration error. Startup is aborted when one is returned.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Main error type for the shepherd supervisor
#[derive(Debug, Error)]
pub enum ShepherdError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to launch process: {0}")]
    Launch(String),

    #[error("Log I/O error: {0}")]
    RuntimeIo(String),

    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Supervisor not running")]
    DaemonNotRunning,

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShepherdError {
    /// Returns the configuration error kind, if this is a configuration error
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            ShepherdError::Configuration(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Result type alias for shepherd operations
pub type Result<T> = std::result::Result<T, ShepherdError>;

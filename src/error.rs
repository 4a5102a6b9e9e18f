//! Error types for repocate operations.
//!
//! Defines error types for each subsystem:
//! - Container engine access
//! - Container lifecycle orchestration
//! - Capability registry and dependency injection
//! - Plugin execution
//! - Configuration and version control

use std::time::Duration;

use thiserror::Error;

/// What kind of engine object a lookup referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineObject {
    Container,
    Image,
    ExecSession,
}

impl std::fmt::Display for EngineObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineObject::Container => write!(f, "container"),
            EngineObject::Image => write!(f, "image"),
            EngineObject::ExecSession => write!(f, "exec session"),
        }
    }
}

/// Errors reported by a container engine client.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Container engine not available: {0}")]
    Unavailable(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: EngineObject, name: String },

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Engine request '{operation}' failed: {reason}")]
    Request { operation: String, reason: String },

    #[error("Exec attach failed: {0}")]
    ExecAttach(String),
}

impl EngineError {
    /// Returns true when the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// Errors that can occur while driving a container to a desired state.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid container name '{0}'")]
    InvalidName(String),

    #[error("Container '{0}' is not running")]
    NotRunning(String),

    #[error("Interactive session with '{name}' failed: {source}")]
    ExecAttachFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("Operation '{0}' was cancelled")]
    Cancelled(&'static str),
}

/// Errors raised by plugins while configuring or executing.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin '{plugin}' is missing configuration value '{field}'")]
    NotConfigured { plugin: String, field: String },

    #[error("Plugin '{plugin}' received a configuration it does not accept")]
    ConfigMismatch { plugin: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("No secret data found at path: {0}")]
    SecretNotFound(String),

    #[error("Vault request failed ({status}): {message}")]
    Vault { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Container operation failed: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' not found in registry")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' is already registered")]
    DuplicateName { kind: String, name: String },

    #[error("Plugin '{0}' has no recognized configuration shape")]
    UnknownPluginType(String),

    #[error("Plugin '{plugin}' is missing required dependencies: {}", .missing.join(", "))]
    MissingDependency {
        plugin: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine the user configuration directory")]
    NoConfigDir,

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during version control operations.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Cannot derive a repository name from '{0}'")]
    InvalidRepository(String),

    #[error("git {command} failed with exit code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

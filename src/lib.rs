//! repocate: per-repository isolated development containers.
//!
//! This library keeps one named container per repository on a local
//! container engine, and hosts a small registry of pluggable integrations
//! (secret storage, private networking) that can be configured and invoked
//! by name.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod git;
pub mod lifecycle;
pub mod plugins;
pub mod registry;

// Re-export commonly used types
pub use engine::{ContainerEngine, ContainerSpec, ContainerState, DockerEngine};
pub use error::{
    ConfigError, EngineError, LifecycleError, PluginError, RegistryError, VcsError,
};
pub use lifecycle::{LifecycleOrchestrator, OperationContext};
pub use registry::{CapabilityRegistry, RegisterMode, RegistryItem};

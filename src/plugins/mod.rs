//! Pluggable integrations.
//!
//! A plugin is registered by name in the [`CapabilityRegistry`], receives its
//! configuration through dependency injection, and is executed on demand.
//! Configuration is a closed set of shapes: each plugin declares which
//! [`ConfigShape`] it accepts and the registry resolves raw
//! [`Dependencies`] into the matching [`PluginConfig`] variant.
//!
//! [`CapabilityRegistry`]: crate::registry::CapabilityRegistry

pub mod tailscale;
pub mod vault;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, RegistryError};

pub use tailscale::TailscalePlugin;
pub use vault::VaultPlugin;

/// Sidecar container name used when none is configured.
pub const DEFAULT_SIDECAR_CONTAINER: &str = "tailscale-sidecar";

/// A capability that can be configured and invoked through the registry.
///
/// Implementations use interior mutability so the registry can hand out
/// shared handles and run `execute` without holding its own locks.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// The configuration shape this plugin accepts. `None` means the plugin
    /// cannot receive injected dependencies.
    fn config_shape(&self) -> Option<ConfigShape> {
        None
    }

    /// Applies a resolved configuration.
    fn configure(&self, config: PluginConfig) -> Result<(), PluginError>;

    fn is_configured(&self) -> bool;

    /// Runs the plugin and returns a one-line summary of what it did.
    async fn execute(&self) -> Result<String, PluginError>;
}

/// The closed set of configuration shapes a plugin may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigShape {
    /// Secret store access (Vault).
    SecretStore,
    /// Private network sidecar (Tailscale).
    PrivateNetwork,
}

impl ConfigShape {
    /// Values that must be present for the shape to resolve.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            ConfigShape::SecretStore => &["address"],
            ConfigShape::PrivateNetwork => &["auth_key", "service_name"],
        }
    }

    /// Builds the typed configuration for `plugin` from raw dependencies.
    ///
    /// # Errors
    ///
    /// `MissingDependency` lists every required value that is absent or
    /// empty. Malformed optional values are reported as `InvalidValue`.
    pub fn resolve(self, plugin: &str, deps: &Dependencies) -> Result<PluginConfig, RegistryError> {
        let missing: Vec<String> = self
            .required_fields()
            .iter()
            .enumerate()
            .filter(|(index, field)| deps.lookup(field, Some(*index)).is_none())
            .map(|(_, field)| field.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingDependency {
                plugin: plugin.to_string(),
                missing,
            });
        }

        let config = match self {
            ConfigShape::SecretStore => PluginConfig::SecretStore(VaultSettings {
                address: required(deps, "address", 0),
                token: deps.lookup("token", None).map(str::to_string),
                role_id: deps.lookup("role_id", None).map(str::to_string),
                secret_id: deps.lookup("secret_id", None).map(str::to_string),
                secret_path: deps.lookup("secret_path", None).map(str::to_string),
            }),
            ConfigShape::PrivateNetwork => PluginConfig::PrivateNetwork(TailscaleSettings {
                auth_key: required(deps, "auth_key", 0),
                service_name: required(deps, "service_name", 1),
                exit_node: deps.lookup("exit_node", None).map(str::to_string),
                funnel: deps.flag("funnel")?,
                serve: deps.flag("serve")?,
                container: deps
                    .lookup("container", None)
                    .unwrap_or(DEFAULT_SIDECAR_CONTAINER)
                    .to_string(),
                compose_file: deps.lookup("compose_file", None).map(PathBuf::from),
            }),
        };
        Ok(config)
    }
}

/// Reads a required value that `resolve` has already checked for presence.
fn required(deps: &Dependencies, field: &str, index: usize) -> String {
    deps.lookup(field, Some(index)).unwrap_or_default().to_string()
}

impl std::fmt::Display for ConfigShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigShape::SecretStore => write!(f, "secret-store"),
            ConfigShape::PrivateNetwork => write!(f, "private-network"),
        }
    }
}

/// Resolved configuration routed to a plugin's `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginConfig {
    SecretStore(VaultSettings),
    PrivateNetwork(TailscaleSettings),
}

impl PluginConfig {
    pub fn shape(&self) -> ConfigShape {
        match self {
            PluginConfig::SecretStore(_) => ConfigShape::SecretStore,
            PluginConfig::PrivateNetwork(_) => ConfigShape::PrivateNetwork,
        }
    }
}

/// Vault connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Server address, e.g. `http://vault:8200`.
    pub address: String,
    pub token: Option<String>,
    /// AppRole credentials, used when no token is set.
    pub role_id: Option<String>,
    pub secret_id: Option<String>,
    /// Secret to read on execute; without it the plugin only checks health.
    pub secret_path: Option<String>,
}

/// Tailscale sidecar settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailscaleSettings {
    pub auth_key: String,
    /// Service (container) whose network namespace the sidecar joins.
    pub service_name: String,
    pub exit_node: Option<String>,
    pub funnel: bool,
    pub serve: bool,
    /// Sidecar container name.
    pub container: String,
    /// Compose file to add the sidecar service to.
    pub compose_file: Option<PathBuf>,
}

/// Raw values handed to dependency injection.
///
/// Required values may be given positionally or by name; optional values
/// are only accepted by name. Named values win over positional ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    positional: Vec<String>,
    named: BTreeMap<String, String>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds dependencies from positional values only.
    pub fn positional<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }

    pub fn with_positional(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn with_named(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Adds a named value only when `value` is present.
    pub fn with_optional(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with_named(key, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Looks up a non-empty value by name, then by position. A blank named
    /// value does not hide a positional one.
    pub fn lookup(&self, key: &str, index: Option<usize>) -> Option<&str> {
        let present = |v: &&String| !v.trim().is_empty();
        self.named
            .get(key)
            .filter(present)
            .or_else(|| index.and_then(|i| self.positional.get(i)).filter(present))
            .map(String::as_str)
    }

    /// Parses a named boolean; absent means false.
    fn flag(&self, key: &str) -> Result<bool, RegistryError> {
        match self.lookup(key, None) {
            None => Ok(false),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(PluginError::InvalidValue {
                    field: key.to_string(),
                    reason: format!("expected a boolean, got '{raw}'"),
                }
                .into()),
            },
        }
    }
}

//! Tailscale private-network sidecar plugin.
//!
//! Attaches a `tailscale/tailscale` container to an existing service so the
//! service becomes reachable on the tailnet. The sidecar shares the
//! service's network namespace, both in the compose file (when one is
//! configured) and in the container started through the orchestrator.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::{ConfigShape, Plugin, PluginConfig, TailscaleSettings};
use crate::engine::ContainerSpec;
use crate::error::PluginError;
use crate::lifecycle::{LifecycleOrchestrator, OperationContext};

/// Registry name of the plugin.
pub const PLUGIN_NAME: &str = "tailscale";

/// Image used for the sidecar.
pub const TAILSCALE_IMAGE: &str = "tailscale/tailscale:latest";

/// Label marking a container as a tailscale sidecar.
pub const SIDECAR_LABEL: &str = "repocate.sidecar";

/// Upper bound for bringing the sidecar up, including the image pull.
const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(300);

/// Sidecar service entry written into a compose file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarService {
    pub image: String,
    pub container_name: String,
    pub network_mode: String,
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl SidecarService {
    pub fn from_settings(settings: &TailscaleSettings) -> Self {
        Self {
            image: TAILSCALE_IMAGE.to_string(),
            container_name: settings.container.clone(),
            network_mode: format!("service:{}", settings.service_name),
            environment: sidecar_env(settings),
            cap_add: vec!["NET_ADMIN".to_string()],
            labels: sidecar_labels(settings),
        }
    }
}

/// Runs a tailscale sidecar next to a service.
pub struct TailscalePlugin {
    orchestrator: Arc<LifecycleOrchestrator>,
    settings: RwLock<Option<TailscaleSettings>>,
    timeout: Duration,
}

impl TailscalePlugin {
    pub fn new(orchestrator: Arc<LifecycleOrchestrator>) -> Self {
        Self {
            orchestrator,
            settings: RwLock::new(None),
            timeout: DEFAULT_EXECUTE_TIMEOUT,
        }
    }

    /// Limits how long `execute` may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn settings(&self) -> Result<TailscaleSettings, PluginError> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PluginError::NotConfigured {
                plugin: PLUGIN_NAME.to_string(),
                field: "auth_key".to_string(),
            })
    }

    /// Container spec for the sidecar.
    pub fn sidecar_spec(settings: &TailscaleSettings) -> ContainerSpec {
        let mut spec = ContainerSpec::new(&settings.container, TAILSCALE_IMAGE)
            .with_network_mode(format!("container:{}", settings.service_name))
            .with_tty(false);
        for (key, value) in sidecar_env(settings) {
            spec = spec.with_env(key, value);
        }
        for (key, value) in sidecar_labels(settings) {
            spec = spec.with_label(key, value);
        }
        spec
    }
}

#[async_trait]
impl Plugin for TailscalePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn config_shape(&self) -> Option<ConfigShape> {
        Some(ConfigShape::PrivateNetwork)
    }

    fn configure(&self, config: PluginConfig) -> Result<(), PluginError> {
        let PluginConfig::PrivateNetwork(settings) = config else {
            return Err(PluginError::ConfigMismatch {
                plugin: PLUGIN_NAME.to_string(),
            });
        };
        if settings.container == settings.service_name {
            return Err(PluginError::InvalidValue {
                field: "container".to_string(),
                reason: "sidecar cannot share the service's name".to_string(),
            });
        }

        debug!(service = %settings.service_name, sidecar = %settings.container, "Tailscale plugin configured");
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Some(settings);
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn execute(&self) -> Result<String, PluginError> {
        let settings = self.settings()?;

        if let Some(compose_file) = &settings.compose_file {
            add_sidecar_to_compose_file(compose_file, &settings).await?;
            info!(file = %compose_file.display(), sidecar = %settings.container, "Compose file updated");
        }

        let ctx = OperationContext::new().with_timeout(self.timeout);
        let spec = Self::sidecar_spec(&settings);
        let state = self.orchestrator.ensure_container(&spec, &ctx).await?;

        info!(sidecar = %settings.container, service = %settings.service_name, %state, "Tailscale sidecar ready");
        Ok(format!(
            "sidecar '{}' is {state} on the network of '{}'",
            settings.container, settings.service_name
        ))
    }
}

fn sidecar_env(settings: &TailscaleSettings) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TS_AUTHKEY".to_string(), settings.auth_key.clone());
    env.insert("TS_HOSTNAME".to_string(), settings.service_name.clone());
    env.insert("TS_STATE_DIR".to_string(), "/var/lib/tailscale".to_string());
    if let Some(node) = &settings.exit_node {
        env.insert("TS_EXTRA_ARGS".to_string(), format!("--exit-node={node}"));
    }
    env
}

fn sidecar_labels(settings: &TailscaleSettings) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(SIDECAR_LABEL.to_string(), settings.service_name.clone());
    if settings.serve {
        labels.insert("repocate.tailscale.serve".to_string(), "true".to_string());
    }
    if settings.funnel {
        labels.insert("repocate.tailscale.funnel".to_string(), "true".to_string());
    }
    labels
}

/// Inserts (or replaces) the sidecar service in a parsed compose document.
///
/// Every other key of the document is preserved as-is.
pub fn add_sidecar(compose: &mut Mapping, settings: &TailscaleSettings) -> Result<(), PluginError> {
    let services = compose
        .entry(Value::from("services"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if services.is_null() {
        *services = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(services) = services else {
        return Err(PluginError::InvalidValue {
            field: "services".to_string(),
            reason: "compose 'services' is not a mapping".to_string(),
        });
    };

    if !services.contains_key(settings.service_name.as_str()) {
        return Err(PluginError::InvalidValue {
            field: "service_name".to_string(),
            reason: format!("no service '{}' in compose file", settings.service_name),
        });
    }

    let sidecar = serde_yaml::to_value(SidecarService::from_settings(settings))?;
    services.insert(Value::from(settings.container.as_str()), sidecar);
    Ok(())
}

/// Reads, edits and rewrites a compose file.
pub async fn add_sidecar_to_compose_file(
    path: &Path,
    settings: &TailscaleSettings,
) -> Result<(), PluginError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut compose: Mapping = if contents.trim().is_empty() {
        Mapping::new()
    } else {
        serde_yaml::from_str(&contents)?
    };

    add_sidecar(&mut compose, settings)?;

    tokio::fs::write(path, serde_yaml::to_string(&compose)?).await?;
    Ok(())
}

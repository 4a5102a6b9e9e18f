//! HashiCorp Vault secret-store plugin.
//!
//! Talks to the Vault HTTP API directly: AppRole login, logical reads and
//! the health endpoint.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ConfigShape, Plugin, PluginConfig, VaultSettings};
use crate::error::PluginError;

/// Registry name of the plugin.
pub const PLUGIN_NAME: &str = "vault";

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Response of `GET /v1/sys/health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub version: String,
}

/// Reads secrets from a Vault server.
pub struct VaultPlugin {
    http_client: Client,
    settings: RwLock<Option<VaultSettings>>,
}

impl Default for VaultPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultPlugin {
    pub fn new() -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            settings: RwLock::new(None),
        }
    }

    /// A plugin that is already configured.
    pub fn with_settings(settings: VaultSettings) -> Self {
        let plugin = Self::new();
        *plugin.settings.write().unwrap_or_else(PoisonError::into_inner) = Some(settings);
        plugin
    }

    fn settings(&self) -> Result<VaultSettings, PluginError> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PluginError::NotConfigured {
                plugin: PLUGIN_NAME.to_string(),
                field: "address".to_string(),
            })
    }

    /// Resolves the token to use: a configured token, or an AppRole login.
    async fn token(&self, settings: &VaultSettings) -> Result<Option<String>, PluginError> {
        if let Some(token) = &settings.token {
            return Ok(Some(token.clone()));
        }
        match (&settings.role_id, &settings.secret_id) {
            (Some(role_id), Some(secret_id)) => {
                Ok(Some(self.login(settings, role_id, secret_id).await?))
            }
            _ => Ok(None),
        }
    }

    async fn login(
        &self,
        settings: &VaultSettings,
        role_id: &str,
        secret_id: &str,
    ) -> Result<String, PluginError> {
        let url = api_url(&settings.address, "auth/approle/login");
        debug!(%url, "Authenticating with AppRole");

        let response = self
            .http_client
            .post(&url)
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::Vault {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let login: LoginResponse = response.json().await?;
        info!("Authenticated with Vault using AppRole");
        Ok(login.auth.client_token)
    }

    /// Reads the secret at `path` (e.g. `secret/data/app`).
    ///
    /// KV version 2 responses are unwrapped so callers always get the
    /// secret's key/value pairs.
    ///
    /// # Errors
    ///
    /// `SecretNotFound` when Vault has nothing at `path`.
    pub async fn read_secret(&self, path: &str) -> Result<BTreeMap<String, Value>, PluginError> {
        let settings = self.settings()?;
        let token = self.token(&settings).await?;

        let url = api_url(&settings.address, path);
        let mut request = self.http_client.get(&url);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PluginError::SecretNotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::Vault {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let body: Value = response.json().await?;
        secret_data(body).ok_or_else(|| PluginError::SecretNotFound(path.to_string()))
    }

    /// Queries the server's health endpoint.
    pub async fn health(&self) -> Result<HealthStatus, PluginError> {
        let settings = self.settings()?;
        let url = api_url(&settings.address, "sys/health");

        // Standby, sealed and uninitialized servers answer with non-2xx codes
        // but still carry a health body.
        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| PluginError::Vault {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

#[async_trait]
impl Plugin for VaultPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn config_shape(&self) -> Option<ConfigShape> {
        Some(ConfigShape::SecretStore)
    }

    fn configure(&self, config: PluginConfig) -> Result<(), PluginError> {
        let PluginConfig::SecretStore(settings) = config else {
            return Err(PluginError::ConfigMismatch {
                plugin: PLUGIN_NAME.to_string(),
            });
        };
        if !settings.address.starts_with("http://") && !settings.address.starts_with("https://") {
            return Err(PluginError::InvalidValue {
                field: "address".to_string(),
                reason: format!("'{}' is not an http(s) URL", settings.address),
            });
        }

        debug!(address = %settings.address, "Vault plugin configured");
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

        match &settings.secret_path {
            Some(path) => {
                let data = self.read_secret(path).await?;
                let keys: Vec<&str> = data.keys().map(String::as_str).collect();
                info!(%path, keys = keys.len(), "Read secret from Vault");
                Ok(format!("read {} key(s) from {path}: {}", keys.len(), keys.join(", ")))
            }
            None => {
                let health = self.health().await?;
                info!(
                    address = %settings.address,
                    sealed = health.sealed,
                    version = %health.version,
                    "Vault health checked"
                );
                let state = if !health.initialized {
                    "uninitialized"
                } else if health.sealed {
                    "sealed"
                } else if health.standby {
                    "standby"
                } else {
                    "active"
                };
                Ok(format!("vault at {} is {state} ({})", settings.address, health.version))
            }
        }
    }
}

/// Joins `path` onto the `v1` API root of `address`.
fn api_url(address: &str, path: &str) -> String {
    format!(
        "{}/v1/{}",
        address.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Extracts key/value pairs from a logical read response.
fn secret_data(body: Value) -> Option<BTreeMap<String, Value>> {
    let Value::Object(mut data) = body.get("data")?.clone() else {
        return None;
    };

    // KV v2 wraps the secret in data.data alongside data.metadata.
    if data.contains_key("metadata") {
        if let Some(Value::Object(inner)) = data.remove("data") {
            data = inner;
        } else {
            return None;
        }
    }

    if data.is_empty() {
        None
    } else {
        Some(data.into_iter().collect())
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join("; "),
        _ if body.trim().is_empty() => "empty response".to_string(),
        _ => body.trim().to_string(),
    }
}

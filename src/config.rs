//! User configuration for repocate.
//!
//! Stored as JSON at `<config dir>/repocate/repocate.json`. Every field has a
//! default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{ContainerSpec, Mount};
use crate::error::ConfigError;

/// Name of the configuration file.
pub const CONFIG_FILENAME: &str = "repocate.json";

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "cdaprod/repocate-dev:1.0.0-arm64";

/// Container used when no repository is given.
pub const DEFAULT_CONTAINER: &str = "repocate-default";

/// Prefix of per-repository container names.
pub const CONTAINER_PREFIX: &str = "repocate-";

/// Label carrying the repository a container belongs to.
pub const REPO_LABEL: &str = "repocate.repo";

/// Persistent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepocateConfig {
    /// Directory holding cloned repositories.
    pub workspace_dir: PathBuf,
    /// Image every environment container is created from.
    pub image: String,
    /// Interactive shell started by `enter`.
    pub shell: Vec<String>,
    /// Mount point of repositories inside containers.
    pub container_workdir: String,
    /// Grace period for `stop` before the engine kills the container.
    pub stop_timeout_secs: u64,
}

impl Default for RepocateConfig {
    fn default() -> Self {
        Self {
            workspace_dir: dirs::home_dir()
                .map(|home| home.join("repocate"))
                .unwrap_or_else(|| PathBuf::from("repocate")),
            image: DEFAULT_IMAGE.to_string(),
            shell: vec!["/bin/zsh".to_string()],
            container_workdir: "/workspace".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl RepocateConfig {
    /// `<config dir>/repocate/repocate.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("repocate").join(CONFIG_FILENAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Loads from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Writes the config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Host path of a repository in the workspace.
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.workspace_dir.join(repo)
    }

    /// Desired container for a repository: the repo is mounted at
    /// `<container_workdir>/<repo>` and used as the working directory.
    pub fn repo_container_spec(&self, repo: &str) -> ContainerSpec {
        let target = format!("{}/{}", self.container_workdir.trim_end_matches('/'), repo);
        ContainerSpec::new(container_name_for(repo), &self.image)
            .with_command(self.shell.iter().cloned())
            .with_mount(Mount::new(self.repo_path(repo), &target))
            .with_working_dir(target)
            .with_label(REPO_LABEL, repo)
    }

    /// Desired state of the default container.
    pub fn default_container_spec(&self) -> ContainerSpec {
        ContainerSpec::new(DEFAULT_CONTAINER, &self.image).with_command(self.shell.iter().cloned())
    }
}

/// Container name for a repository.
pub fn container_name_for(repo: &str) -> String {
    format!("{CONTAINER_PREFIX}{repo}")
}

//! Container engine access for repocate.
//!
//! The orchestrator never talks to the engine transport directly. Everything
//! goes through the [`ContainerEngine`] trait so that the Docker-backed client
//! and in-memory fakes are interchangeable.
//!
//! # Example
//!
//! ```ignore
//! use repocate::engine::{ContainerEngine, ContainerFilter, DockerEngine};
//!
//! let engine = DockerEngine::connect()?;
//! let found = engine
//!     .list_containers(&ContainerFilter::by_name("repocate-default"))
//!     .await?;
//! ```

pub mod docker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::error::EngineError;

pub use docker::DockerEngine;

/// Label attached to every container created by repocate.
pub const MANAGED_LABEL: &str = "repocate.managed";

/// A host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub container_path: String,
    /// Whether the container sees the bind read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Renders the bind in `host:container[:ro]` form.
    pub fn bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Desired configuration for a named container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Unique container name within the engine namespace.
    pub name: String,
    /// Image reference the container is created from.
    pub image: String,
    /// Command to run; empty means the image default.
    pub command: Vec<String>,
    /// Host bind mounts.
    pub mounts: Vec<Mount>,
    /// Environment variables in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Extra labels. The managed label is always added on create.
    pub labels: BTreeMap<String, String>,
    /// Network mode (e.g. `bridge`, `container:<name>`).
    pub network_mode: Option<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Allocate a TTY and keep stdin open.
    pub tty: bool,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image and no command.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            mounts: Vec::new(),
            env: Vec::new(),
            labels: BTreeMap::new(),
            network_mode: None,
            working_dir: None,
            tty: true,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env.push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Labels as sent to the engine, including the managed marker.
    pub fn engine_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels
    }
}

/// Lifecycle state of a named container, derived from the engine on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Absent,
    Created,
    Running,
    Stopped,
}

impl ContainerState {
    /// Maps an engine state string (`created`, `running`, `exited`, ...).
    pub fn from_engine_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" | "restarting" | "paused" => ContainerState::Running,
            _ => ContainerState::Stopped,
        }
    }

    pub fn is_running(self) -> bool {
        self == ContainerState::Running
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Absent => "absent",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Live view of a container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the engine, possibly with a leading `/`.
    pub names: Vec<String>,
    pub image: String,
    /// Raw engine state (`running`, `exited`, ...).
    pub state: String,
    /// Human-readable status (`Up 3 minutes`).
    pub status: String,
    /// Creation time in unix seconds.
    pub created: i64,
}

impl ContainerSummary {
    /// Exact name match, ignoring the engine's leading slash.
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
    }

    /// First name without the leading slash.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.strip_prefix('/').unwrap_or(n))
            .unwrap_or(self.id.as_str())
    }

    pub fn lifecycle_state(&self) -> ContainerState {
        ContainerState::from_engine_state(&self.state)
    }

    /// Paused containers count as running but cannot host a new exec
    /// session until they are unpaused.
    pub fn is_paused(&self) -> bool {
        self.state.eq_ignore_ascii_case("paused")
    }
}

/// Filter passed to [`ContainerEngine::list_containers`]. Stopped containers
/// are always included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Exact container name.
    pub name: Option<String>,
    /// Labels in `key` or `key=value` form; all must match.
    pub labels: Vec<String>,
}

impl ContainerFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            labels: Vec::new(),
        }
    }

    pub fn managed() -> Self {
        Self {
            name: None,
            labels: vec![format!("{MANAGED_LABEL}=true")],
        }
    }
}

/// One progress record from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
    /// Layer id the record refers to, if any.
    pub layer: Option<String>,
}

/// Stream of pull progress. Dropping it aborts the pull.
pub type PullStream = BoxStream<'static, Result<PullProgress, EngineError>>;

/// A chunk of output from an exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Bidirectional byte stream bridged to an exec session.
pub struct ExecSession {
    /// Output from the remote process. Ends when the process exits.
    pub output: BoxStream<'static, Result<ExecOutput, EngineError>>,
    /// Writer feeding the remote process's stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").finish_non_exhaustive()
    }
}

/// Capability interface over a local container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Lists containers (running or not) matching the filter.
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Checks whether an image is present locally.
    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError>;

    /// Starts pulling an image; progress is streamed as it arrives.
    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Resumes a paused container.
    async fn unpause_container(&self, id: &str) -> Result<(), EngineError>;

    /// Requests a graceful stop; the engine kills the container after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Prepares an exec session and returns its id.
    async fn exec_create(
        &self,
        id: &str,
        cmd: &[String],
        tty: bool,
    ) -> Result<String, EngineError>;

    /// Starts and attaches to a previously created exec session.
    async fn exec_attach(&self, session_id: &str) -> Result<ExecSession, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_bind_spec() {
        let rw = Mount::new("/home/dev/ws/app", "/workspace/app");
        assert_eq!(rw.bind_spec(), "/home/dev/ws/app:/workspace/app");

        let ro = Mount::new("/etc/gitconfig", "/etc/gitconfig").read_only();
        assert_eq!(ro.bind_spec(), "/etc/gitconfig:/etc/gitconfig:ro");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            ContainerState::from_engine_state("created"),
            ContainerState::Created
        );
        assert_eq!(
            ContainerState::from_engine_state("running"),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_engine_state("paused"),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_engine_state("exited"),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_engine_state("dead"),
            ContainerState::Stopped
        );
    }

    #[test]
    fn test_summary_name_matching() {
        let summary = ContainerSummary {
            id: "abc123".to_string(),
            names: vec!["/repocate-default".to_string()],
            image: "dev:v1".to_string(),
            state: "running".to_string(),
            status: "Up 2 minutes".to_string(),
            created: 0,
        };

        assert!(summary.has_name("repocate-default"));
        assert!(!summary.has_name("repocate-default-2"));
        assert!(!summary.has_name("repocate"));
        assert_eq!(summary.display_name(), "repocate-default");
        assert_eq!(summary.lifecycle_state(), ContainerState::Running);
        assert!(!summary.is_paused());

        let paused = ContainerSummary {
            state: "paused".to_string(),
            ..summary
        };
        assert_eq!(paused.lifecycle_state(), ContainerState::Running);
        assert!(paused.is_paused());
    }

    #[test]
    fn test_spec_builder_adds_managed_label() {
        let spec = ContainerSpec::new("repocate-app", "dev:v1")
            .with_command(["/bin/zsh"])
            .with_env("TERM", "xterm-256color")
            .with_label("repocate.repo", "app");

        assert_eq!(spec.command, vec!["/bin/zsh".to_string()]);
        assert_eq!(spec.env, vec!["TERM=xterm-256color".to_string()]);
        assert!(spec.tty);

        let labels = spec.engine_labels();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get("repocate.repo").map(String::as_str), Some("app"));
        assert!(!spec.labels.contains_key(MANAGED_LABEL));
    }

    #[test]
    fn test_managed_filter() {
        let filter = ContainerFilter::managed();
        assert!(filter.name.is_none());
        assert_eq!(filter.labels, vec!["repocate.managed=true".to_string()]);
    }
}

//! Docker engine client built on the bollard crate.
//!
//! Maps the [`ContainerEngine`] operations onto the Docker Engine API. Engine
//! errors are classified so that callers can tell "object missing" apart
//! from "daemon unreachable".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use super::{
    ContainerEngine, ContainerFilter, ContainerSpec, ContainerSummary, ExecOutput, ExecSession,
    PullProgress, PullStream,
};
use crate::error::{EngineError, EngineObject};

/// Docker-backed implementation of [`ContainerEngine`].
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Creates a client for the local Docker daemon (socket or `DOCKER_HOST`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if the client cannot be configured.
    /// Reachability is only checked on the first request or by [`Self::ping`].
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Verifies that the daemon answers.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Sorts a bollard error into the engine taxonomy.
fn classify(operation: &str, kind: EngineObject, name: &str, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            kind,
            name: name.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Request {
            operation: operation.to_string(),
            reason: format!("{status_code}: {message}"),
        },
        other => EngineError::Unavailable(format!("{operation}: {other}")),
    }
}

fn summary_from_model(model: bollard::models::ContainerSummary) -> ContainerSummary {
    ContainerSummary {
        id: model.id.unwrap_or_default(),
        names: model.names.unwrap_or_default(),
        image: model.image.unwrap_or_default(),
        state: model.state.unwrap_or_default(),
        status: model.status.unwrap_or_default(),
        created: model.created.unwrap_or_default(),
    }
}

/// Builds the engine-side list filters.
fn list_filters(filter: &ContainerFilter) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if let Some(name) = &filter.name {
        // The name filter is a regex over "/name"; callers still match exactly.
        filters.insert("name".to_string(), vec![format!("^/{name}$")]);
    }
    if !filter.labels.is_empty() {
        filters.insert("label".to_string(), filter.labels.clone());
    }
    filters
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: list_filters(filter),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify("list containers", EngineObject::Container, "*", e))?;

        Ok(containers.into_iter().map(summary_from_model).collect())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) => match classify("inspect image", EngineObject::Image, reference, e) {
                EngineError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError> {
        let docker = self.docker.clone();
        let image = reference.to_string();

        let stream = async_stream::try_stream! {
            let options = CreateImageOptions::<String> {
                from_image: image.clone(),
                ..Default::default()
            };
            let mut pull = docker.create_image(Some(options), None, None);

            while let Some(item) = pull.next().await {
                let info = item.map_err(|e| EngineError::PullFailed {
                    image: image.clone(),
                    reason: e.to_string(),
                })?;

                if let Some(reason) = info.error {
                    Err(EngineError::PullFailed {
                        image: image.clone(),
                        reason,
                    })?;
                }

                yield PullProgress {
                    status: info.status.unwrap_or_default(),
                    progress: info.progress,
                    layer: info.id,
                };
            }
        };

        Ok(Box::pin(stream))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let host_config = HostConfig {
            binds: if spec.mounts.is_empty() {
                None
            } else {
                Some(spec.mounts.iter().map(|m| m.bind_spec()).collect())
            },
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.engine_labels().into_iter().collect()),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            tty: Some(spec.tty),
            open_stdin: Some(spec.tty),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| classify("create container", EngineObject::Image, &spec.image, e))?;

        for warning in &response.warnings {
            debug!(container = %spec.name, %warning, "Engine warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify("start container", EngineObject::Container, id, e))?;

        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| classify("unpause container", EngineObject::Container, id, e))?;

        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify("stop container", EngineObject::Container, id, e)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify("remove container", EngineObject::Container, id, e))?;

        Ok(())
    }

    async fn exec_create(
        &self,
        id: &str,
        cmd: &[String],
        tty: bool,
    ) -> Result<String, EngineError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            env: tty.then(|| vec!["TERM=xterm-256color".to_string()]),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| classify("create exec", EngineObject::Container, id, e))?;

        Ok(exec.id)
    }

    async fn exec_attach(&self, session_id: &str) -> Result<ExecSession, EngineError> {
        let info = self
            .docker
            .inspect_exec(session_id)
            .await
            .map_err(|e| classify("inspect exec", EngineObject::ExecSession, session_id, e))?;
        let tty = info
            .process_config
            .and_then(|p| p.tty)
            .unwrap_or(false);

        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };

        let started = self
            .docker
            .start_exec(session_id, Some(options))
            .await
            .map_err(|e| classify("start exec", EngineObject::ExecSession, session_id, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .filter_map(|chunk| async move {
                        match chunk {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(ExecOutput::Stdout(message.to_vec())))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(ExecOutput::Stderr(message.to_vec())))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(EngineError::ExecAttach(e.to_string()))),
                        }
                    })
                    .boxed();

                Ok(ExecSession { output, input })
            }
            StartExecResults::Detached => Err(EngineError::ExecAttach(format!(
                "exec session {session_id} started detached"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filters_by_name() {
        let filters = list_filters(&ContainerFilter::by_name("repocate-app"));
        assert_eq!(
            filters.get("name"),
            Some(&vec!["^/repocate-app$".to_string()])
        );
        assert!(!filters.contains_key("label"));
    }

    #[test]
    fn test_list_filters_managed() {
        let filters = list_filters(&ContainerFilter::managed());
        assert!(!filters.contains_key("name"));
        assert_eq!(
            filters.get("label"),
            Some(&vec!["repocate.managed=true".to_string()])
        );
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(
            "start container",
            EngineObject::Container,
            "repocate-app",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_server_error() {
        let err = classify(
            "create container",
            EngineObject::Image,
            "dev:v1",
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "Conflict".to_string(),
            },
        );
        assert!(matches!(err, EngineError::Request { .. }));
        assert!(err.to_string().contains("409"));
    }

    #[test]
    fn test_summary_from_model_defaults() {
        let summary = summary_from_model(bollard::models::ContainerSummary {
            id: Some("abc".to_string()),
            names: Some(vec!["/repocate-app".to_string()]),
            state: Some("exited".to_string()),
            ..Default::default()
        });

        assert_eq!(summary.id, "abc");
        assert!(summary.has_name("repocate-app"));
        assert_eq!(summary.image, "");
        assert_eq!(summary.created, 0);
    }
}

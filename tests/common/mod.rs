//! In-memory container engine for integration tests.
//!
//! Tracks containers and images in a map and counts every call so tests can
//! assert exactly which engine operations an orchestrator call issued.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use repocate::engine::{
    ContainerEngine, ContainerFilter, ContainerSpec, ContainerSummary, ExecOutput, ExecSession,
    PullProgress, PullStream,
};
use repocate::error::{EngineError, EngineObject};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: BTreeMap<String, String>,
    pub spec: ContainerSpec,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    calls: Vec<&'static str>,
}

/// Configurable fake engine.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
    unavailable: bool,
    pull_failure: Option<String>,
    pull_records: usize,
    list_delay: Option<Duration>,
    pull_delay: Option<Duration>,
    exec_output: Vec<u8>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            pull_records: 3,
            ..Self::default()
        }
    }

    /// Every call fails as if the daemon were down.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new()
        }
    }

    pub fn with_image(self, reference: &str) -> Self {
        self.lock().images.insert(reference.to_string());
        self
    }

    /// Seeds a container in the given raw engine state.
    pub fn with_container(self, name: &str, image: &str, state: &str) -> Self {
        let container = FakeContainer {
            id: new_id(),
            name: name.to_string(),
            image: image.to_string(),
            state: state.to_string(),
            labels: BTreeMap::new(),
            spec: ContainerSpec::new(name, image),
        };
        self.lock()
            .containers
            .insert(container.id.clone(), container);
        self
    }

    /// Pulls emit one record and then fail with `reason`.
    pub fn with_pull_failure(mut self, reason: &str) -> Self {
        self.pull_failure = Some(reason.to_string());
        self
    }

    /// Widens the check-then-act window of every list call.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Delays each pull progress record.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = Some(delay);
        self
    }

    pub fn with_exec_output(mut self, output: &[u8]) -> Self {
        self.exec_output = output.to_vec();
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: &'static str) -> Result<(), EngineError> {
        self.lock().calls.push(call);
        if self.unavailable {
            return Err(EngineError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Number of times `call` was invoked.
    pub fn calls(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn call_log(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.lock().images.contains(reference)
    }

    fn not_found(id: &str) -> EngineError {
        EngineError::NotFound {
            kind: EngineObject::Container,
            name: id.to_string(),
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record("list_containers")?;
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| filter.name.as_ref().map_or(true, |n| &c.name == n))
            .filter(|c| {
                filter.labels.iter().all(|label| match label.split_once('=') {
                    Some((k, v)) => c.labels.get(k).map(String::as_str) == Some(v),
                    None => c.labels.contains_key(label),
                })
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: c.image.clone(),
                state: c.state.clone(),
                status: c.state.clone(),
                created: 1_700_000_000,
            })
            .collect())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        self.record("image_exists")?;
        Ok(self.lock().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError> {
        self.record("pull_image")?;

        let image = reference.to_string();
        let mut records: Vec<Result<PullProgress, EngineError>> = (0..self.pull_records)
            .map(|i| {
                Ok(PullProgress {
                    status: "Downloading".to_string(),
                    progress: Some(format!("{}/{}", i + 1, self.pull_records)),
                    layer: Some(format!("layer{i}")),
                })
            })
            .collect();

        match &self.pull_failure {
            Some(reason) => {
                records.truncate(1);
                records.push(Err(EngineError::PullFailed {
                    image,
                    reason: reason.clone(),
                }));
            }
            None => {
                self.lock().images.insert(image);
            }
        }

        let delay = self.pull_delay;
        Ok(stream::iter(records)
            .then(move |record| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                record
            })
            .boxed())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record("create_container")?;

        let mut state = self.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Request {
                operation: "create container".to_string(),
                reason: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound {
                kind: EngineObject::Image,
                name: spec.image.clone(),
            });
        }

        let id = new_id();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "created".to_string(),
                labels: spec.engine_labels(),
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record("start_container")?;
        let mut state = self.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.state = "running".to_string();
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.record("unpause_container")?;
        let mut state = self.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        self.record("stop_container")?;
        let mut state = self.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.state = "exited".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.record("remove_container")?;
        let mut state = self.lock();
        let container = state.containers.get(id).ok_or_else(|| Self::not_found(id))?;
        if container.state == "running" && !force {
            return Err(EngineError::Request {
                operation: "remove container".to_string(),
                reason: "cannot remove a running container".to_string(),
            });
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn exec_create(
        &self,
        id: &str,
        _cmd: &[String],
        _tty: bool,
    ) -> Result<String, EngineError> {
        self.record("exec_create")?;
        match self.lock().containers.get(id) {
            None => Err(Self::not_found(id)),
            Some(c) if c.state == "paused" => Err(EngineError::Request {
                operation: "create exec".to_string(),
                reason: format!("Container {id} is paused, unpause the container before exec"),
            }),
            Some(_) => Ok(format!("exec-{id}")),
        }
    }

    async fn exec_attach(&self, _session_id: &str) -> Result<ExecSession, EngineError> {
        self.record("exec_attach")?;
        let output = if self.exec_output.is_empty() {
            Vec::new()
        } else {
            vec![Ok(ExecOutput::Stdout(self.exec_output.clone()))]
        };
        Ok(ExecSession {
            output: stream::iter(output).boxed(),
            input: Box::pin(tokio::io::sink()),
        })
    }
}

//! Container lifecycle orchestration.
//!
//! The orchestrator computes and executes the engine calls needed to bring a
//! named container to the desired state. State is never cached: every call
//! starts by asking the engine.
//!
//! # Architecture
//!
//! Per-name state transitions:
//! ```text
//! Absent → [pull image if needed] → Created → Running ⇄ Stopped → Absent (on remove)
//! ```
//!
//! Callers for the same name are serialized through [`NameLocks`] so that the
//! engine's check-then-create race cannot produce two containers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use repocate::engine::{ContainerSpec, DockerEngine};
//! use repocate::lifecycle::{LifecycleOrchestrator, OperationContext};
//!
//! let orchestrator = LifecycleOrchestrator::new(Arc::new(DockerEngine::connect()?));
//! let spec = ContainerSpec::new("repocate-default", "dev:v1").with_command(["/bin/zsh"]);
//! let state = orchestrator
//!     .ensure_container(&spec, &OperationContext::new())
//!     .await?;
//! ```

mod context;
mod locks;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerFilter, ContainerSpec, ContainerState, ContainerSummary};
use crate::error::{EngineError, LifecycleError};
use crate::events::{EventSink, LifecycleEvent};

pub use context::OperationContext;
pub use locks::{NameGuard, NameLocks};
pub use session::{DetachedReader, SessionIo};

/// Default grace period before the engine kills a stopping container.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives named containers to their desired state through a
/// [`ContainerEngine`].
pub struct LifecycleOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    locks: NameLocks,
    events: EventSink<LifecycleEvent>,
}

impl LifecycleOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            locks: NameLocks::new(),
            events: EventSink::disabled(),
        }
    }

    /// Forwards lifecycle events (including pull progress) to `events`.
    pub fn with_events(mut self, events: EventSink<LifecycleEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Current state of `name` as reported by the engine.
    pub async fn container_state(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<ContainerState, LifecycleError> {
        validate_name(name)?;
        Ok(self
            .find(name, ctx)
            .await?
            .map(|c| c.lifecycle_state())
            .unwrap_or(ContainerState::Absent))
    }

    /// Every container created by repocate, running or not.
    pub async fn list_managed(
        &self,
        ctx: &OperationContext,
    ) -> Result<Vec<ContainerSummary>, LifecycleError> {
        ctx.run(
            "list containers",
            self.engine.list_containers(&ContainerFilter::managed()),
        )
        .await
    }

    /// Ensures the container described by `spec` exists and is running.
    ///
    /// Absent containers get their image resolved (pulled if missing),
    /// then are created and started. Existing stopped containers are only
    /// started, paused ones unpaused. Running containers are left alone.
    ///
    /// # Errors
    ///
    /// Engine failures are surfaced unchanged. A pull failure aborts before
    /// any create is attempted.
    pub async fn ensure_container(
        &self,
        spec: &ContainerSpec,
        ctx: &OperationContext,
    ) -> Result<ContainerState, LifecycleError> {
        validate_name(&spec.name)?;
        let _guard = self.lock(&spec.name, ctx).await?;
        self.ensure_locked(spec, ctx).await
    }

    /// Opens an interactive shell in a running container and bridges it to
    /// `io` until the remote session ends or `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` when the container is absent, not running or
    /// paused. The container is never started or unpaused implicitly.
    pub async fn enter_container<R, W, E>(
        &self,
        name: &str,
        shell: &[String],
        io: SessionIo<R, W, E>,
        ctx: &OperationContext,
    ) -> Result<(), LifecycleError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        validate_name(name)?;
        let container = self
            .find(name, ctx)
            .await?
            .filter(|c| c.lifecycle_state().is_running() && !c.is_paused())
            .ok_or_else(|| LifecycleError::NotRunning(name.to_string()))?;

        let exec_id = ctx
            .run(
                "create exec",
                self.engine.exec_create(&container.id, shell, true),
            )
            .await?;
        let attached = ctx
            .run("attach exec", self.engine.exec_attach(&exec_id))
            .await?;

        info!(container = %name, "Interactive session opened");
        self.events.emit(LifecycleEvent::SessionOpened {
            name: name.to_string(),
        });

        let result = ctx
            .run("exec session", async {
                session::bridge(attached, io).await.map_err(|source| {
                    LifecycleError::ExecAttachFailure {
                        name: name.to_string(),
                        source,
                    }
                })
            })
            .await;

        debug!(container = %name, ok = result.is_ok(), "Interactive session closed");
        self.events.emit(LifecycleEvent::SessionClosed {
            name: name.to_string(),
        });
        result
    }

    /// Gracefully stops `name`, letting the engine kill it after `grace`.
    ///
    /// Absent or already stopped containers are a successful no-op.
    pub async fn stop_container(
        &self,
        name: &str,
        grace: Duration,
        ctx: &OperationContext,
    ) -> Result<(), LifecycleError> {
        validate_name(name)?;
        let _guard = self.lock(name, ctx).await?;

        let Some(container) = self.find(name, ctx).await? else {
            debug!(container = %name, "Stop requested for absent container");
            return Ok(());
        };
        if !container.lifecycle_state().is_running() {
            debug!(container = %name, state = %container.state, "Container already stopped");
            return Ok(());
        }

        self.stop_by_id(name, &container.id, grace, ctx).await
    }

    /// Replaces the container with a freshly created one.
    ///
    /// Stops and force-removes any existing container for `spec.name`, then
    /// runs the ensure steps. The new container id always differs from the
    /// previous one.
    pub async fn rebuild_container(
        &self,
        spec: &ContainerSpec,
        ctx: &OperationContext,
    ) -> Result<ContainerState, LifecycleError> {
        validate_name(&spec.name)?;
        let _guard = self.lock(&spec.name, ctx).await?;

        if let Some(existing) = self.find(&spec.name, ctx).await? {
            if existing.lifecycle_state().is_running() {
                if let Err(e) = self
                    .stop_by_id(&spec.name, &existing.id, DEFAULT_STOP_TIMEOUT, ctx)
                    .await
                {
                    if !matches!(e, LifecycleError::Engine(_)) {
                        return Err(e);
                    }
                    warn!(container = %spec.name, error = %e, "Stop before rebuild failed, forcing removal");
                }
            }

            match ctx
                .run(
                    "remove container",
                    self.engine.remove_container(&existing.id, true),
                )
                .await
            {
                Ok(()) => {
                    info!(container = %spec.name, id = %existing.id, "Container removed");
                    self.events.emit(LifecycleEvent::Removed {
                        name: spec.name.clone(),
                        id: existing.id.clone(),
                    });
                }
                Err(LifecycleError::Engine(e)) if e.is_not_found() => {
                    debug!(container = %spec.name, "Container vanished before removal");
                }
                Err(e) => return Err(e),
            }
        }

        self.ensure_locked(spec, ctx).await
    }

    async fn lock(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<NameGuard<'_>, LifecycleError> {
        ctx.run("acquire name lock", async {
            Ok::<_, LifecycleError>(self.locks.acquire(name).await)
        })
        .await
    }

    /// Looks up a container by exact name.
    async fn find(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<Option<ContainerSummary>, LifecycleError> {
        let found = ctx
            .run(
                "list containers",
                self.engine.list_containers(&ContainerFilter::by_name(name)),
            )
            .await?;
        Ok(found.into_iter().find(|c| c.has_name(name)))
    }

    /// Ensure steps; the caller holds the name lock.
    async fn ensure_locked(
        &self,
        spec: &ContainerSpec,
        ctx: &OperationContext,
    ) -> Result<ContainerState, LifecycleError> {
        let existing = self.find(&spec.name, ctx).await?;
        let observed = existing
            .as_ref()
            .map(|c| c.lifecycle_state())
            .unwrap_or(ContainerState::Absent);
        self.events.emit(LifecycleEvent::Observed {
            name: spec.name.clone(),
            state: observed,
        });

        match existing {
            None => {
                self.resolve_image(&spec.image, ctx).await?;

                let id = ctx
                    .run("create container", self.engine.create_container(spec))
                    .await?;
                info!(container = %spec.name, %id, image = %spec.image, "Container created");
                self.events.emit(LifecycleEvent::Created {
                    name: spec.name.clone(),
                    id: id.clone(),
                });

                self.start_by_id(&spec.name, &id, ctx).await?;
            }
            Some(container) if container.is_paused() => {
                ctx.run(
                    "unpause container",
                    self.engine.unpause_container(&container.id),
                )
                .await?;
                info!(container = %spec.name, id = %container.id, "Container unpaused");
                self.events.emit(LifecycleEvent::Unpaused {
                    name: spec.name.clone(),
                    id: container.id.clone(),
                });
            }
            Some(container) if observed.is_running() => {
                debug!(container = %spec.name, id = %container.id, "Container already running");
            }
            Some(container) => {
                self.start_by_id(&spec.name, &container.id, ctx).await?;
            }
        }

        Ok(ContainerState::Running)
    }

    /// Makes sure `image` is present locally, pulling it if necessary.
    async fn resolve_image(&self, image: &str, ctx: &OperationContext) -> Result<(), LifecycleError> {
        if ctx
            .run("inspect image", self.engine.image_exists(image))
            .await?
        {
            debug!(%image, "Image present locally");
            return Ok(());
        }

        info!(%image, "Image not found locally, pulling");
        self.events.emit(LifecycleEvent::PullStarted {
            image: image.to_string(),
        });

        let mut progress = ctx.run("pull image", self.engine.pull_image(image)).await?;
        while let Some(record) = ctx
            .run("pull image", async {
                Ok::<_, EngineError>(progress.next().await)
            })
            .await?
        {
            let record = record?;
            self.events.emit(LifecycleEvent::PullProgress {
                image: image.to_string(),
                progress: record,
            });
        }

        info!(%image, "Image pulled");
        self.events.emit(LifecycleEvent::PullCompleted {
            image: image.to_string(),
        });
        Ok(())
    }

    async fn start_by_id(
        &self,
        name: &str,
        id: &str,
        ctx: &OperationContext,
    ) -> Result<(), LifecycleError> {
        ctx.run("start container", self.engine.start_container(id))
            .await?;
        info!(container = %name, %id, "Container started");
        self.events.emit(LifecycleEvent::Started {
            name: name.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn stop_by_id(
        &self,
        name: &str,
        id: &str,
        grace: Duration,
        ctx: &OperationContext,
    ) -> Result<(), LifecycleError> {
        match ctx
            .run("stop container", self.engine.stop_container(id, grace))
            .await
        {
            Ok(()) => {
                info!(container = %name, %id, grace_secs = grace.as_secs(), "Container stopped");
                self.events.emit(LifecycleEvent::Stopped {
                    name: name.to_string(),
                    id: id.to_string(),
                });
                Ok(())
            }
            Err(LifecycleError::Engine(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Accepts names the engine accepts: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn validate_name(name: &str) -> Result<(), LifecycleError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(LifecycleError::InvalidName(name.to_string()))
    }
}

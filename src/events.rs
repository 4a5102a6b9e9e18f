//! Observable events emitted by the orchestrator and the registry.
//!
//! Library code never prints progress itself. It hands events to an
//! [`EventSink`], and whoever holds the receiving half (the CLI) decides
//! how to render them.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::engine::{ContainerState, PullProgress};
use crate::registry::ItemKind;

/// Events describing container lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Existence check result for a container name.
    Observed { name: String, state: ContainerState },
    /// An image pull started because the image is not present locally.
    PullStarted { image: String },
    /// Progress record from an ongoing pull, forwarded as it arrives.
    PullProgress { image: String, progress: PullProgress },
    PullCompleted { image: String },
    Created { name: String, id: String },
    Started { name: String, id: String },
    Unpaused { name: String, id: String },
    Stopped { name: String, id: String },
    Removed { name: String, id: String },
    /// An interactive session was opened.
    SessionOpened { name: String },
    SessionClosed { name: String },
}

/// Events describing registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered {
        kind: ItemKind,
        name: String,
        replaced: bool,
    },
    Unregistered {
        kind: ItemKind,
        name: String,
    },
    Configured {
        name: String,
    },
}

/// Optional sender half of an event channel.
///
/// Emitting never blocks and never fails: a sink without a receiver, or
/// whose receiver was dropped, silently discards events.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: Option<mpsc::UnboundedSender<E>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> Default for EventSink<E> {
    fn default() -> Self {
        Self::disabled()
    }
}

impl<E> EventSink<E> {
    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Creates a connected sink and its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: E) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

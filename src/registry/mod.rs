//! Capability registry.
//!
//! This module provides:
//! - Named catalogues of plugins, image descriptors and container descriptors
//! - Typed dependency injection into plugins
//! - Plugin invocation gated on configuration

pub mod entry;

pub use entry::{ContainerDescriptor, ImageDescriptor, ItemKind, RegistryItem};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::RegistryError;
use crate::events::{EventSink, RegistryEvent};
use crate::plugins::{Dependencies, Plugin};

/// What `register` does when the name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fail with `DuplicateName` and keep the existing item.
    #[default]
    Reject,
    /// Swap in the new item.
    Replace,
}

type Catalogue<T> = RwLock<HashMap<String, T>>;

/// In-memory registry of plugins, images and containers.
///
/// Each catalogue has its own lock. Reads run concurrently, writes are
/// exclusive, and no lock is ever held while a plugin executes.
#[derive(Default)]
pub struct CapabilityRegistry {
    plugins: Catalogue<Arc<dyn Plugin>>,
    images: Catalogue<ImageDescriptor>,
    containers: Catalogue<ContainerDescriptor>,
    events: EventSink<RegistryEvent>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventSink<RegistryEvent>) -> Self {
        self.events = events;
        self
    }

    /// Adds `item` under `name` in the catalogue matching its kind.
    ///
    /// # Errors
    /// Returns `DuplicateName` if the name is taken and `mode` is `Reject`.
    /// The existing item is left untouched.
    pub fn register(
        &self,
        name: impl Into<String>,
        item: RegistryItem,
        mode: RegisterMode,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match item {
            RegistryItem::Plugin(plugin) => {
                self.insert(&self.plugins, name, plugin, ItemKind::Plugin, mode)
            }
            RegistryItem::Image(image) => {
                self.insert(&self.images, name, image, ItemKind::Image, mode)
            }
            RegistryItem::Container(container) => {
                self.insert(&self.containers, name, container, ItemKind::Container, mode)
            }
        }
    }

    /// Removes `name` from the `kind` catalogue. Returns whether anything
    /// was removed; unknown names are not an error.
    pub fn unregister(&self, kind: ItemKind, name: &str) -> bool {
        match kind {
            ItemKind::Plugin => self.remove(&self.plugins, name, kind),
            ItemKind::Image => self.remove(&self.images, name, kind),
            ItemKind::Container => self.remove(&self.containers, name, kind),
        }
    }

    pub fn get(&self, kind: ItemKind, name: &str) -> Option<RegistryItem> {
        match kind {
            ItemKind::Plugin => self.plugin(name).map(RegistryItem::Plugin),
            ItemKind::Image => self.image(name).map(RegistryItem::Image),
            ItemKind::Container => self.container(name).map(RegistryItem::Container),
        }
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        read(&self.plugins).get(name).cloned()
    }

    pub fn image(&self, name: &str) -> Option<ImageDescriptor> {
        read(&self.images).get(name).cloned()
    }

    pub fn container(&self, name: &str) -> Option<ContainerDescriptor> {
        read(&self.containers).get(name).cloned()
    }

    /// Snapshot of the names in one catalogue, sorted.
    pub fn list(&self, kind: ItemKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            ItemKind::Plugin => read(&self.plugins).keys().cloned().collect(),
            ItemKind::Image => read(&self.images).keys().cloned().collect(),
            ItemKind::Container => read(&self.containers).keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Resolves `deps` into the configuration shape the plugin accepts and
    /// hands it to the plugin.
    ///
    /// # Errors
    /// - `NotFound` if no plugin is registered under `name`
    /// - `UnknownPluginType` if the plugin accepts no configuration
    /// - `MissingDependency` if required values are absent
    ///
    /// Injection is a catalogue write: the plugin stays registered under
    /// `name` until `configure` has returned, so a concurrent replace or
    /// unregister lands either entirely before or entirely after it.
    pub fn inject_dependencies(&self, name: &str, deps: &Dependencies) -> Result<(), RegistryError> {
        let plugins = write(&self.plugins);
        let plugin = plugins.get(name).ok_or_else(|| RegistryError::NotFound {
            kind: ItemKind::Plugin.to_string(),
            name: name.to_string(),
        })?;
        let shape = plugin
            .config_shape()
            .ok_or_else(|| RegistryError::UnknownPluginType(name.to_string()))?;

        let config = shape.resolve(name, deps)?;
        plugin.configure(config)?;

        info!(plugin = %name, %shape, "Dependencies injected");
        self.events.emit(RegistryEvent::Configured {
            name: name.to_string(),
        });
        drop(plugins);
        Ok(())
    }

    /// Runs a configured plugin.
    ///
    /// # Errors
    /// - `NotFound` if no plugin is registered under `name`
    /// - `MissingDependency` if the plugin has not been configured
    /// - the plugin's own error, unchanged
    pub async fn execute_plugin(&self, name: &str) -> Result<String, RegistryError> {
        let plugin = self.plugin(name).ok_or_else(|| RegistryError::NotFound {
            kind: ItemKind::Plugin.to_string(),
            name: name.to_string(),
        })?;

        if !plugin.is_configured() {
            let missing = plugin
                .config_shape()
                .map(|shape| shape.required_fields().iter().map(|f| f.to_string()).collect())
                .unwrap_or_default();
            return Err(RegistryError::MissingDependency {
                plugin: name.to_string(),
                missing,
            });
        }

        debug!(plugin = %name, "Executing plugin");
        Ok(plugin.execute().await?)
    }

    // Events are emitted under the catalogue's write guard, so they are
    // received in the order the writes were applied.

    fn insert<T>(
        &self,
        catalogue: &Catalogue<T>,
        name: String,
        value: T,
        kind: ItemKind,
        mode: RegisterMode,
    ) -> Result<(), RegistryError> {
        let mut entries = write(catalogue);
        if entries.contains_key(&name) && mode == RegisterMode::Reject {
            return Err(RegistryError::DuplicateName {
                kind: kind.to_string(),
                name,
            });
        }
        let replaced = entries.insert(name.clone(), value).is_some();

        info!(%kind, %name, replaced, "Registered");
        self.events.emit(RegistryEvent::Registered {
            kind,
            name,
            replaced,
        });
        Ok(())
    }

    fn remove<T>(&self, catalogue: &Catalogue<T>, name: &str, kind: ItemKind) -> bool {
        let mut entries = write(catalogue);
        if entries.remove(name).is_none() {
            debug!(%kind, %name, "Unregister of unknown name ignored");
            return false;
        }

        info!(%kind, %name, "Unregistered");
        self.events.emit(RegistryEvent::Unregistered {
            kind,
            name: name.to_string(),
        });
        true
    }
}

fn read<T>(catalogue: &Catalogue<T>) -> std::sync::RwLockReadGuard<'_, HashMap<String, T>> {
    catalogue.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(catalogue: &Catalogue<T>) -> std::sync::RwLockWriteGuard<'_, HashMap<String, T>> {
    catalogue.write().unwrap_or_else(PoisonError::into_inner)
}

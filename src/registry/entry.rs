use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{ContainerSpec, Mount};
use crate::plugins::Plugin;

/// Catalogue an item belongs to. Names are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Plugin,
    Image,
    Container,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Plugin => write!(f, "plugin"),
            ItemKind::Image => write!(f, "image"),
            ItemKind::Container => write!(f, "container"),
        }
    }
}

/// An image the environment may be built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub name: String,
    pub tag: String,
    /// Content digest (`sha256:...`) pinning the image, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

impl ImageDescriptor {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            digest: None,
            build_args: BTreeMap::new(),
        }
    }

    /// Parses `name[:tag][@digest]`; the tag defaults to `latest`. A colon
    /// inside a registry host (`host:5000/img`) or a digest is not mistaken
    /// for a tag.
    pub fn parse(reference: &str) -> Self {
        let (named, digest) = match reference.split_once('@') {
            Some((named, digest)) => (named, Some(digest.to_string())),
            None => (reference, None),
        };
        let image = match named.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => Self::new(name, tag),
            _ => Self::new(named, "latest"),
        };
        Self { digest, ..image }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    /// Image reference in `name:tag` form, or `name@digest` when pinned.
    /// The digest alone identifies the image, so the tag is left out.
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.name, digest),
            None => format!("{}:{}", self.name, self.tag),
        }
    }
}

/// A named container definition kept in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Published ports in `host:container` form. Informational only.
    #[serde(default)]
    pub ports: Vec<String>,
}

impl ContainerDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            entrypoint: Vec::new(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Desired state for the orchestrator. The entrypoint, when set, is
    /// prepended to the command.
    pub fn to_spec(&self) -> ContainerSpec {
        let mut spec = ContainerSpec::new(&self.name, &self.image)
            .with_command(self.entrypoint.iter().chain(&self.command).cloned())
            .with_mounts(self.mounts.clone());
        for (key, value) in &self.environment {
            spec = spec.with_env(key, value);
        }
        spec
    }
}

/// Anything the registry can hold.
#[derive(Clone)]
pub enum RegistryItem {
    Plugin(Arc<dyn Plugin>),
    Image(ImageDescriptor),
    Container(ContainerDescriptor),
}

impl RegistryItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            RegistryItem::Plugin(_) => ItemKind::Plugin,
            RegistryItem::Image(_) => ItemKind::Image,
            RegistryItem::Container(_) => ItemKind::Container,
        }
    }
}

impl std::fmt::Debug for RegistryItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryItem::Plugin(plugin) => f.debug_tuple("Plugin").field(&plugin.name()).finish(),
            RegistryItem::Image(image) => f.debug_tuple("Image").field(image).finish(),
            RegistryItem::Container(container) => {
                f.debug_tuple("Container").field(container).finish()
            }
        }
    }
}

//! Integration tests for the capability registry with the built-in plugins.

mod common;

use std::sync::Arc;

use common::FakeEngine;
use repocate::engine::ContainerState;
use repocate::error::{PluginError, RegistryError};
use repocate::lifecycle::{LifecycleOrchestrator, OperationContext};
use repocate::plugins::tailscale::{SIDECAR_LABEL, TAILSCALE_IMAGE};
use repocate::plugins::{Dependencies, Plugin, TailscalePlugin, VaultPlugin};
use repocate::registry::{CapabilityRegistry, ItemKind, RegisterMode, RegistryItem};

fn registry_with_plugins(engine: &Arc<FakeEngine>) -> CapabilityRegistry {
    let orchestrator = Arc::new(LifecycleOrchestrator::new(engine.clone()));
    let registry = CapabilityRegistry::new();
    registry
        .register(
            "vault",
            RegistryItem::Plugin(Arc::new(VaultPlugin::new())),
            RegisterMode::Reject,
        )
        .unwrap();
    registry
        .register(
            "tailscale",
            RegistryItem::Plugin(Arc::new(TailscalePlugin::new(orchestrator))),
            RegisterMode::Reject,
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_unconfigured_plugins_cannot_execute() {
    let engine = Arc::new(FakeEngine::new());
    let registry = registry_with_plugins(&engine);

    for name in ["vault", "tailscale"] {
        let err = registry.execute_plugin(name).await.unwrap_err();
        assert!(
            matches!(err, RegistryError::MissingDependency { ref plugin, .. } if plugin == name),
            "unexpected error for {name}: {err:?}"
        );
    }
    assert!(engine.call_log().is_empty());
}

#[tokio::test]
async fn test_tailscale_sidecar_joins_service_network() {
    let engine = Arc::new(
        FakeEngine::new().with_container("web", "nginx:alpine", "running"),
    );
    let registry = registry_with_plugins(&engine);

    registry
        .inject_dependencies("tailscale", &Dependencies::positional(["tskey-auth-1", "web"]))
        .expect("auth key and service are enough");
    let summary = registry.execute_plugin("tailscale").await.expect("sidecar should start");

    assert!(summary.contains("tailscale-sidecar"));
    let sidecar = engine.container("tailscale-sidecar").expect("sidecar created");
    assert_eq!(sidecar.image, TAILSCALE_IMAGE);
    assert_eq!(sidecar.state, "running");
    assert_eq!(sidecar.spec.network_mode.as_deref(), Some("container:web"));
    assert!(sidecar.spec.env.contains(&"TS_AUTHKEY=tskey-auth-1".to_string()));
    assert_eq!(sidecar.labels.get(SIDECAR_LABEL).map(String::as_str), Some("web"));
    assert!(engine.has_image(TAILSCALE_IMAGE));

    // A second run finds the sidecar running and leaves it alone.
    engine.clear_calls();
    registry.execute_plugin("tailscale").await.unwrap();
    assert_eq!(engine.calls("create_container"), 0);
    assert_eq!(engine.calls("start_container"), 0);
}

#[tokio::test]
async fn test_tailscale_updates_compose_file() {
    let dir = tempfile::tempdir().unwrap();
    let compose = dir.path().join("docker-compose.yml");
    std::fs::write(
        &compose,
        "services:\n  web:\n    image: nginx:alpine\n",
    )
    .unwrap();

    let engine = Arc::new(FakeEngine::new().with_image(TAILSCALE_IMAGE));
    let registry = registry_with_plugins(&engine);
    registry
        .inject_dependencies(
            "tailscale",
            &Dependencies::new()
                .with_named("auth_key", "tskey-auth-2")
                .with_named("service_name", "web")
                .with_named("container", "web-ts")
                .with_named("compose_file", compose.display().to_string()),
        )
        .unwrap();

    registry.execute_plugin("tailscale").await.unwrap();

    let written = std::fs::read_to_string(&compose).unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
    assert_eq!(
        parsed["services"]["web-ts"]["network_mode"],
        serde_yaml::Value::from("service:web")
    );
    assert_eq!(
        parsed["services"]["web"]["image"],
        serde_yaml::Value::from("nginx:alpine")
    );
    assert!(engine.container("web-ts").is_some());
    assert_eq!(engine.calls("pull_image"), 0);
}

#[tokio::test]
async fn test_engine_failure_propagates_through_plugin() {
    let engine = Arc::new(FakeEngine::unavailable());
    let registry = registry_with_plugins(&engine);
    registry
        .inject_dependencies("tailscale", &Dependencies::positional(["tskey", "web"]))
        .unwrap();

    let err = registry.execute_plugin("tailscale").await.unwrap_err();
    assert!(matches!(err, RegistryError::Plugin(PluginError::Lifecycle(_))));
}

#[tokio::test]
async fn test_vault_injection_requires_address() {
    let engine = Arc::new(FakeEngine::new());
    let registry = registry_with_plugins(&engine);

    let err = registry
        .inject_dependencies("vault", &Dependencies::new().with_named("token", "s.abc"))
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::MissingDependency { ref missing, .. } if missing == &["address"]
    ));

    registry
        .inject_dependencies("vault", &Dependencies::positional(["http://127.0.0.1:8200"]))
        .unwrap();
    let plugin = registry.plugin("vault").unwrap();
    assert!(plugin.is_configured());
}

#[tokio::test]
async fn test_replace_swaps_plugin_and_drops_configuration() {
    let engine = Arc::new(FakeEngine::new());
    let registry = registry_with_plugins(&engine);
    registry
        .inject_dependencies("vault", &Dependencies::positional(["http://127.0.0.1:8200"]))
        .unwrap();

    let duplicate = registry.register(
        "vault",
        RegistryItem::Plugin(Arc::new(VaultPlugin::new())),
        RegisterMode::Reject,
    );
    assert!(matches!(duplicate, Err(RegistryError::DuplicateName { .. })));
    assert!(registry.plugin("vault").unwrap().is_configured());

    registry
        .register(
            "vault",
            RegistryItem::Plugin(Arc::new(VaultPlugin::new())),
            RegisterMode::Replace,
        )
        .unwrap();
    assert!(!registry.plugin("vault").unwrap().is_configured());
    assert_eq!(registry.list(ItemKind::Plugin), vec!["tailscale", "vault"]);
}

#[tokio::test]
async fn test_registered_container_descriptor_drives_orchestrator() {
    let engine = Arc::new(FakeEngine::new().with_image("dev:v1"));
    let orchestrator = LifecycleOrchestrator::new(engine.clone());
    let registry = CapabilityRegistry::new();

    let mut descriptor = repocate::registry::ContainerDescriptor::new("repocate-app", "dev:v1");
    descriptor.command = vec!["/bin/zsh".to_string()];
    registry
        .register(
            "app",
            RegistryItem::Container(descriptor),
            RegisterMode::Reject,
        )
        .unwrap();

    let spec = registry.container("app").unwrap().to_spec();
    let state = orchestrator
        .ensure_container(&spec, &OperationContext::new())
        .await
        .unwrap();

    assert_eq!(state, ContainerState::Running);
    assert_eq!(engine.container("repocate-app").unwrap().spec.command, vec!["/bin/zsh"]);
}

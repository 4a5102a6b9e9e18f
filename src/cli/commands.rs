//! CLI command definitions for repocate.
//!
//! Commands only translate arguments into orchestrator and registry calls;
//! all container logic lives in the library.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{container_name_for, RepocateConfig, DEFAULT_CONTAINER};
use crate::engine::{ContainerSummary, DockerEngine};
use crate::events::{EventSink, LifecycleEvent, RegistryEvent};
use crate::git::{is_cloned, repo_name, GitCli, VersionControl};
use crate::lifecycle::{LifecycleOrchestrator, OperationContext, SessionIo};
use crate::plugins::{tailscale, vault, Dependencies, Plugin, TailscalePlugin, VaultPlugin};
use crate::registry::{CapabilityRegistry, ItemKind, RegisterMode, RegistryItem};

/// Per-repository isolated development containers.
#[derive(Parser)]
#[command(name = "repocate")]
#[command(about = "Clone repositories and work in isolated development containers")]
#[command(version)]
#[command(
    long_about = "repocate keeps one development container per repository.\n\nEach repository is cloned into the workspace and mounted into a container named repocate-<repo>.\n\nExample usage:\n  repocate create https://github.com/cdaprod/repocate.git\n  repocate enter repocate"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Path to the config file (defaults to <config dir>/repocate/repocate.json).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Workspace directory holding cloned repositories.
    #[arg(long, env = "REPOCATE_WORKSPACE", global = true)]
    pub workspace: Option<PathBuf>,

    /// Image to create containers from.
    #[arg(long, env = "REPOCATE_IMAGE", global = true)]
    pub image: Option<String>,

    /// Abort the command after this many seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Start the default container and open a shell in it.
    Start,

    /// Clone a repository (if needed) and create/start its container.
    Create(RepoArgs),

    /// Clone a repository into the workspace.
    Clone(RepoArgs),

    /// Open a shell in a repository's container.
    Enter(EnterArgs),

    /// Stop a repository's container.
    Stop(StopArgs),

    /// Remove and recreate a repository's container.
    Rebuild(RepoArgs),

    /// List repocate containers and available plugins.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show version information.
    Version,

    /// Register and configure a plugin.
    Register(Box<RegisterArgs>),

    /// Unregister a plugin.
    Unregister(UnregisterArgs),
}

/// A repository given as URL, `owner/name` or plain name.
#[derive(Parser, Debug)]
pub struct RepoArgs {
    /// Repository URL or name.
    pub repo: String,
}

#[derive(Parser, Debug)]
pub struct EnterArgs {
    /// Repository URL or name (defaults to the default container).
    pub repo: Option<String>,

    /// Create and start the container first if needed.
    #[arg(long)]
    pub start: bool,
}

#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Repository URL or name (defaults to the default container).
    pub repo: Option<String>,

    /// Seconds to wait before the container is killed.
    #[arg(short = 't', long)]
    pub grace: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct RegisterArgs {
    /// Plugin to register (vault, tailscale).
    pub plugin: String,

    /// Execute the plugin after configuring it.
    #[arg(long)]
    pub run: bool,

    /// Vault server address.
    #[arg(long, env = "VAULT_ADDR")]
    pub address: Option<String>,

    /// Vault token.
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Vault AppRole role id.
    #[arg(long, env = "VAULT_ROLE_ID")]
    pub role_id: Option<String>,

    /// Vault AppRole secret id.
    #[arg(long, env = "VAULT_SECRET_ID", hide_env_values = true)]
    pub secret_id: Option<String>,

    /// Secret to read on run (e.g. secret/data/app).
    #[arg(long)]
    pub secret_path: Option<String>,

    /// Tailscale auth key.
    #[arg(long, env = "TS_AUTHKEY", hide_env_values = true)]
    pub auth_key: Option<String>,

    /// Service whose network the tailscale sidecar joins.
    #[arg(long)]
    pub service: Option<String>,

    /// Tailscale exit node.
    #[arg(long)]
    pub exit_node: Option<String>,

    /// Enable tailscale funnel.
    #[arg(long)]
    pub funnel: bool,

    /// Enable tailscale serve.
    #[arg(long)]
    pub serve: bool,

    /// Sidecar container name.
    #[arg(long)]
    pub container: Option<String>,

    /// Compose file to add the sidecar service to.
    #[arg(long)]
    pub compose_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct UnregisterArgs {
    /// Plugin to unregister.
    pub plugin: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("repocate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let app = App::new(&cli)?;
    let result = match cli.command {
        Commands::Start => run_start_command(&app).await,
        Commands::Create(args) => run_create_command(&app, args).await,
        Commands::Clone(args) => run_clone_command(&app, args).await,
        Commands::Enter(args) => run_enter_command(&app, args).await,
        Commands::Stop(args) => run_stop_command(&app, args).await,
        Commands::Rebuild(args) => run_rebuild_command(&app, args).await,
        Commands::List(args) => run_list_command(&app, args).await,
        Commands::Register(args) => run_register_command(&app, *args).await,
        Commands::Unregister(args) => run_unregister_command(&app, args),
        Commands::Version => Ok(()),
    };
    app.shutdown().await;
    result
}

// ============================================================================
// Shared state
// ============================================================================

struct App {
    config: RepocateConfig,
    orchestrator: Arc<LifecycleOrchestrator>,
    registry: CapabilityRegistry,
    ctx: OperationContext,
    printer: JoinHandle<()>,
    signals: JoinHandle<()>,
}

impl App {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => RepocateConfig::load_from(path)?,
            None => RepocateConfig::load()?,
        };
        if let Some(workspace) = &cli.workspace {
            config = config.with_workspace_dir(workspace);
        }
        if let Some(image) = &cli.image {
            config = config.with_image(image);
        }
        debug!(workspace = %config.workspace_dir.display(), image = %config.image, "Configuration loaded");

        let (lifecycle_sink, lifecycle_rx) = EventSink::channel();
        let (registry_sink, registry_rx) = EventSink::channel();

        let engine = DockerEngine::connect()?;
        let orchestrator =
            Arc::new(LifecycleOrchestrator::new(Arc::new(engine)).with_events(lifecycle_sink));
        let registry = CapabilityRegistry::new().with_events(registry_sink);

        let cancel = CancellationToken::new();
        let mut ctx = OperationContext::new().with_cancellation(cancel.clone());
        if let Some(secs) = cli.timeout {
            ctx = ctx.with_timeout(Duration::from_secs(secs));
        }

        let signals = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
        let printer = tokio::spawn(print_events(lifecycle_rx, registry_rx));

        Ok(Self {
            config,
            orchestrator,
            registry,
            ctx,
            printer,
            signals,
        })
    }

    /// Drops the event senders and waits for queued events to be printed.
    async fn shutdown(self) {
        self.signals.abort();
        let Self {
            orchestrator,
            registry,
            printer,
            ..
        } = self;
        drop(registry);
        drop(orchestrator);
        let _ = printer.await;
    }

    /// Registers every built-in plugin, unconfigured.
    fn register_builtins(&self) -> anyhow::Result<()> {
        for name in [vault::PLUGIN_NAME, tailscale::PLUGIN_NAME] {
            if let Some(plugin) = self.builtin_plugin(name) {
                self.registry
                    .register(name, RegistryItem::Plugin(plugin), RegisterMode::Replace)?;
            }
        }
        Ok(())
    }

    fn builtin_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        match name {
            vault::PLUGIN_NAME => Some(Arc::new(VaultPlugin::new())),
            tailscale::PLUGIN_NAME => Some(Arc::new(TailscalePlugin::new(Arc::clone(
                &self.orchestrator,
            )))),
            _ => None,
        }
    }
}

/// Container name for an optional repository argument.
fn target_container(repo: Option<&str>) -> anyhow::Result<String> {
    match repo {
        Some(input) => Ok(container_name_for(&repo_name(input)?)),
        None => Ok(DEFAULT_CONTAINER.to_string()),
    }
}

/// URL to clone: full URLs, scp-style remotes and local paths are used
/// as-is, `owner/name` shorthand points at GitHub.
fn clone_url(input: &str) -> String {
    let local = std::path::Path::new(input).exists();
    if input.contains("://") || input.starts_with("git@") || local {
        return input.to_string();
    }
    match input.split('/').collect::<Vec<_>>().as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => {
            format!("https://github.com/{owner}/{}.git", name.trim_end_matches(".git"))
        }
        _ => input.to_string(),
    }
}

// ============================================================================
// Container commands
// ============================================================================

async fn run_start_command(app: &App) -> anyhow::Result<()> {
    let spec = app.config.default_container_spec();
    app.orchestrator.ensure_container(&spec, &app.ctx).await?;
    println!("Container {} is running", spec.name);

    app.orchestrator
        .enter_container(&spec.name, &app.config.shell, SessionIo::stdio(), &app.ctx)
        .await?;
    Ok(())
}

/// Clones `input` into the workspace unless it is already there.
async fn ensure_cloned(app: &App, input: &str) -> anyhow::Result<String> {
    let repo = repo_name(input)?;
    if is_cloned(&app.config.workspace_dir, &repo) {
        info!(%repo, "Repository already cloned");
        return Ok(repo);
    }

    let url = clone_url(input);
    let dest = app.config.repo_path(&repo);
    GitCli::new().clone_repo(&url, &dest).await?;
    println!("Cloned {url} into {}", dest.display());
    Ok(repo)
}

async fn run_clone_command(app: &App, args: RepoArgs) -> anyhow::Result<()> {
    ensure_cloned(app, &args.repo).await?;
    Ok(())
}

async fn run_create_command(app: &App, args: RepoArgs) -> anyhow::Result<()> {
    let repo = ensure_cloned(app, &args.repo).await?;
    let spec = app.config.repo_container_spec(&repo);
    app.orchestrator.ensure_container(&spec, &app.ctx).await?;
    println!("Container {} is running", spec.name);
    Ok(())
}

async fn run_enter_command(app: &App, args: EnterArgs) -> anyhow::Result<()> {
    let name = target_container(args.repo.as_deref())?;

    if args.start {
        let spec = match args.repo.as_deref() {
            Some(input) => app.config.repo_container_spec(&repo_name(input)?),
            None => app.config.default_container_spec(),
        };
        app.orchestrator.ensure_container(&spec, &app.ctx).await?;
    }

    app.orchestrator
        .enter_container(&name, &app.config.shell, SessionIo::stdio(), &app.ctx)
        .await?;
    Ok(())
}

async fn run_stop_command(app: &App, args: StopArgs) -> anyhow::Result<()> {
    let name = target_container(args.repo.as_deref())?;
    let grace = args
        .grace
        .map(Duration::from_secs)
        .unwrap_or_else(|| app.config.stop_timeout());

    app.orchestrator
        .stop_container(&name, grace, &app.ctx)
        .await?;
    println!("Container {name} is stopped");
    Ok(())
}

async fn run_rebuild_command(app: &App, args: RepoArgs) -> anyhow::Result<()> {
    let repo = repo_name(&args.repo)?;
    let spec = app.config.repo_container_spec(&repo);
    app.orchestrator.rebuild_container(&spec, &app.ctx).await?;
    println!("Container {} was rebuilt", spec.name);
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct ContainerRow {
    name: String,
    id: String,
    image: String,
    state: String,
    status: String,
    created: String,
}

impl From<&ContainerSummary> for ContainerRow {
    fn from(summary: &ContainerSummary) -> Self {
        let created = Utc
            .timestamp_opt(summary.created, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        Self {
            name: summary.display_name().to_string(),
            id: summary.id.chars().take(12).collect(),
            image: summary.image.clone(),
            state: summary.lifecycle_state().to_string(),
            status: summary.status.clone(),
            created,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ListOutput {
    containers: Vec<ContainerRow>,
    plugins: Vec<String>,
}

async fn run_list_command(app: &App, args: ListArgs) -> anyhow::Result<()> {
    let containers = app.orchestrator.list_managed(&app.ctx).await?;

    app.register_builtins()?;

    let output = ListOutput {
        containers: containers.iter().map(ContainerRow::from).collect(),
        plugins: app.registry.list(ItemKind::Plugin),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if output.containers.is_empty() {
        println!("No repocate containers");
    } else {
        println!(
            "{:<28} {:<12} {:<9} {:<20} IMAGE",
            "NAME", "ID", "STATE", "CREATED"
        );
        for row in &output.containers {
            println!(
                "{:<28} {:<12} {:<9} {:<20} {}",
                row.name, row.id, row.state, row.created, row.image
            );
        }
    }
    println!("\nPlugins: {}", output.plugins.join(", "));
    Ok(())
}

// ============================================================================
// Plugin commands
// ============================================================================

/// Collects the injectable values given on the command line.
fn plugin_dependencies(args: &RegisterArgs) -> Dependencies {
    let mut deps = Dependencies::new()
        .with_optional("address", args.address.clone())
        .with_optional("token", args.token.clone())
        .with_optional("role_id", args.role_id.clone())
        .with_optional("secret_id", args.secret_id.clone())
        .with_optional("secret_path", args.secret_path.clone())
        .with_optional("auth_key", args.auth_key.clone())
        .with_optional("service_name", args.service.clone())
        .with_optional("exit_node", args.exit_node.clone())
        .with_optional("container", args.container.clone())
        .with_optional(
            "compose_file",
            args.compose_file.as_ref().map(|p| p.display().to_string()),
        );
    if args.funnel {
        deps = deps.with_named("funnel", "true");
    }
    if args.serve {
        deps = deps.with_named("serve", "true");
    }
    deps
}

async fn run_register_command(app: &App, args: RegisterArgs) -> anyhow::Result<()> {
    let plugin = app.builtin_plugin(&args.plugin).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown plugin '{}'. Available plugins: {}, {}",
            args.plugin,
            vault::PLUGIN_NAME,
            tailscale::PLUGIN_NAME
        )
    })?;
    app.registry.register(
        args.plugin.as_str(),
        RegistryItem::Plugin(plugin),
        RegisterMode::Reject,
    )?;

    let deps = plugin_dependencies(&args);
    if deps.is_empty() && !args.run {
        println!("Plugin {} registered (not configured)", args.plugin);
        return Ok(());
    }

    app.registry.inject_dependencies(&args.plugin, &deps)?;
    println!("Plugin {} registered and configured", args.plugin);

    if args.run {
        let summary = app.registry.execute_plugin(&args.plugin).await?;
        println!("{summary}");
    }
    Ok(())
}

fn run_unregister_command(app: &App, args: UnregisterArgs) -> anyhow::Result<()> {
    app.register_builtins()?;
    if app.registry.unregister(ItemKind::Plugin, &args.plugin) {
        println!("Plugin {} unregistered", args.plugin);
    } else {
        println!("Plugin {} is not registered", args.plugin);
    }
    Ok(())
}

// ============================================================================
// Event output
// ============================================================================

/// Prints events until both senders are gone.
async fn print_events(
    mut lifecycle: UnboundedReceiver<LifecycleEvent>,
    mut registry: UnboundedReceiver<RegistryEvent>,
) {
    let mut lifecycle_open = true;
    let mut registry_open = true;

    while lifecycle_open || registry_open {
        tokio::select! {
            event = lifecycle.recv(), if lifecycle_open => match event {
                Some(event) => {
                    if let Some(line) = render_lifecycle_event(&event) {
                        eprintln!("{line}");
                    }
                }
                None => lifecycle_open = false,
            },
            event = registry.recv(), if registry_open => match event {
                Some(event) => debug!(?event, "Registry event"),
                None => registry_open = false,
            },
        }
    }
}

/// One status line per event; `None` for events not worth showing.
fn render_lifecycle_event(event: &LifecycleEvent) -> Option<String> {
    match event {
        LifecycleEvent::Observed { .. } => None,
        LifecycleEvent::PullStarted { image } => Some(format!("Pulling {image}...")),
        LifecycleEvent::PullProgress { progress, .. } => {
            let mut line = match &progress.layer {
                Some(layer) => format!("  {layer}: {}", progress.status),
                None => format!("  {}", progress.status),
            };
            if let Some(bar) = &progress.progress {
                line.push(' ');
                line.push_str(bar);
            }
            Some(line)
        }
        LifecycleEvent::PullCompleted { image } => Some(format!("Pulled {image}")),
        LifecycleEvent::Created { name, .. } => Some(format!("Created container {name}")),
        LifecycleEvent::Started { name, .. } => Some(format!("Started container {name}")),
        LifecycleEvent::Unpaused { name, .. } => Some(format!("Unpaused container {name}")),
        LifecycleEvent::Stopped { name, .. } => Some(format!("Stopped container {name}")),
        LifecycleEvent::Removed { name, .. } => Some(format!("Removed container {name}")),
        LifecycleEvent::SessionOpened { name } => Some(format!("Entering {name}")),
        LifecycleEvent::SessionClosed { name } => Some(format!("Left {name}")),
    }
}

//! bootstrap-manifests - keeps control-plane bootstrap manifests converged

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use bootstrap_manifests::bootstrap::{render_desired, DefaultManifestRenderer};
use bootstrap_manifests::config::RuntimeConfig;
use bootstrap_manifests::controller::ManifestController;
use bootstrap_manifests::resources::{
    BootstrapManifestsConfigSpec, KubernetesRootSpec, Resource, ResourceType,
    CONTROL_PLANE_NAMESPACE,
};
use bootstrap_manifests::runtime::ControllerRuntime;
use bootstrap_manifests::store::{InMemoryStore, ResourceStore, WatchEvent};
use bootstrap_manifests::telemetry::{init_tracing, LogFormat, TelemetryConfig};

/// Render and maintain the bootstrap manifests of a control plane
#[derive(Parser, Debug)]
#[command(name = "bootstrap-manifests", version, about, long_about = None)]
struct Cli {
    /// Log line format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the desired manifests once and print them as YAML
    ///
    /// Manifests are printed in catalogue order, one document per object.
    Render(InputArgs),

    /// Run the manifest controller until interrupted
    ///
    /// Seeds an in-memory store with the given configuration and secrets,
    /// then logs every manifest change the controller makes.
    Run(RunArgs),
}

/// Input resources shared by both subcommands
#[derive(Args, Debug)]
struct InputArgs {
    /// Path to the BootstrapManifestsConfig YAML
    #[arg(short = 'c', long = "config", env = "BOOTSTRAP_MANIFESTS_CONFIG")]
    config_file: PathBuf,

    /// Path to the KubernetesRoot secrets YAML
    ///
    /// Empty secrets are used when omitted.
    #[arg(short = 's', long = "secrets", env = "BOOTSTRAP_MANIFESTS_SECRETS")]
    secrets_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    inputs: InputArgs,

    /// Path to the runtime configuration YAML
    #[arg(long = "runtime-config", env = "BOOTSTRAP_MANIFESTS_RUNTIME_CONFIG")]
    runtime_config_file: Option<PathBuf>,

    /// Watch buffer per namespace and type; overrides the runtime config
    #[arg(long, env = "BOOTSTRAP_MANIFESTS_WATCH_BUFFER")]
    watch_buffer: Option<usize>,

    /// Retries for render and other non-transient errors; overrides the runtime config
    #[arg(long, env = "BOOTSTRAP_MANIFESTS_MAX_ERROR_RETRIES")]
    max_error_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(TelemetryConfig {
        format: cli.log_format,
    })?;

    match cli.command {
        Commands::Render(args) => run_render(args),
        Commands::Run(args) => run_controller(args).await,
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_inputs(args: &InputArgs) -> anyhow::Result<(BootstrapManifestsConfigSpec, KubernetesRootSpec)> {
    let config = read_yaml(&args.config_file)?;
    let secrets = match &args.secrets_file {
        Some(path) => read_yaml(path)?,
        None => KubernetesRootSpec::default(),
    };
    Ok((config, secrets))
}

fn run_render(args: InputArgs) -> anyhow::Result<()> {
    let (config, secrets) = read_inputs(&args)?;
    let desired = render_desired(&DefaultManifestRenderer, &config, &secrets)?;

    for manifest in &desired {
        tracing::debug!(manifest = %manifest.id, objects = manifest.spec.objects().len(), "Rendered manifest");
        for object in manifest.spec.objects() {
            let doc = serde_yaml::to_string(object)
                .with_context(|| format!("failed to serialize manifest {}", manifest.id))?;
            println!("---\n# {}\n{}", manifest.id, doc.trim_end());
        }
    }
    Ok(())
}

async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    let mut runtime_config = match &args.runtime_config_file {
        Some(path) => RuntimeConfig::from_yaml_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(watch_buffer) = args.watch_buffer {
        runtime_config.watch_buffer = watch_buffer;
    }
    if let Some(retries) = args.max_error_retries {
        runtime_config.max_error_retries = retries;
    }

    let (config, secrets) = read_inputs(&args.inputs)?;

    let store = Arc::new(InMemoryStore::with_watch_buffer(runtime_config.watch_buffer));
    store
        .create(Resource::bootstrap_manifests_config(config))
        .await
        .context("failed to seed configuration")?;
    store
        .create(Resource::kubernetes_root(secrets))
        .await
        .context("failed to seed secrets")?;

    let mut changes = store
        .watch(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, None)
        .await?;

    let mut runtime = ControllerRuntime::new(store.clone(), runtime_config);
    runtime.register(Arc::new(ManifestController::new()))?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let watch_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = watch_cancel.cancelled() => break,
                event = changes.next() => event,
            };
            match event {
                Some(WatchEvent::Created(r)) => {
                    tracing::info!(manifest = %r.id(), version = %r.version(), "Manifest created")
                }
                Some(WatchEvent::Updated(r)) => {
                    tracing::info!(manifest = %r.id(), version = %r.version(), "Manifest updated")
                }
                Some(WatchEvent::Destroyed(r)) => {
                    tracing::info!(manifest = %r.id(), "Manifest destroyed")
                }
                Some(WatchEvent::Resync { missed }) => {
                    tracing::warn!(missed, "Manifest watch fell behind");
                }
                None => break,
            }
        }
    });

    tracing::info!("bootstrap-manifests starting");
    let result = runtime.run(cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = watcher.await {
        tracing::warn!(error = %e, "Manifest watcher task failed");
    }

    result?;
    tracing::info!("bootstrap-manifests shut down");
    Ok(())
}

//! Canopy - per-project development environments with hibernation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use canopy::archive::{self, HydrationOutcome};
use canopy::cluster::kube::{create_client, KubeClusterApi};
use canopy::compiler::ProjectCompiler;
use canopy::config::EngineConfig;
use canopy::controller::{Context, EnvironmentController, HibernationController};
use canopy::graph;
use canopy::persistence::{JsonFileProjectStore, ProjectStore};
use canopy::routing::RoutingGenerator;
use canopy::storage::s3::S3ObjectStore;
use canopy::workload::hydration::ENGINE_BINARY;

/// Canopy - multi-container development environments on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "canopy", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, env = "CANOPY_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the idle checker against a live cluster until interrupted
    ///
    /// Project records are read from a JSON snapshot file, which the
    /// controller also writes lifecycle fields back to.
    Controller(ControllerArgs),

    /// Restore a project archive into a volume (init container entry point)
    Hydrate(HydrateArgs),

    /// Archive a volume to object storage (preStop hook entry point)
    Dehydrate(ArchiveArgs),

    /// Regenerate the edge routing file
    Routes(RoutesArgs),

    /// Print the compiled manifests of a project as YAML
    Render(RenderArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Project snapshot file
    #[arg(long, env = "CANOPY_STATE_FILE")]
    state_file: PathBuf,

    /// Kubeconfig path (in-cluster config when omitted)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineConfig,
}

/// Location of a project archive
#[derive(Parser, Debug)]
struct ArchiveArgs {
    /// Volume root
    #[arg(long)]
    root: PathBuf,

    /// Archive bucket
    #[arg(long)]
    bucket: String,

    /// Archive object key
    #[arg(long)]
    key: String,
}

#[derive(Parser, Debug)]
struct HydrateArgs {
    #[command(flatten)]
    archive: ArchiveArgs,

    /// Copy this binary into the directory for the dehydration hook
    #[arg(long)]
    install_to: Option<PathBuf>,

    /// How long to wait for another pod that is restoring the same volume
    #[arg(long, default_value = "600")]
    wait_secs: u64,
}

#[derive(Parser, Debug)]
struct RoutesArgs {
    /// Project snapshot file; when given, slugs are read from it
    #[arg(long, env = "CANOPY_STATE_FILE", conflicts_with = "slugs")]
    state_file: Option<PathBuf>,

    /// Project slugs to route
    slugs: Vec<String>,

    /// Print the routing document instead of writing it
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    engine: EngineConfig,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Project snapshot file
    #[arg(long, env = "CANOPY_STATE_FILE")]
    state_file: PathBuf,

    /// Project id
    #[arg(long)]
    project: Uuid,

    #[command(flatten)]
    engine: EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client and the S3 SDK both sit on rustls; pin the aws-lc-rs provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Hydrate(args) => run_hydrate(args).await,
        Commands::Dehydrate(args) => run_dehydrate(args).await,
        Commands::Routes(args) => run_routes(args).await,
        Commands::Render(args) => run_render(args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Run the idle checker until Ctrl-C
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;
    let cluster = Arc::new(KubeClusterApi::new(client));
    let store = Arc::new(S3ObjectStore::from_env(args.engine.archive_bucket.clone()).await);
    let projects = Arc::new(
        JsonFileProjectStore::open(&args.state_file)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open {:?}: {}", args.state_file, e))?,
    );

    let ctx = Arc::new(
        Context::builder(cluster, store, projects)
            .config(args.engine)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?,
    );

    let routes = EnvironmentController::new(ctx.clone())
        .refresh_routes()
        .await
        .map_err(|e| anyhow::anyhow!("failed to write routing file: {}", e))?;
    tracing::info!(projects = routes.len(), "routing file written");

    let cancel = CancellationToken::new();
    let checker = {
        let controller = HibernationController::new(ctx);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen for shutdown signal: {}", e))?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    checker
        .await
        .map_err(|e| anyhow::anyhow!("idle checker panicked: {}", e))?;
    Ok(())
}

async fn run_hydrate(args: HydrateArgs) -> anyhow::Result<()> {
    if let Some(dir) = &args.install_to {
        let path = archive::install_binary(dir, ENGINE_BINARY)
            .map_err(|e| anyhow::anyhow!("failed to install binary: {}", e))?;
        tracing::info!(path = %path.display(), "installed dehydration tool");
    }

    let store = S3ObjectStore::from_env(args.archive.bucket).await;
    let outcome = archive::hydrate(
        &store,
        &args.archive.root,
        &args.archive.key,
        Duration::from_secs(args.wait_secs),
    )
    .await
    .map_err(|e| anyhow::anyhow!("hydration failed: {}", e))?;

    match outcome {
        HydrationOutcome::Restored { bytes } => {
            tracing::info!(key = %args.archive.key, bytes, "archive restored")
        }
        HydrationOutcome::Fresh => tracing::info!(key = %args.archive.key, "no archive, starting empty"),
        HydrationOutcome::RestoredByPeer => tracing::info!("volume restored by another pod"),
        HydrationOutcome::AlreadyHydrated => tracing::info!("volume already hydrated"),
    }
    Ok(())
}

async fn run_dehydrate(args: ArchiveArgs) -> anyhow::Result<()> {
    let store = S3ObjectStore::from_env(args.bucket).await;
    let size = archive::dehydrate(&store, &args.root, &args.key)
        .await
        .map_err(|e| {
            tracing::error!(alarm = true, key = %args.key, error = %e, "dehydration failed");
            anyhow::anyhow!("dehydration failed: {}", e)
        })?;
    tracing::info!(key = %args.key, size, "volume archived");
    Ok(())
}

async fn run_routes(args: RoutesArgs) -> anyhow::Result<()> {
    args.engine
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    let generator = RoutingGenerator::new(&args.engine);

    let slugs = match &args.state_file {
        Some(path) => JsonFileProjectStore::open(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open {:?}: {}", path, e))?
            .list_projects()
            .await
            .map_err(|e| anyhow::anyhow!("failed to list projects: {}", e))?
            .into_iter()
            .map(|p| p.slug)
            .collect(),
        None => args.slugs,
    };

    if args.dry_run {
        let yaml = generator
            .render(&slugs)
            .map_err(|e| anyhow::anyhow!("failed to render routes: {}", e))?;
        println!("{yaml}");
        return Ok(());
    }

    generator
        .write(&slugs)
        .map_err(|e| anyhow::anyhow!("failed to write routes: {}", e))?;
    tracing::info!(path = %generator.path().display(), projects = slugs.len(), "routing file written");
    Ok(())
}

async fn run_render(args: RenderArgs) -> anyhow::Result<()> {
    let store = JsonFileProjectStore::open(&args.state_file)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open {:?}: {}", args.state_file, e))?;
    let project = store
        .get_project(args.project)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let containers = store
        .containers(project.id)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let connections = store
        .connections(project.id)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let plan = graph::resolve(&containers, &connections);
    let manifests = ProjectCompiler::new(&args.engine)
        .compile(&project, &containers, &plan)
        .map_err(|e| anyhow::anyhow!("failed to compile project: {}", e))?;
    let yaml = manifests
        .to_yaml()
        .map_err(|e| anyhow::anyhow!("failed to serialize manifests: {}", e))?;
    println!("{yaml}");
    Ok(())
}

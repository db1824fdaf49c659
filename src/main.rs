//! AzureCluster controller - reconciles Cluster API infrastructure on Azure

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use azurecluster_controller::cloud::InMemoryCloud;
use azurecluster_controller::controller::{error_policy, reconcile, Context};
use azurecluster_controller::crd::AzureCluster;
use azurecluster_controller::rate_limit::{
    RateLimitConfig, RateLimiter, DEFAULT_API_BURST, DEFAULT_API_QPS,
};
use azurecluster_controller::scope::ExecutionScope;

/// Default log filter when RUST_LOG is unset
const DEFAULT_LOG_FILTER: &str = "info,azurecluster_controller=debug,kube=info,tower=warn,hyper=warn";

/// AzureCluster controller - deadline-bounded reconciliation of Azure infrastructure
#[derive(Parser, Debug)]
#[command(name = "azurecluster-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches AzureCluster resources and converges their resource group and
    /// virtual network.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Upper bound on one reconcile call in seconds (0 = unbounded)
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value = "0")]
    reconcile_timeout_secs: u64,

    /// Sustained cloud API calls per second, shared by all reconciles
    #[arg(long, env = "API_QPS", default_value_t = DEFAULT_API_QPS)]
    api_qps: f64,

    /// Cloud API burst capacity
    #[arg(long, env = "API_BURST", default_value_t = DEFAULT_API_BURST)]
    api_burst: u32,

    /// How long simulated cloud operations stay in progress, in seconds
    #[arg(long, env = "SIMULATED_OPERATION_SECS", default_value = "5")]
    simulated_operation_secs: u64,

    /// Only watch AzureClusters in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self::parse_from(["controller"])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format)?;

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&AzureCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

/// Install the global tracing subscriber
fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Option<Layer> implements Layer, so exactly one of these is active
    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

/// Run the AzureCluster controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    if args.api_qps.is_nan() || args.api_qps <= 0.0 {
        anyhow::bail!("--api-qps must be positive, got {}", args.api_qps);
    }
    if args.api_burst == 0 {
        anyhow::bail!("--api-burst must be at least 1");
    }

    tracing::info!(
        reconcile_timeout_secs = args.reconcile_timeout_secs,
        api_qps = args.api_qps,
        api_burst = args.api_burst,
        namespace = args.namespace.as_deref().unwrap_or("<all>"),
        "Starting AzureCluster controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let clusters: Api<AzureCluster> = match &args.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, cancelling in-flight reconciles");
            shutdown.cancel();
        }
    });

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        qps: args.api_qps,
        burst: args.api_burst,
    }));
    let cloud = Arc::new(
        InMemoryCloud::new()
            .with_operation_duration(Duration::from_secs(args.simulated_operation_secs)),
    );
    let ctx = Arc::new(
        Context::builder(client, cloud)
            .limiter(limiter)
            .reconcile_timeout(Duration::from_secs(args.reconcile_timeout_secs))
            .root(ExecutionScope::with_cancellation(shutdown.clone()))
            .build(),
    );

    Controller::new(clusters, WatcherConfig::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "AzureCluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "AzureCluster reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("AzureCluster controller stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

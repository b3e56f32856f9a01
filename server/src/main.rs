//! ferryd entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ferry_core::{ServerConfig, GIT_COMMIT, VERSION};
use ferry_runtime::{ChunkStore, KubeCluster, ShellRunner};
use ferry_server::{create_router, AppState};
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Serve the Docker Engine API by running Kubernetes pods.
#[derive(Parser, Debug)]
#[command(name = "ferryd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// YAML configuration file
    #[arg(long, short, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "FERRY_LISTEN")]
    listen: Option<String>,

    /// Namespace for workloads and secrets
    #[arg(long, env = "FERRY_NAMESPACE")]
    namespace: Option<String>,

    /// In-cluster registry host
    #[arg(long, env = "FERRY_REGISTRY")]
    registry: Option<String>,

    /// URL build pods reach this server under
    #[arg(long, env = "FERRY_ADVERTISE_URL")]
    advertise_url: Option<String>,

    /// Docker daemon to forward unsupported routes to
    #[arg(long, env = "FERRY_UPSTREAM")]
    upstream: Option<String>,

    /// Keep failed pods for inspection
    #[arg(long, env = "FERRY_RETAIN_FAILED")]
    retain_failed: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "FERRY_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Args {
    fn load_config(&self) -> ferry_core::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(registry) = &self.registry {
            config.registry = registry.clone();
        }
        if let Some(url) = &self.advertise_url {
            config.advertise_url = url.clone();
        }
        if let Some(upstream) = &self.upstream {
            config.upstream = Some(upstream.clone());
        }
        if self.retain_failed {
            config.retain_failed = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("Received SIGINT");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(Command::Version) = args.command {
        println!("version: {}\ngit commit: {}", VERSION, GIT_COMMIT);
        return Ok(());
    }

    init_tracing(args.log_format);
    let config = args.load_config()?;

    tracing::info!(
        version = VERSION,
        git_commit = GIT_COMMIT,
        listen = %config.listen,
        namespace = %config.namespace,
        registry = %config.registry,
        "Starting ferryd"
    );

    let store = ChunkStore::from_config(&config.store)?;
    let cluster = Arc::new(KubeCluster::connect(&config.namespace).await?);
    let listen = config.listen.clone();
    let state = AppState::new(config, cluster, Arc::new(ShellRunner::new()), store)?;

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(address = %listen, "Docker API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

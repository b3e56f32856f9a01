//! `ferry run` command: discover, tunnel, proxy, then run the wrapped command.

use std::net::SocketAddr;
use std::process::Stdio;

use clap::Args;
use ferry_core::{FerryError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::process::Command;

use crate::kube_context;
use crate::proxy::{ChunkingProxy, ProxyConfig};
use crate::tunnel::{self, Discovery, Tunnel, DEFAULT_SELECTOR, SERVER_PORT};

#[derive(Args)]
pub struct RunArgs {
    /// Kubeconfig context to use (defaults to the current context)
    #[arg(long, env = "FERRY_CONTEXT")]
    pub context: Option<String>,

    /// Namespace of the ferry server (defaults to the context's namespace)
    #[arg(short = 'n', long, env = "FERRY_NAMESPACE")]
    pub namespace: Option<String>,

    /// Allow this context even if it is not a local development cluster
    #[arg(long, env = "FERRY_ALLOW_CONTEXT")]
    pub allow_context: Option<String>,

    /// Label selector of the server pods
    #[arg(long, default_value = DEFAULT_SELECTOR)]
    pub selector: String,

    /// Port the server listens on inside its pod
    #[arg(long, default_value_t = SERVER_PORT)]
    pub port: u16,

    /// Send build contexts unchanged instead of deduplicating chunks
    #[arg(long)]
    pub no_chunking: bool,

    /// Command to run, e.g. `docker build .`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: RunArgs) -> std::result::Result<i32, Box<dyn std::error::Error>> {
    let target = kube_context::connect(
        args.context.as_deref(),
        args.namespace.as_deref(),
        args.allow_context.as_deref(),
    )
    .await?;
    let pods: Api<Pod> = Api::namespaced(target.client, &target.namespace);

    let pod = tunnel::find_server_pod(&pods, &args.selector, Discovery::default())
        .await
        .map_err(|e| format!("find ferry server in {}/{}: {}", target.context, target.namespace, e))?;
    let tunnel = Tunnel::open(pods, pod, args.port).await?;

    let config = ProxyConfig {
        chunker: if args.no_chunking {
            None
        } else {
            ProxyConfig::default().chunker
        },
        ..Default::default()
    };
    let proxy = ChunkingProxy::start(tunnel.local_addr(), config).await?;

    let code = run_command(&args.command, proxy.local_addr()).await;

    proxy.shutdown().await;
    tunnel.close().await;
    Ok(code?)
}

/// Run `command` with the Docker CLI pointed at `docker_addr` and return its
/// exit code.
pub async fn run_command(command: &[String], docker_addr: SocketAddr) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| FerryError::Config("command missing".to_string()))?;

    tracing::info!(command = %command.join(" "), docker_host = %docker_addr, "Executing command");
    let status = Command::new(program)
        .args(args)
        .env("DOCKER_HOST", format!("tcp://{}", docker_addr))
        // The server does not offer BuildKit sessions.
        .env("DOCKER_BUILDKIT", "0")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| FerryError::LocalExecution(format!("start {}: {}", program, e)))?;

    Ok(exit_code(status))
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

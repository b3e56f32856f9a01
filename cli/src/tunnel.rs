//! Server pod discovery and the local port-forward tunnel.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{FerryError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Port `ferryd` listens on inside its pod.
pub const SERVER_PORT: u16 = 2375;

/// Default label selector of the server pods.
pub const DEFAULT_SELECTOR: &str = "app=ferry";

/// Discovery policy: one listing per interval, up to this many attempts.
#[derive(Debug, Clone, Copy)]
pub struct Discovery {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

/// Source of candidate server pods.
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;
}

#[async_trait]
impl PodSource for Api<Pod> {
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(selector).limit(100);
        let pods = self
            .list(&params)
            .await
            .map_err(|e| FerryError::Cluster(format!("list pods {}: {}", selector, e)))?;
        Ok(pods.items)
    }
}

/// A pod is ready when it is Running and every condition is true.
pub fn is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .all(|c| c.status == "True")
}

/// Wait for a ready pod matching `selector` and return its name.
pub async fn find_server_pod(
    source: &dyn PodSource,
    selector: &str,
    discovery: Discovery,
) -> Result<String> {
    for attempt in 1..=discovery.attempts {
        let pods = source.list_pods(selector).await?;
        if let Some(name) = pods
            .iter()
            .filter(|pod| is_ready(pod))
            .find_map(|pod| pod.metadata.name.clone())
        {
            tracing::debug!(pod = %name, attempt, "Found server pod");
            return Ok(name);
        }
        tracing::debug!(selector, attempt, candidates = pods.len(), "No ready server pod yet");
        if attempt < discovery.attempts {
            tokio::time::sleep(discovery.interval).await;
        }
    }
    Err(FerryError::WorkloadNotFound(format!(
        "no running server pod matches {}",
        selector
    )))
}

/// A local listener forwarding every accepted connection to a pod port.
pub struct Tunnel {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Listen on an ephemeral loopback port and forward to `pod`:`port`.
    pub async fn open(pods: Api<Pod>, pod: String, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        tracing::info!(pod = %pod, port, local = %local_addr, "Forwarding to server pod");
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((conn, peer)) => {
                        let pods = pods.clone();
                        let pod = pod.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(&pods, &pod, port, conn).await {
                                tracing::warn!(peer = %peer, error = %e, "Port forward failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections.
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn forward_connection(pods: &Api<Pod>, pod: &str, port: u16, mut conn: TcpStream) -> Result<()> {
    let mut forwarder = pods
        .portforward(pod, &[port])
        .await
        .map_err(|e| FerryError::Cluster(format!("port-forward to {}: {}", pod, e)))?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| FerryError::Cluster(format!("port {} not forwarded by {}", port, pod)))?;

    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| FerryError::Cluster(format!("close port-forward to {}: {}", pod, e)))
}

//! Kubeconfig context selection and the development-cluster guard.
//!
//! `ferry` builds images inside whatever cluster the context points at, so
//! it refuses contexts that do not look like a local development cluster
//! unless the user names the context explicitly.

use ferry_core::{FerryError, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

/// Context names used by local development clusters.
const LOCAL_CONTEXTS: &[&str] = &[
    "minikube",
    "docker-for-desktop",
    "docker-desktop",
    "microk8s",
    "crc",
    "krucible",
    "rancher-desktop",
];

/// Prefixes of generated local cluster context names.
const LOCAL_PREFIXES: &[&str] = &["kind-", "k3d-"];

/// Whether `name` is the context of a well-known local cluster.
pub fn is_local_cluster(name: &str) -> bool {
    LOCAL_CONTEXTS.contains(&name) || LOCAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Accept `context` if it is the explicitly allowed one or a local cluster.
pub fn check_allowed(context: &str, allowed: Option<&str>) -> Result<()> {
    if allowed.is_some_and(|a| a == context) || is_local_cluster(context) {
        return Ok(());
    }
    Err(FerryError::Config(format!(
        "context {} does not appear to be a development environment; \
         pass --allow-context {} to use it anyway",
        context, context
    )))
}

/// A client bound to one kubeconfig context.
pub struct KubeTarget {
    pub client: Client,
    pub context: String,
    pub namespace: String,
}

/// Load the kubeconfig, pick the context (`context` or the current one),
/// enforce the guard and connect.
pub async fn connect(
    context: Option<&str>,
    namespace: Option<&str>,
    allowed: Option<&str>,
) -> Result<KubeTarget> {
    let kubeconfig = Kubeconfig::read()
        .map_err(|e| FerryError::Config(format!("read kubeconfig: {}", e)))?;
    let context = match context {
        Some(context) => context.to_string(),
        None => kubeconfig
            .current_context
            .clone()
            .ok_or_else(|| FerryError::Config("kubeconfig has no current context".to_string()))?,
    };
    check_allowed(&context, allowed)?;

    let options = KubeConfigOptions {
        context: Some(context.clone()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| FerryError::Config(format!("load context {}: {}", context, e)))?;
    let namespace = namespace
        .map(str::to_string)
        .unwrap_or_else(|| config.default_namespace.clone());
    let client = Client::try_from(config)
        .map_err(|e| FerryError::Cluster(format!("create client for {}: {}", context, e)))?;

    tracing::debug!(context = %context, namespace = %namespace, "Connected to cluster");
    Ok(KubeTarget {
        client,
        context,
        namespace,
    })
}

//! Kubernetes implementation of the cluster seam.

use async_stream::try_stream;
use async_trait::async_trait;
use ferry_core::{FerryError, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::{Api, Client};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;

use super::{ClusterApi, LogStream, WorkloadPhase};

/// Log reads are forwarded as they arrive, at most this many bytes at a time.
const LOG_READ_SIZE: usize = 1024;

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn admission_error(resource: &str, err: kube::Error) -> FerryError {
    let message = match &err {
        kube::Error::Api(response) => response.message.clone(),
        other => other.to_string(),
    };
    FerryError::Admission {
        resource: resource.to_string(),
        message,
    }
}

fn cluster_error(action: &str, name: &str, err: kube::Error) -> FerryError {
    FerryError::Cluster(format!("{} {}: {}", action, name, err))
}

/// Pods and secrets of one namespace.
#[derive(Clone)]
pub struct KubeCluster {
    pods: Api<Pod>,
    secrets: Api<Secret>,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Connect with the in-cluster service account or the local kubeconfig.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| FerryError::Cluster(format!("connect to cluster: {}", e)))?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_pod(&self, pod: Pod) -> Result<String> {
        let created = self
            .pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| admission_error("pod", e))?;
        created
            .metadata
            .name
            .ok_or_else(|| FerryError::Cluster("created pod has no name".to_string()))
    }

    async fn pod_phase(&self, name: &str) -> Result<WorkloadPhase> {
        let pod = self.pods.get(name).await.map_err(|e| {
            if is_not_found(&e) {
                FerryError::WorkloadNotFound(name.to_string())
            } else {
                cluster_error("look up pod", name, e)
            }
        })?;
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        Ok(WorkloadPhase::from_pod_phase(phase))
    }

    async fn pod_logs(&self, name: &str) -> Result<LogStream> {
        let pods = self.pods.clone();
        let name = name.to_string();
        let params = LogParams {
            follow: true,
            ..LogParams::default()
        };

        let stream = try_stream! {
            let reader = pods.log_stream(&name, &params).await.map_err(|e| {
                if is_not_found(&e) {
                    FerryError::WorkloadNotFound(name.clone())
                } else {
                    cluster_error("stream logs of", &name, e)
                }
            })?;
            let mut chunks = ReaderStream::with_capacity(reader.compat(), LOG_READ_SIZE);
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| {
                    FerryError::Cluster(format!("read logs of {}: {}", name, e))
                })?;
                yield chunk;
            }
        };
        Ok(stream.boxed())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(FerryError::WorkloadNotFound(name.to_string())),
            Err(e) => Err(cluster_error("delete pod", name, e)),
        }
    }

    async fn create_secret(&self, secret: Secret) -> Result<String> {
        let created = self
            .secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| admission_error("secret", e))?;
        created
            .metadata
            .name
            .ok_or_else(|| FerryError::Cluster("created secret has no name".to_string()))
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.secrets
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| cluster_error("delete secret", name, e))
    }
}

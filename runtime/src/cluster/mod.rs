//! Cluster seam.
//!
//! The lifecycle engine and secret manager only talk to the cluster through
//! [`ClusterApi`]. [`KubeCluster`] implements it against a Kubernetes API
//! server; [`MemoryCluster`] is a scripted in-process cluster for tests and
//! dry runs.

mod k8s;
mod memory;

pub use self::k8s::KubeCluster;
pub use self::memory::{MemoryCluster, PodRecord};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::Result;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Secret};

/// Live log output of a workload.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Workload phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    /// Parse a pod's `status.phase`. Absent and `Unknown` phases count as
    /// pending so the engine keeps polling.
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => WorkloadPhase::Running,
            Some("Succeeded") => WorkloadPhase::Succeeded,
            Some("Failed") => WorkloadPhase::Failed,
            _ => WorkloadPhase::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations ferry needs from the cluster, all scoped to one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a pod and return its generated name.
    async fn create_pod(&self, pod: Pod) -> Result<String>;

    /// Current phase. A pod that no longer exists is
    /// [`ferry_core::FerryError::WorkloadNotFound`].
    async fn pod_phase(&self, name: &str) -> Result<WorkloadPhase>;

    /// Follow the pod's log until the container exits.
    async fn pod_logs(&self, name: &str) -> Result<LogStream>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Create a secret and return its generated name.
    async fn create_secret(&self, secret: Secret) -> Result<String>;

    async fn delete_secret(&self, name: &str) -> Result<()>;
}

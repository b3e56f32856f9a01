//! Scripted in-process cluster.
//!
//! Pods walk through a configured phase sequence, one step per poll, and
//! emit configured log chunks. Every create and delete is recorded so
//! callers can assert on cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::{FerryError, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use parking_lot::Mutex;

use super::{ClusterApi, LogStream, WorkloadPhase};

/// A pod created on a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct PodRecord {
    pub name: String,
    pub pod: Pod,
    pub polls: usize,
}

#[derive(Default)]
struct State {
    pods: HashMap<String, PodRecord>,
    created_pods: Vec<String>,
    deleted_pods: Vec<String>,
    secrets: HashMap<String, Secret>,
    created_secrets: Vec<String>,
    deleted_secrets: Vec<String>,
}

/// In-process [`ClusterApi`] implementation.
pub struct MemoryCluster {
    phases: Vec<WorkloadPhase>,
    logs: Vec<Bytes>,
    reject_pods: Option<String>,
    reject_secrets: Option<String>,
    fail_deletes: bool,
    counter: AtomicUsize,
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Pods go Pending, Running, Succeeded and log nothing.
    pub fn new() -> Self {
        Self {
            phases: vec![
                WorkloadPhase::Pending,
                WorkloadPhase::Running,
                WorkloadPhase::Succeeded,
            ],
            logs: Vec::new(),
            reject_pods: None,
            reject_secrets: None,
            fail_deletes: false,
            counter: AtomicUsize::new(0),
            state: Mutex::new(State::default()),
        }
    }

    /// Phases reported by successive polls; the last one repeats.
    pub fn with_phases(mut self, phases: Vec<WorkloadPhase>) -> Self {
        if !phases.is_empty() {
            self.phases = phases;
        }
        self
    }

    /// Log chunks every pod emits.
    pub fn with_logs<I, B>(mut self, logs: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.logs = logs.into_iter().map(Into::into).collect();
        self
    }

    /// Refuse pod creation with this message.
    pub fn rejecting_pods(mut self, message: &str) -> Self {
        self.reject_pods = Some(message.to_string());
        self
    }

    /// Refuse secret creation with this message.
    pub fn rejecting_secrets(mut self, message: &str) -> Self {
        self.reject_secrets = Some(message.to_string());
        self
    }

    /// Make every delete fail after recording it.
    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    fn generate_name(&self, prefix: Option<&str>) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{:05x}", prefix.unwrap_or("memory-"), n)
    }

    pub fn created_pods(&self) -> Vec<String> {
        self.state.lock().created_pods.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted_pods.clone()
    }

    pub fn created_secrets(&self) -> Vec<String> {
        self.state.lock().created_secrets.clone()
    }

    pub fn deleted_secrets(&self) -> Vec<String> {
        self.state.lock().deleted_secrets.clone()
    }

    pub fn pod(&self, name: &str) -> Option<PodRecord> {
        self.state.lock().pods.get(name).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state.lock().secrets.get(name).cloned()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create_pod(&self, pod: Pod) -> Result<String> {
        if let Some(message) = &self.reject_pods {
            return Err(FerryError::Admission {
                resource: "pod".to_string(),
                message: message.clone(),
            });
        }
        let name = self.generate_name(pod.metadata.generate_name.as_deref());
        let mut state = self.state.lock();
        state.created_pods.push(name.clone());
        state.pods.insert(
            name.clone(),
            PodRecord {
                name: name.clone(),
                pod,
                polls: 0,
            },
        );
        Ok(name)
    }

    async fn pod_phase(&self, name: &str) -> Result<WorkloadPhase> {
        let mut state = self.state.lock();
        let record = state
            .pods
            .get_mut(name)
            .ok_or_else(|| FerryError::WorkloadNotFound(name.to_string()))?;
        let step = record.polls.min(self.phases.len() - 1);
        record.polls += 1;
        Ok(self.phases[step])
    }

    async fn pod_logs(&self, name: &str) -> Result<LogStream> {
        if !self.state.lock().pods.contains_key(name) {
            return Err(FerryError::WorkloadNotFound(name.to_string()));
        }
        let logs: Vec<Result<Bytes>> = self.logs.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(logs).boxed())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.deleted_pods.push(name.to_string());
        if self.fail_deletes {
            return Err(FerryError::Cluster(format!("delete pod {}: refused", name)));
        }
        state
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FerryError::WorkloadNotFound(name.to_string()))
    }

    async fn create_secret(&self, secret: Secret) -> Result<String> {
        if let Some(message) = &self.reject_secrets {
            return Err(FerryError::Admission {
                resource: "secret".to_string(),
                message: message.clone(),
            });
        }
        let name = self.generate_name(secret.metadata.generate_name.as_deref());
        let mut state = self.state.lock();
        state.created_secrets.push(name.clone());
        state.secrets.insert(name.clone(), secret);
        Ok(name)
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.deleted_secrets.push(name.to_string());
        if self.fail_deletes {
            return Err(FerryError::Cluster(format!("delete secret {}: refused", name)));
        }
        state.secrets.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(prefix: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some(prefix.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_phase_sequence_repeats_last() {
        let cluster = MemoryCluster::new()
            .with_phases(vec![WorkloadPhase::Pending, WorkloadPhase::Failed]);
        let name = cluster.create_pod(pod("ferry-push-")).await.unwrap();
        assert!(name.starts_with("ferry-push-"));
        assert_eq!(cluster.pod_phase(&name).await.unwrap(), WorkloadPhase::Pending);
        assert_eq!(cluster.pod_phase(&name).await.unwrap(), WorkloadPhase::Failed);
        assert_eq!(cluster.pod_phase(&name).await.unwrap(), WorkloadPhase::Failed);
        assert_eq!(cluster.pod(&name).unwrap().polls, 3);
    }

    #[tokio::test]
    async fn test_names_are_unique() {
        let cluster = MemoryCluster::new();
        let a = cluster.create_pod(pod("x-")).await.unwrap();
        let b = cluster.create_pod(pod("x-")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_logs_and_deletion() {
        let cluster = MemoryCluster::new().with_logs(["a", "b"]);
        let name = cluster.create_pod(pod("p-")).await.unwrap();
        let logs: Vec<Bytes> = cluster.pod_logs(&name).await.unwrap().try_collect().await.unwrap();
        assert_eq!(logs, vec![Bytes::from("a"), Bytes::from("b")]);

        cluster.delete_pod(&name).await.unwrap();
        assert!(matches!(
            cluster.pod_phase(&name).await,
            Err(FerryError::WorkloadNotFound(_))
        ));
        assert_eq!(cluster.deleted_pods(), vec![name]);
    }

    #[tokio::test]
    async fn test_rejections() {
        let cluster = MemoryCluster::new()
            .rejecting_pods("quota exceeded")
            .rejecting_secrets("forbidden");
        assert!(matches!(
            cluster.create_pod(pod("p-")).await,
            Err(FerryError::Admission { .. })
        ));
        assert!(matches!(
            cluster.create_secret(Secret::default()).await,
            Err(FerryError::Admission { .. })
        ));
        assert!(cluster.created_pods().is_empty());
    }
}

//! Workload lifecycle engine.
//!
//! Runs one pod to completion: create it, poll its phase until it leaves
//! Pending, relay its log, settle on a terminal phase and clean up. The
//! engine only observes phases; the one transition it causes is deletion.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{FerryError, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterApi, WorkloadPhase};
use crate::output::OutputSink;

/// Engine timing and retention settings.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Interval between phase polls
    pub poll_interval: Duration,
    /// Bound on each best-effort deletion
    pub cleanup_timeout: Duration,
    /// Keep failed pods for inspection
    pub retain_failed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            cleanup_timeout: Duration::from_secs(10),
            retain_failed: false,
        }
    }
}

/// Runs workloads on a cluster.
#[derive(Clone)]
pub struct WorkloadEngine {
    cluster: Arc<dyn ClusterApi>,
    config: EngineConfig,
}

fn cancelled() -> FerryError {
    FerryError::Cancelled("operation cancelled or deadline exceeded".to_string())
}

impl WorkloadEngine {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: EngineConfig) -> Self {
        Self { cluster, config }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Run `pod` to a terminal phase, relaying its log to `sink`.
    ///
    /// Creation failures abort immediately. Once the pod exists it is
    /// deleted on every outcome, unless it failed and retention is enabled.
    /// Cancellation stops the wait or the log relay but not the cleanup.
    pub async fn run(&self, pod: Pod, sink: &dyn OutputSink, cancel: &CancellationToken) -> Result<()> {
        sink.progress("Creating new pod.\n").await?;

        let name = match self.cluster.create_pod(pod).await {
            Ok(name) => name,
            Err(e) => {
                let _ = sink.progress(&format!("Pod creation failed: {}\n", e)).await;
                tracing::warn!(error = %e, "Workload creation failed");
                return Err(e);
            }
        };
        tracing::info!(workload = %name, "Created workload");

        let result = self.supervise(&name, sink, cancel).await;
        self.cleanup(&name, &result, sink).await;

        match &result {
            Ok(()) => tracing::info!(workload = %name, "Workload succeeded"),
            Err(e) => tracing::warn!(workload = %name, error = %e, "Workload did not succeed"),
        }
        result
    }

    async fn supervise(&self, name: &str, sink: &dyn OutputSink, cancel: &CancellationToken) -> Result<()> {
        sink.progress(&format!("Created pod {}.\n", name)).await?;
        sink.progress("Waiting for pod execution.\n").await?;

        // Terminal phase, if it was already reached before the log was opened.
        let mut terminal = loop {
            match self.poll(name, cancel).await? {
                WorkloadPhase::Pending => self.sleep(cancel).await?,
                WorkloadPhase::Running => break None,
                phase => break Some(phase),
            }
        };

        sink.progress("Streaming logs.\n").await?;
        self.relay_logs(name, sink, cancel).await?;
        sink.progress("End of logs reached.\n").await?;

        // The log can end before the pod reports a terminal phase.
        while terminal.is_none() {
            match self.poll(name, cancel).await? {
                phase if phase.is_terminal() => terminal = Some(phase),
                _ => self.sleep(cancel).await?,
            }
        }

        match terminal {
            Some(WorkloadPhase::Succeeded) => Ok(()),
            Some(phase) => Err(FerryError::WorkloadFailed {
                name: name.to_string(),
                phase: phase.to_string(),
            }),
            None => unreachable!("loop exits only with a terminal phase"),
        }
    }

    async fn poll(&self, name: &str, cancel: &CancellationToken) -> Result<WorkloadPhase> {
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            phase = self.cluster.pod_phase(name) => {
                let phase = phase?;
                tracing::trace!(workload = %name, phase = %phase, "Polled workload phase");
                Ok(phase)
            }
        }
    }

    async fn sleep(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            _ = tokio::time::sleep(self.config.poll_interval) => Ok(()),
        }
    }

    async fn relay_logs(&self, name: &str, sink: &dyn OutputSink, cancel: &CancellationToken) -> Result<()> {
        let mut logs = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            logs = self.cluster.pod_logs(name) => logs?,
        };

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                chunk = logs.next() => chunk,
            };
            match chunk {
                Some(Ok(data)) => sink.output(&data).await?,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn cleanup(&self, name: &str, result: &Result<()>, sink: &dyn OutputSink) {
        let failed = matches!(result, Err(FerryError::WorkloadFailed { .. }));
        if failed && self.config.retain_failed {
            let _ = sink.progress("Pod failed. Skipping cleanup.\n").await;
            tracing::info!(workload = %name, "Retaining failed workload");
            return;
        }

        let _ = sink.progress("Deleting pod.\n").await;
        match tokio::time::timeout(self.config.cleanup_timeout, self.cluster.delete_pod(name)).await {
            Ok(Ok(())) => tracing::debug!(workload = %name, "Deleted workload"),
            Ok(Err(e)) => {
                let _ = sink.progress(&format!("Pod deletion failed: {}\n", e)).await;
                tracing::warn!(workload = %name, error = %e, "Failed to delete workload");
            }
            Err(_) => {
                tracing::warn!(workload = %name, "Timed out deleting workload");
            }
        }
    }
}

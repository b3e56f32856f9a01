//! Dual-path scheduling.
//!
//! Lightweight operations run in-process when a local slot frees up within
//! the acquire timeout; everything else, and anything that cannot get a
//! slot in time, runs as a cluster workload. Both paths run the same
//! script and report through the same sink.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::image::InternalRegistry;
use ferry_core::{OperationKind, OperationRequest, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::WorkloadEngine;
use crate::local::LocalRunner;
use crate::output::OutputSink;
use crate::script::Script;
use crate::secret::SecretManager;
use crate::workload::WorkloadBuilder;

/// Scheduler admission settings.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Concurrent in-process lightweight operations
    pub local_slots: usize,
    /// Concurrent in-process builds
    pub build_slots: usize,
    /// Wait for a local slot before falling back to the cluster
    pub acquire_timeout: Duration,
    /// Let builds take the local path. Off in every deployment today; the
    /// build semaphore is only an admission point for it.
    pub local_builds: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            local_slots: 5,
            build_slots: 1,
            acquire_timeout: Duration::from_secs(5),
            local_builds: false,
        }
    }
}

/// Where an operation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Local,
    Cluster,
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPath::Local => f.write_str("local"),
            ExecutionPath::Cluster => f.write_str("cluster"),
        }
    }
}

/// Routes operations to the local runner or the workload engine.
pub struct Scheduler {
    config: SchedulerConfig,
    light: Arc<Semaphore>,
    build: Arc<Semaphore>,
    local: Arc<dyn LocalRunner>,
    engine: WorkloadEngine,
    secrets: SecretManager,
    workloads: WorkloadBuilder,
    registry: InternalRegistry,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        local: Arc<dyn LocalRunner>,
        engine: WorkloadEngine,
        secrets: SecretManager,
        workloads: WorkloadBuilder,
        registry: InternalRegistry,
    ) -> Self {
        Self {
            light: Arc::new(Semaphore::new(config.local_slots)),
            build: Arc::new(Semaphore::new(config.build_slots)),
            config,
            local,
            engine,
            secrets,
            workloads,
            registry,
        }
    }

    pub fn registry(&self) -> &InternalRegistry {
        &self.registry
    }

    /// Run `request` to completion.
    ///
    /// Builds need the URL their context can be fetched from.
    pub async fn execute(
        &self,
        request: &OperationRequest,
        context_url: Option<&str>,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPath> {
        let kind = request.kind();
        let script = Script::for_request(request, &self.registry, context_url)?;

        if let Some(permit) = self.local_slot(kind).await {
            tracing::info!(operation = %kind, path = %ExecutionPath::Local, "Scheduling operation");
            let result = self
                .local
                .run(&script, request.credentials(), sink, cancel)
                .await;
            drop(permit);
            return result.map(|()| ExecutionPath::Local);
        }

        tracing::info!(operation = %kind, path = %ExecutionPath::Cluster, "Scheduling operation");
        self.run_workload(request, &script, sink, cancel).await?;
        Ok(ExecutionPath::Cluster)
    }

    /// A local slot for `kind`, if one frees up within the acquire timeout.
    /// The permit is returned when dropped, on every exit path.
    async fn local_slot(&self, kind: OperationKind) -> Option<OwnedSemaphorePermit> {
        let semaphore = if kind.is_lightweight() {
            &self.light
        } else if self.config.local_builds {
            &self.build
        } else {
            return None;
        };

        match tokio::time::timeout(self.config.acquire_timeout, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(operation = %kind, "No local slot available");
                None
            }
        }
    }

    async fn run_workload(
        &self,
        request: &OperationRequest,
        script: &Script,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let kind = request.kind();
        let secret = if kind.needs_credentials() {
            Some(self.secrets.create(request.credentials()).await?)
        } else {
            None
        };

        let pod = self.workloads.pod(
            kind,
            script,
            request.limits(),
            secret.as_ref().map(|s| s.name()),
        );
        let result = self.engine.run(pod, sink, cancel).await;

        if let Some(secret) = secret {
            self.secrets.delete(secret).await;
        }
        result
    }
}

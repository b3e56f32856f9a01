//! Shared application state.

use std::sync::Arc;

use ferry_core::image::InternalRegistry;
use ferry_core::{FerryError, Result, ServerConfig};
use ferry_runtime::{
    ChunkStore, ClusterApi, EngineConfig, LocalRunner, Scheduler, SchedulerConfig, SecretManager,
    WorkloadBuilder, WorkloadEngine,
};
use url::Url;

/// Everything a request handler needs.
pub struct AppState {
    pub config: ServerConfig,
    pub store: ChunkStore,
    pub scheduler: Scheduler,
    pub upstream: Option<Upstream>,
}

/// Docker daemon that unrecognized routes are forwarded to.
pub struct Upstream {
    pub base: Url,
    pub client: reqwest::Client,
}

impl AppState {
    /// Wire the scheduler, engine and secret manager from `config`.
    pub fn new(
        config: ServerConfig,
        cluster: Arc<dyn ClusterApi>,
        local: Arc<dyn LocalRunner>,
        store: ChunkStore,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let engine = WorkloadEngine::new(
            cluster.clone(),
            EngineConfig {
                poll_interval: config.poll_interval(),
                cleanup_timeout: config.cleanup_timeout(),
                retain_failed: config.retain_failed,
            },
        );
        let scheduler = Scheduler::new(
            SchedulerConfig {
                local_slots: config.local_slots,
                build_slots: config.build_slots,
                acquire_timeout: config.local_acquire_timeout(),
                local_builds: false,
            },
            local,
            engine,
            SecretManager::new(cluster, config.cleanup_timeout()),
            WorkloadBuilder::new(config.images.clone(), config.max_execution_time()),
            InternalRegistry::new(config.registry.as_str()),
        );

        let upstream = match &config.upstream {
            Some(upstream) => Some(Upstream {
                base: Url::parse(upstream).map_err(|e| {
                    FerryError::Config(format!("invalid upstream URL {}: {}", upstream, e))
                })?,
                client: reqwest::Client::new(),
            }),
            None => None,
        };

        Ok(Arc::new(Self {
            config,
            store,
            scheduler,
            upstream,
        }))
    }

    pub fn registry(&self) -> &InternalRegistry {
        self.scheduler.registry()
    }
}

//! Operation model.
//!
//! One [`OperationRequest`] is built per inbound Docker API call and is not
//! modified afterwards; everything downstream (scripts, pod specs, secrets)
//! is derived from it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::DockerConfig;

/// The image operations ferry executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Build,
    Push,
    Pull,
    Tag,
    Inspect,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Build => "build",
            OperationKind::Push => "push",
            OperationKind::Pull => "pull",
            OperationKind::Tag => "tag",
            OperationKind::Inspect => "inspect",
        }
    }

    /// Whether the operation may run on the in-process fast path.
    pub fn is_lightweight(&self) -> bool {
        !matches!(self, OperationKind::Build)
    }

    /// Whether the workload needs a mounted registry credentials file.
    pub fn needs_credentials(&self) -> bool {
        !matches!(self, OperationKind::Tag | OperationKind::Inspect)
    }

    /// Prefix for generated workload names, e.g. `ferry-push-`.
    pub fn name_prefix(&self) -> String {
        format!("ferry-{}-", self.as_str())
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory envelope of one workload. Requests equal limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU in milli-units (1000 = one core)
    pub cpu_millis: u64,
    /// Memory in bytes
    pub memory_bytes: u64,
}

impl ResourceLimits {
    /// Default envelope for builds: one core, 2 GiB.
    pub const fn build_default() -> Self {
        Self {
            cpu_millis: 1000,
            memory_bytes: 2 * 1024 * 1024 * 1024,
        }
    }

    /// Default envelope for skopeo copies: 200m, 100 MiB.
    pub const fn skopeo_default() -> Self {
        Self {
            cpu_millis: 200,
            memory_bytes: 100 * 1024 * 1024,
        }
    }

    /// Convert a Docker CFS quota/period pair to milli-units.
    pub fn cpu_millis_from_quota(quota: u64, period: u64) -> u64 {
        if period == 0 {
            return 0;
        }
        quota.saturating_mul(1000) / period
    }

    /// Kubernetes quantity string for the CPU limit.
    pub fn cpu_quantity(&self) -> String {
        format!("{}m", self.cpu_millis)
    }

    /// Kubernetes quantity string for the memory limit.
    pub fn memory_quantity(&self) -> String {
        self.memory_bytes.to_string()
    }
}

/// Build-specific parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Dockerfile path relative to the context root
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Target stage
    pub target: Option<String>,
    /// Single cache source reference
    pub cache_from: Option<String>,
    pub no_cache: bool,
    /// Requested tags, in request order
    pub tags: Vec<String>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            ..Default::default()
        }
    }
}

/// A fully validated image operation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    kind: OperationKind,
    source: Option<String>,
    target: Option<String>,
    limits: ResourceLimits,
    build: Option<BuildOptions>,
    credentials: DockerConfig,
    context_key: Option<String>,
}

impl OperationRequest {
    /// A build of the context stored under `context_key`.
    pub fn build(
        options: BuildOptions,
        limits: ResourceLimits,
        credentials: DockerConfig,
        context_key: impl Into<String>,
    ) -> Self {
        Self {
            kind: OperationKind::Build,
            source: None,
            target: None,
            limits,
            build: Some(options),
            credentials,
            context_key: Some(context_key.into()),
        }
    }

    /// Copy `source` to `target`, both fully qualified.
    pub fn copy(
        kind: OperationKind,
        source: impl Into<String>,
        target: impl Into<String>,
        limits: ResourceLimits,
        credentials: DockerConfig,
    ) -> Self {
        Self {
            kind,
            source: Some(source.into()),
            target: Some(target.into()),
            limits,
            build: None,
            credentials,
            context_key: None,
        }
    }

    /// Inspect the image stored at `source`.
    pub fn inspect(source: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            kind: OperationKind::Inspect,
            source: Some(source.into()),
            target: None,
            limits,
            build: None,
            credentials: DockerConfig::default(),
            context_key: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn build_options(&self) -> Option<&BuildOptions> {
        self.build.as_ref()
    }

    pub fn credentials(&self) -> &DockerConfig {
        &self.credentials
    }

    pub fn context_key(&self) -> Option<&str> {
        self.context_key.as_deref()
    }
}

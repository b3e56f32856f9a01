//! Server configuration.
//!
//! Every field has a default so an empty YAML document is a valid config;
//! `ferryd` flags override individual values after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FerryError, Result};
use crate::operation::ResourceLimits;

/// `ferryd` configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the Docker API listens on
    pub listen: String,

    /// Namespace for workloads and credential secrets
    pub namespace: String,

    /// In-cluster registry host (`host:port`)
    pub registry: String,

    /// URL under which build pods can reach this server
    pub advertise_url: String,

    /// Docker daemon to forward unrecognized routes to
    pub upstream: Option<String>,

    /// Keep failed workloads for inspection
    pub retain_failed: bool,

    /// Upper bound on one operation, in seconds
    pub max_execution_secs: u64,

    /// Phase polling interval, in milliseconds
    pub poll_interval_ms: u64,

    /// Timeout for best-effort deletions, in seconds
    pub cleanup_timeout_secs: u64,

    /// Concurrent in-process lightweight operations
    pub local_slots: usize,

    /// Concurrent in-process builds (admission point only)
    pub build_slots: usize,

    /// How long to wait for a local slot before scheduling a workload, in seconds
    pub local_acquire_timeout_secs: u64,

    /// Lifetime of presigned context URLs, in seconds
    pub context_url_ttl_secs: u64,

    /// Container images
    pub images: ImageConfig,

    /// Resource envelopes per workload type
    pub resources: ResourceConfig,

    /// Object store backend
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2375".to_string(),
            namespace: "default".to_string(),
            registry: "ferry-registry:5000".to_string(),
            advertise_url: "http://ferry:2375".to_string(),
            upstream: None,
            retain_failed: false,
            max_execution_secs: 30 * 60,
            poll_interval_ms: 1000,
            cleanup_timeout_secs: 10,
            local_slots: 5,
            build_slots: 1,
            local_acquire_timeout_secs: 5,
            context_url_ttl_secs: 15 * 60,
            images: ImageConfig::default(),
            resources: ResourceConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| FerryError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.local_slots == 0 {
            return Err(FerryError::Config("local_slots must be at least 1".into()));
        }
        if self.build_slots == 0 {
            return Err(FerryError::Config("build_slots must be at least 1".into()));
        }
        if self.max_execution_secs == 0 {
            return Err(FerryError::Config(
                "max_execution_secs must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(FerryError::Config("poll_interval_ms must be positive".into()));
        }
        if self.registry.is_empty() {
            return Err(FerryError::Config("registry must be set".into()));
        }
        if let StoreConfig::S3 { bucket, .. } = &self.store {
            if bucket.is_empty() {
                return Err(FerryError::Config("s3 bucket must be set".into()));
            }
        }
        Ok(())
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn local_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.local_acquire_timeout_secs)
    }

    pub fn context_url_ttl(&self) -> Duration {
        Duration::from_secs(self.context_url_ttl_secs)
    }
}

/// Container images used by workloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub buildkit: String,
    pub skopeo: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            buildkit: "moby/buildkit:v0.12.5-rootless".to_string(),
            skopeo: "quay.io/skopeo/stable:v1.14".to_string(),
        }
    }
}

/// Resource envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub build: ResourceLimits,
    pub skopeo: ResourceLimits,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            build: ResourceLimits::build_default(),
            skopeo: ResourceLimits::skopeo_default(),
        }
    }
}

/// Object store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process memory; contents are lost on restart
    #[default]
    Memory,

    /// Local directory
    Filesystem { path: PathBuf },

    /// S3-compatible bucket
    S3 {
        #[serde(default)]
        endpoint: Option<String>,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        access_key_file: Option<PathBuf>,
        #[serde(default)]
        secret_key_file: Option<PathBuf>,
        #[serde(default)]
        allow_http: bool,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_execution_time(), Duration::from_secs(1800));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(10));
        assert_eq!(config.local_acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.local_slots, 5);
        assert_eq!(config.build_slots, 1);
        assert!(!config.retain_failed);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
namespace: builds
retain_failed: true
resources:
  build:
    cpu_millis: 2000
    memory_bytes: 4294967296
store:
  type: s3
  endpoint: http://minio:9000
  bucket: ferry
  allow_http: true
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.namespace, "builds");
        assert!(config.retain_failed);
        assert_eq!(config.resources.build.cpu_millis, 2000);
        assert_eq!(config.resources.skopeo, ResourceLimits::skopeo_default());
        match config.store {
            StoreConfig::S3 {
                endpoint,
                bucket,
                region,
                allow_http,
                ..
            } => {
                assert_eq!(endpoint.as_deref(), Some("http://minio:9000"));
                assert_eq!(bucket, "ferry");
                assert_eq!(region, "us-east-1");
                assert!(allow_http);
            }
            other => panic!("unexpected store: {:?}", other),
        }
    }

    #[test]
    fn test_filesystem_store() {
        let config = ServerConfig::from_yaml("store:\n  type: filesystem\n  path: /var/lib/ferry\n")
            .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Filesystem {
                path: PathBuf::from("/var/lib/ferry")
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ServerConfig::from_yaml("local_slots: 0"),
            Err(FerryError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_yaml("store:\n  type: s3\n  bucket: \"\"\n"),
            Err(FerryError::Config(_))
        ));
        assert!(ServerConfig::from_yaml("local_slots: many").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen: 127.0.0.1:9999").unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/ferry.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}

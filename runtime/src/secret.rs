//! Credential secrets for cluster workloads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::{DockerConfig, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cluster::ClusterApi;
use crate::workload::MANAGED_BY_LABEL;

const SECRET_PREFIX: &str = "ferry-docker-config-";
const CONFIG_KEY: &str = "config.json";

/// A created credentials secret.
///
/// Not `Clone`: [`SecretManager::delete`] consumes it, so each secret is
/// deleted at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct CredentialSecret {
    name: String,
}

impl CredentialSecret {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates and deletes per-operation credentials secrets.
#[derive(Clone)]
pub struct SecretManager {
    cluster: Arc<dyn ClusterApi>,
    cleanup_timeout: Duration,
}

impl SecretManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, cleanup_timeout: Duration) -> Self {
        Self {
            cluster,
            cleanup_timeout,
        }
    }

    /// Store `credentials` as a `config.json` secret.
    pub async fn create(&self, credentials: &DockerConfig) -> Result<CredentialSecret> {
        let secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some(SECRET_PREFIX.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    "ferry".to_string(),
                )])),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                credentials.to_json(),
            )])),
            ..Default::default()
        };

        let name = self.cluster.create_secret(secret).await?;
        tracing::debug!(
            secret = %name,
            registries = credentials.auths.len(),
            "Created credentials secret"
        );
        Ok(CredentialSecret { name })
    }

    /// Delete the secret, bounded by the cleanup timeout. Failures are
    /// logged, never returned.
    pub async fn delete(&self, secret: CredentialSecret) {
        match tokio::time::timeout(self.cleanup_timeout, self.cluster.delete_secret(&secret.name))
            .await
        {
            Ok(Ok(())) => tracing::debug!(secret = %secret.name, "Deleted credentials secret"),
            Ok(Err(e)) => {
                tracing::warn!(secret = %secret.name, error = %e, "Failed to delete credentials secret")
            }
            Err(_) => tracing::warn!(secret = %secret.name, "Timed out deleting credentials secret"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use ferry_core::FerryError;

    fn manager(cluster: Arc<MemoryCluster>) -> SecretManager {
        SecretManager::new(cluster, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_create_stores_config_json() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut credentials = DockerConfig::default();
        credentials.insert_basic("ghcr.io", "user", "pass");

        let secret = manager(cluster.clone()).create(&credentials).await.unwrap();
        assert!(secret.name().starts_with("ferry-docker-config-"));

        let stored = cluster.secret(secret.name()).unwrap();
        let data = stored.string_data.unwrap();
        assert_eq!(data["config.json"], credentials.to_json());
    }

    #[tokio::test]
    async fn test_delete_removes_secret() {
        let cluster = Arc::new(MemoryCluster::new());
        let manager = manager(cluster.clone());
        let secret = manager.create(&DockerConfig::default()).await.unwrap();
        let name = secret.name().to_string();

        manager.delete(secret).await;
        assert_eq!(cluster.deleted_secrets(), vec![name.clone()]);
        assert!(cluster.secret(&name).is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed() {
        let cluster = Arc::new(MemoryCluster::new().failing_deletes());
        let manager = manager(cluster.clone());
        let secret = manager.create(&DockerConfig::default()).await.unwrap();
        manager.delete(secret).await;
        assert_eq!(cluster.deleted_secrets().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejected() {
        let cluster = Arc::new(MemoryCluster::new().rejecting_secrets("forbidden"));
        let err = manager(cluster).create(&DockerConfig::default()).await.unwrap_err();
        assert!(matches!(err, FerryError::Admission { ref resource, .. } if resource == "secret"));
    }
}

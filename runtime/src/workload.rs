//! Workload (pod) specifications.

use std::collections::BTreeMap;
use std::time::Duration;

use ferry_core::config::ImageConfig;
use ferry_core::{OperationKind, ResourceLimits};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::script::Script;

/// Mount point of the credentials secret; skopeo and buildkit read
/// `config.json` from here.
pub const DOCKER_CONFIG_DIR: &str = "/root/.docker";

/// Label carried by every ferry workload.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const CONFIG_VOLUME: &str = "docker-config";

/// Turns scripts into pod specs.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    images: ImageConfig,
    max_execution: Duration,
}

impl WorkloadBuilder {
    pub fn new(images: ImageConfig, max_execution: Duration) -> Self {
        Self {
            images,
            max_execution,
        }
    }

    fn image_for(&self, kind: OperationKind) -> (&'static str, &str) {
        match kind {
            OperationKind::Build => ("buildkit", &self.images.buildkit),
            _ => ("skopeo", &self.images.skopeo),
        }
    }

    /// Pod running `script` once, bounded by the maximum execution time.
    ///
    /// Requests equal limits, the pod is never restarted, and the optional
    /// credentials secret is mounted at [`DOCKER_CONFIG_DIR`].
    pub fn pod(
        &self,
        kind: OperationKind,
        script: &Script,
        limits: ResourceLimits,
        secret: Option<&str>,
    ) -> Pod {
        let (container_name, image) = self.image_for(kind);

        let mut env: Vec<EnvVar> = script
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();
        if let Some(secret) = secret {
            volumes.push(Volume {
                name: CONFIG_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: DOCKER_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
            env.push(EnvVar {
                name: "REGISTRY_AUTH_FILE".to_string(),
                value: Some(format!("{}/config.json", DOCKER_CONFIG_DIR)),
                ..Default::default()
            });
            env.push(EnvVar {
                name: "DOCKER_CONFIG".to_string(),
                value: Some(DOCKER_CONFIG_DIR.to_string()),
                ..Default::default()
            });
        }

        let resources: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), Quantity(limits.cpu_quantity())),
            ("memory".to_string(), Quantity(limits.memory_quantity())),
        ]
        .into_iter()
        .collect();

        let labels: BTreeMap<String, String> = [
            (MANAGED_BY_LABEL.to_string(), "ferry".to_string()),
            ("ferry.dev/operation".to_string(), kind.as_str().to_string()),
        ]
        .into_iter()
        .collect();

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(kind.name_prefix()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: container_name.to_string(),
                    image: Some(image.to_string()),
                    command: Some(vec![
                        "timeout".to_string(),
                        self.max_execution.as_secs().to_string(),
                    ]),
                    args: Some(vec!["sh".to_string(), "-c".to_string(), script.text.clone()]),
                    env: Some(env),
                    volume_mounts: Some(volume_mounts),
                    resources: Some(ResourceRequirements {
                        limits: Some(resources.clone()),
                        requests: Some(resources),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

//! Shell scripts for each operation.
//!
//! The same script runs on both execution paths, under `sh -c` locally or
//! as the container command of a workload.

use std::path::Path;

use ferry_core::image::InternalRegistry;
use ferry_core::{BuildOptions, FerryError, OperationKind, OperationRequest, Result};
use shell_words::quote;

const CONTEXT_DIR: &str = "/tmp/context";

/// A script plus the environment it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub text: String,
    pub env: Vec<(String, String)>,
}

impl Script {
    fn new(text: String) -> Self {
        Self {
            text,
            env: Vec::new(),
        }
    }

    /// Script for a validated request. Builds need the URL their context
    /// can be downloaded from.
    pub fn for_request(
        request: &OperationRequest,
        registry: &InternalRegistry,
        context_url: Option<&str>,
    ) -> Result<Self> {
        let require = |value: Option<&str>, what: &str| {
            value.map(str::to_string).ok_or_else(|| {
                FerryError::Other(format!("{} operation without {}", request.kind(), what))
            })
        };

        match request.kind() {
            OperationKind::Push | OperationKind::Pull => Ok(Self::copy(
                &require(request.source(), "source")?,
                &require(request.target(), "target")?,
            )),
            OperationKind::Tag => Ok(Self::copy_retrying(
                &require(request.source(), "source")?,
                &require(request.target(), "target")?,
            )),
            OperationKind::Inspect => Ok(Self::inspect(&require(request.source(), "source")?)),
            OperationKind::Build => {
                let options = request.build_options().ok_or_else(|| {
                    FerryError::Other("build operation without build options".to_string())
                })?;
                let url = require(context_url, "context URL")?;
                Ok(Self::build(options, registry, url))
            }
        }
    }

    fn copy_command(source: &str, target: &str) -> String {
        format!(
            "skopeo copy --retry-times 3 --src-tls-verify=false --dest-tls-verify=false {} {}",
            quote(&format!("docker://{}", source)),
            quote(&format!("docker://{}", target)),
        )
    }

    /// Copy an image between registries.
    pub fn copy(source: &str, target: &str) -> Self {
        Self::new(format!("set -eu\n{}\n", Self::copy_command(source, target)))
    }

    /// Copy an image, running the whole copy a second time if it fails.
    pub fn copy_retrying(source: &str, target: &str) -> Self {
        let command = Self::copy_command(source, target);
        Self::new(format!("{} || {}\n", command, command))
    }

    /// Print the image configuration as JSON.
    pub fn inspect(source: &str) -> Self {
        Self::new(format!(
            "set -eu\n\
             workdir=$(mktemp -d)\n\
             trap 'rm -rf \"$workdir\"' EXIT\n\
             skopeo copy --quiet --retry-times 3 --src-tls-verify=false {} \"dir://$workdir\"\n\
             skopeo inspect \"dir://$workdir\"\n",
            quote(&format!("docker://{}", source)),
        ))
    }

    /// Download the context from `$CONTEXT_URL`, build it with buildkit and
    /// push the result to every requested name.
    pub fn build(options: &BuildOptions, registry: &InternalRegistry, context_url: String) -> Self {
        let dockerfile = Path::new(&options.dockerfile);
        let dockerfile_dir = match dockerfile.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                format!("{}/{}", CONTEXT_DIR, parent.display())
            }
            _ => CONTEXT_DIR.to_string(),
        };
        let filename = dockerfile
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Dockerfile".to_string());

        let mut args: Vec<String> = vec![
            "build".into(),
            "--progress".into(),
            "plain".into(),
            "--frontend".into(),
            "dockerfile.v0".into(),
            "--local".into(),
            format!("context={}", CONTEXT_DIR),
            "--local".into(),
            format!("dockerfile={}", dockerfile_dir),
            "--opt".into(),
            format!("filename={}", filename),
        ];
        for (key, value) in &options.build_args {
            args.push("--opt".into());
            args.push(format!("build-arg:{}={}", key, value));
        }
        for (key, value) in &options.labels {
            args.push("--opt".into());
            args.push(format!("label:{}={}", key, value));
        }
        if let Some(target) = &options.target {
            args.push("--opt".into());
            args.push(format!("target={}", target));
        }
        if options.no_cache {
            args.push("--no-cache".into());
        }
        if let Some(cache) = &options.cache_from {
            args.push("--import-cache".into());
            args.push(format!("type=registry,ref={}", cache));
        }
        args.push("--output".into());
        args.push(output_spec(&build_names(registry, &options.tags)));

        let command = args.iter().map(|a| quote(a).into_owned()).collect::<Vec<_>>();
        let text = format!(
            "set -eu\n\
             mkdir -p {dir}\n\
             wget -q -O - \"$CONTEXT_URL\" | tar -x -C {dir}\n\
             exec buildctl-daemonless.sh {command}\n",
            dir = CONTEXT_DIR,
            command = command.join(" "),
        );

        Self {
            text,
            env: vec![
                ("CONTEXT_URL".to_string(), context_url),
                (
                    "BUILDKITD_FLAGS".to_string(),
                    "--oci-worker-no-process-sandbox".to_string(),
                ),
            ],
        }
    }
}

/// Names a build result is pushed to: the digest repository plus every tag.
pub fn build_names(registry: &InternalRegistry, tags: &[String]) -> Vec<String> {
    let mut names = vec![format!("{}:latest", registry.digests())];
    names.extend(tags.iter().map(|tag| registry.image(tag)));
    names
}

fn output_spec(names: &[String]) -> String {
    format!(
        "type=image,\"name={}\",push=true,registry.insecure=true",
        names.join(",")
    )
}

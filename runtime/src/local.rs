//! In-process execution of lightweight operations.

use std::process::Stdio;

use async_trait::async_trait;
use ferry_core::{DockerConfig, FerryError, Result};
use futures::StreamExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::output::OutputSink;
use crate::script::Script;

/// Runs a script on the server host.
#[async_trait]
pub trait LocalRunner: Send + Sync {
    /// Run `script` with `credentials` available as a registry auth file,
    /// relaying its combined output to `sink`.
    async fn run(
        &self,
        script: &Script,
        credentials: &DockerConfig,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// [`LocalRunner`] that spawns `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalRunner for ShellRunner {
    async fn run(
        &self,
        script: &Script,
        credentials: &DockerConfig,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Removed when dropped, whatever the outcome.
        let config_dir = tempfile::tempdir()?;
        let auth_file = config_dir.path().join("config.json");
        tokio::fs::write(&auth_file, credentials.to_json()).await?;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&script.text)
            .envs(script.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("REGISTRY_AUTH_FILE", &auth_file)
            .env("DOCKER_CONFIG", config_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FerryError::LocalExecution(format!("failed to spawn {}: {}", self.shell, e)))?;
        tracing::debug!(pid = ?child.id(), "Spawned local operation");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FerryError::LocalExecution("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FerryError::LocalExecution("stderr not captured".to_string()))?;
        let mut output = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(FerryError::Cancelled("local operation cancelled".to_string()));
                }
                chunk = output.next() => chunk,
            };
            match chunk {
                Some(Ok(data)) => {
                    if let Err(e) = sink.output(&data).await {
                        let _ = child.kill().await;
                        return Err(e);
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Error reading local operation output"),
                None => break,
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(FerryError::Cancelled("local operation cancelled".to_string()));
            }
            status = child.wait() => status?,
        };

        if status.success() {
            Ok(())
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(FerryError::LocalExecution(format!("exited with status {}", code)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CaptureSink;
    use std::time::Duration;

    fn script(text: &str) -> Script {
        Script {
            text: text.to_string(),
            env: vec![("GREETING".to_string(), "hello".to_string())],
        }
    }

    async fn run(text: &str, credentials: &DockerConfig) -> (Result<()>, String) {
        let sink = CaptureSink::raw();
        let result = ShellRunner::new()
            .run(&script(text), credentials, &sink, &CancellationToken::new())
            .await;
        (result, String::from_utf8(sink.into_bytes().to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_output_and_env() {
        let (result, out) = run("echo \"$GREETING\"; echo oops >&2", &DockerConfig::default()).await;
        result.unwrap();
        assert!(out.contains("hello\n"));
        assert!(out.contains("oops\n"));
    }

    #[tokio::test]
    async fn test_credentials_file() {
        let mut credentials = DockerConfig::default();
        credentials.insert_basic("ghcr.io", "u", "p");
        let (result, out) = run("cat \"$REGISTRY_AUTH_FILE\"", &credentials).await;
        result.unwrap();
        assert_eq!(out, credentials.to_json());
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let (result, _) = run("exit 3", &DockerConfig::default()).await;
        assert!(matches!(result, Err(FerryError::LocalExecution(ref m)) if m.contains('3')));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = ShellRunner::new()
            .run(&script("sleep 30"), &DockerConfig::default(), &CaptureSink::raw(), &cancel)
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

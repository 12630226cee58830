//! Local Docker runtime implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use stagehand_core::runtime::*;
use stagehand_core::{Error, LaunchError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mount point of the host workspace inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Read-only mount holding upstream artifacts as tarballs.
pub const INPUT_MOUNT: &str = "/stagehand/in";
/// Writable mount the job's artifact tarball is written to.
pub const OUTPUT_MOUNT: &str = "/stagehand/out";
const ARTIFACT_FILE: &str = "artifact.tar";

/// Runs jobs as containers on the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    /// Host directory bind-mounted at `/workspace`.
    workspace: Option<PathBuf>,
    /// Host directory for per-job input/output scratch space.
    scratch_root: PathBuf,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            workspace: None,
            scratch_root: std::env::temp_dir().join("stagehand"),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    /// Whether the daemon answers.
    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn container_name(request: &ExecutionRequest) -> String {
        format!(
            "stagehand-{}-{}",
            unique_name(&request.job),
            request.run_id.short()
        )
    }

    /// The shell script run inside the container: unpack inputs, run the
    /// job's command, pack outputs.
    fn build_script(request: &ExecutionRequest) -> String {
        let mut steps = Vec::new();

        if !request.inputs.is_empty() {
            steps.push(format!(
                "for f in {}/*.tar; do tar -xf \"$f\" -C {}; done",
                INPUT_MOUNT, WORKSPACE_MOUNT
            ));
        }
        if !request.command.trim().is_empty() {
            steps.push(format!("( {} )", request.command));
        }
        if !request.outputs.is_empty() {
            let paths: Vec<String> = request.outputs.iter().map(|p| shell_quote(p)).collect();
            steps.push(format!(
                "tar -cf {}/{} {}",
                OUTPUT_MOUNT,
                ARTIFACT_FILE,
                paths.join(" ")
            ));
        }

        if steps.is_empty() {
            "true".to_string()
        } else {
            steps.join(" && ")
        }
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // The image may still exist locally; creation decides.
                    warn!(image = %image, error = %e, "Pull warning");
                    break;
                }
            }
        }
    }

    /// Write upstream payloads into `<scratch>/in` and create `<scratch>/out`.
    async fn prepare_scratch(scratch: &Path, inputs: &[InputArtifact]) -> std::io::Result<()> {
        let input_dir = scratch.join("in");
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(scratch.join("out")).await?;

        for input in inputs {
            let path = input_dir.join(format!("{}.tar", unique_name(&input.producer)));
            tokio::fs::write(path, &input.payload).await?;
        }
        Ok(())
    }

    async fn collect_logs(&self, name: &str, sink: Option<&LogSink>) -> String {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            let (stream_kind, message) = match result {
                Ok(LogOutput::StdErr { message }) => (LogStream::Stderr, message),
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::Console { message })
                | Ok(LogOutput::StdIn { message }) => (LogStream::Stdout, message),
                Err(e) => {
                    warn!(container = %name, error = %e, "Log stream error");
                    break;
                }
            };

            let text = String::from_utf8_lossy(&message);
            output.push_str(&text);
            if let Some(sink) = sink {
                for line in text.lines() {
                    let _ = sink.send(LogLine::new(stream_kind, line));
                }
            }
        }

        output
    }

    async fn exit_code(&self, name: &str) -> i64 {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => return response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                return code;
            }
            Some(Err(e)) => warn!(container = %name, error = %e, "Wait error"),
            None => {}
        }

        // Fall back to the recorded state.
        self.docker
            .inspect_container(name, None)
            .await
            .ok()
            .and_then(|inspect| inspect.state)
            .and_then(|state| state.exit_code)
            .unwrap_or(-1)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        logs: Option<LogSink>,
    ) -> std::result::Result<ExecutionOutcome, LaunchError> {
        let name = Self::container_name(&request);
        let scratch = self.scratch_root.join(&name);
        let launch_err = |message: String| LaunchError::new(request.image.clone(), message);

        self.pull_image(&request.image).await;

        // From here on the guard removes the container and scratch space,
        // including when this future is dropped on timeout or cancellation.
        let mut guard = ContainerGuard::new(self.docker.clone(), name.clone(), scratch.clone());

        Self::prepare_scratch(&scratch, &request.inputs)
            .await
            .map_err(|e| launch_err(format!("failed to stage inputs: {}", e)))?;

        let mut binds = vec![
            format!("{}:{}:ro", scratch.join("in").display(), INPUT_MOUNT),
            format!("{}:{}:rw", scratch.join("out").display(), OUTPUT_MOUNT),
        ];
        if let Some(workspace) = &self.workspace {
            binds.push(format!("{}:{}:rw", workspace.display(), WORKSPACE_MOUNT));
        }

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(request.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                Self::build_script(&request),
            ]),
            env: Some(env),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(container = %name, image = %request.image, "Creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| launch_err(format!("failed to create container: {}", e)))?;

        info!(container = %name, "Starting container");
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| launch_err(format!("failed to start container: {}", e)))?;

        let output = self.collect_logs(&name, logs.as_ref()).await;
        let exit_code = self.exit_code(&name).await;
        debug!(container = %name, exit_code, "Container exited");

        let artifact = if exit_code == 0 && !request.outputs.is_empty() {
            match tokio::fs::read(scratch.join("out").join(ARTIFACT_FILE)).await {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) => {
                    warn!(container = %name, error = %e, "Declared artifact was not produced");
                    None
                }
            }
        } else {
            None
        };

        guard.release().await;

        Ok(ExecutionOutcome {
            exit_code,
            output,
            artifact,
        })
    }
}

/// Removes a job's container and scratch directory.
///
/// `release` does it inline; dropping an unreleased guard does it on a
/// background task.
struct ContainerGuard {
    docker: Docker,
    name: String,
    scratch: PathBuf,
    released: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String, scratch: PathBuf) -> Self {
        Self {
            docker,
            name,
            scratch,
            released: false,
        }
    }

    async fn release(&mut self) {
        self.released = true;
        cleanup(&self.docker, &self.name, &self.scratch).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        let scratch = std::mem::take(&mut self.scratch);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(container = %name, "Tearing down interrupted container");
                handle.spawn(async move { cleanup(&docker, &name, &scratch).await });
            }
            Err(_) => warn!(container = %name, "No runtime to tear down container"),
        }
    }
}

async fn cleanup(docker: &Docker, name: &str, scratch: &Path) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(name, Some(options)).await {
        debug!(container = %name, error = %e, "Container removal");
    }
    if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %scratch.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// A Docker-safe form of `name` that stays distinct for distinct names.
///
/// Disallowed characters are replaced, so a short digest of the raw name
/// is appended.
fn unique_name(name: &str) -> String {
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}-{}", sanitize(name), &digest[..8])
}

/// Map a job name onto the characters Docker allows in container names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Single-quote `s` for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use stagehand_core::RunId;
    use std::collections::BTreeMap;

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest {
            run_id: RunId::new(),
            job: "it".to_string(),
            image: "alpine:latest".to_string(),
            command: command.to_string(),
            env: BTreeMap::new(),
            inputs: vec![],
            outputs: vec![],
            timeout: None,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_successful_job() {
        let runtime = DockerRuntime::new().unwrap();
        assert!(runtime.ping().await);

        let mut req = request("echo \"hello $GREETING\"");
        req.env.insert("GREETING".to_string(), "docker".to_string());

        let outcome = runtime.execute(req, None).await.unwrap();
        assert!(outcome.success());
        assert!(outcome.output.contains("hello docker"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_job() {
        let runtime = DockerRuntime::new().unwrap();
        let outcome = runtime.execute(request("exit 42"), None).await.unwrap();
        assert_eq!(outcome.exit_code, 42);
        assert!(outcome.artifact.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_artifact_roundtrip() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = DockerRuntime::new()
            .unwrap()
            .with_scratch_root(scratch.path());

        let mut producer = request("mkdir -p out && echo built > out/bin");
        producer.outputs = vec!["out".to_string()];
        let outcome = runtime.execute(producer, None).await.unwrap();
        let payload = outcome.artifact.expect("artifact should be collected");

        let mut consumer = request("cat out/bin");
        consumer.inputs.push(InputArtifact {
            producer: "producer".to_string(),
            payload,
        });
        let outcome = runtime.execute(consumer, None).await.unwrap();
        assert!(outcome.success());
        assert!(outcome.output.contains("built"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_missing_image_is_launch_error() {
        let runtime = DockerRuntime::new().unwrap();
        let mut req = request("true");
        req.image = "stagehand.invalid/does-not-exist:never".to_string();

        let err = runtime.execute(req, None).await.unwrap_err();
        assert!(err.message.contains("failed to create container"));
    }
}

//! Container runtime trait and request/outcome types.
//!
//! Runtimes run one job in an isolated environment (a Docker container, a
//! remote sandbox, a test double) and report how it ended.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::RunId;
use crate::error::LaunchError;

/// An upstream artifact handed to a job.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    /// Job that produced the payload.
    pub producer: String,
    pub payload: Bytes,
}

/// Everything a runtime needs to run one job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Run the job belongs to.
    pub run_id: RunId,
    /// Job name.
    pub job: String,
    /// Container image to run.
    pub image: String,
    /// Shell command line.
    pub command: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Resolved upstream artifacts.
    pub inputs: Vec<InputArtifact>,
    /// Paths to collect as the job's artifact.
    pub outputs: Vec<String>,
    /// Timeout the caller will enforce. Runtimes may use it as a hint.
    pub timeout: Option<Duration>,
}

/// How a container run ended.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i64,
    /// Captured console output.
    pub output: String,
    /// Collected artifact payload, if the job declared outputs.
    pub artifact: Option<Bytes>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A line of console output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Where a runtime streams log lines while a job runs.
pub type LogSink = mpsc::UnboundedSender<LogLine>;

/// Trait for container runtimes.
///
/// `execute` may be dropped before it completes (timeout, cancellation);
/// implementations must then release whatever they started.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Name of this runtime.
    fn name(&self) -> &'static str;

    /// Run a job to completion.
    ///
    /// Returns an outcome for any container that started, whatever its exit
    /// code; `LaunchError` only when no container could be started.
    async fn execute(
        &self,
        request: ExecutionRequest,
        logs: Option<LogSink>,
    ) -> Result<ExecutionOutcome, LaunchError>;
}

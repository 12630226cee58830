//! Scripted container runtime for scheduler tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stagehand_core::runtime::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, LogLine, LogSink, LogStream,
};
use stagehand_core::LaunchError;
use std::collections::HashMap;
use std::time::Duration;

/// What the mock does when asked to run a job.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Exit 0 with `artifact-of-<job>` as payload when outputs are declared.
    Succeed,
    /// Exit with this code, still producing a payload.
    Exit(i64),
    /// Fail to start the container.
    LaunchFailure,
    /// Sleep, then succeed.
    Slow(Duration),
    /// Never finish.
    Hang,
}

/// Records every request and answers from a per-job script.
#[derive(Default)]
pub struct MockRuntime {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    calls: Mutex<Vec<ExecutionRequest>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, job: &str, behaviour: Behaviour) -> Self {
        self.behaviours.lock().insert(job.to_string(), behaviour);
        self
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn was_called(&self, job: &str) -> bool {
        self.calls.lock().iter().any(|r| r.job == job)
    }

    pub fn request_for(&self, job: &str) -> Option<ExecutionRequest> {
        self.calls.lock().iter().find(|r| r.job == job).cloned()
    }

    /// Producer names of the inputs handed to `job`, in order.
    pub fn inputs_for(&self, job: &str) -> Vec<String> {
        self.request_for(job)
            .map(|r| r.inputs.iter().map(|i| i.producer.clone()).collect())
            .unwrap_or_default()
    }
}

pub fn payload_for(job: &str) -> Bytes {
    Bytes::from(format!("artifact-of-{}", job))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        logs: Option<LogSink>,
    ) -> Result<ExecutionOutcome, LaunchError> {
        self.calls.lock().push(request.clone());
        let behaviour = self
            .behaviours
            .lock()
            .get(&request.job)
            .cloned()
            .unwrap_or(Behaviour::Succeed);

        if let Some(logs) = &logs {
            let _ = logs.send(LogLine::new(
                LogStream::Stdout,
                format!("running {}", request.job),
            ));
        }

        let exit_code = match behaviour {
            Behaviour::Succeed => 0,
            Behaviour::Exit(code) => code,
            Behaviour::LaunchFailure => {
                return Err(LaunchError::new(&request.image, "image not found"));
            }
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                0
            }
            Behaviour::Hang => std::future::pending::<i64>().await,
        };

        let artifact = (!request.outputs.is_empty()).then(|| payload_for(&request.job));
        Ok(ExecutionOutcome {
            exit_code,
            output: format!("running {}\n", request.job),
            artifact,
        })
    }
}

//! Running the jobs of one stage concurrently.

use stagehand_core::{ArtifactStore, FailureKind, JobResult, Stage, StageResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::RunContext;
use crate::job::JobExecutor;

/// Fans a stage out into one task per job and waits for all of them.
///
/// There is no fail-fast: a failing job does not stop its siblings.
#[derive(Clone)]
pub struct StageRunner {
    executor: JobExecutor,
}

impl StageRunner {
    pub fn new(executor: JobExecutor) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        stage: &Stage,
        index: usize,
        store: Arc<dyn ArtifactStore>,
        ctx: Arc<RunContext>,
    ) -> StageResult {
        let start = Instant::now();
        info!(stage = %stage.name, jobs = stage.jobs.len(), "Launching stage jobs");

        let mut handles: Vec<(String, JoinHandle<JobResult>)> = Vec::with_capacity(stage.jobs.len());
        for job in &stage.jobs {
            let executor = self.executor.clone();
            let job = job.clone();
            let stage_name = stage.name.clone();
            let store = store.clone();
            let ctx = ctx.clone();

            let name = job.name.clone();
            let handle = tokio::spawn(async move {
                executor
                    .run(&job, &stage_name, index, store.as_ref(), &ctx)
                    .await
            });
            handles.push((name, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(stage = %stage.name, job = %name, error = %e, "Job task panicked");
                    ctx.job_finished(&name);
                    let mut result = JobResult::pending(&name);
                    result.message = Some(e.to_string());
                    result.fail(FailureKind::Internal);
                    results.push(result);
                }
            }
        }

        let result = StageResult::from_jobs(&stage.name, results, start.elapsed());
        info!(
            stage = %stage.name,
            status = ?result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Stage finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, MockRuntime};
    use stagehand_config::VariableContext;
    use stagehand_core::{CancelSignal, Job, JobStatus, MemoryArtifactStore, StageStatus};
    use std::time::Duration;

    fn runner(runtime: Arc<MockRuntime>) -> StageRunner {
        StageRunner::new(JobExecutor::new(runtime))
    }

    fn context() -> Arc<RunContext> {
        Arc::new(RunContext::new(
            "demo",
            VariableContext::new(),
            None,
            CancelSignal::new(),
            None,
        ))
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        let delay = Duration::from_millis(150);
        let runtime = Arc::new(
            MockRuntime::new()
                .with("a", Behaviour::Slow(delay))
                .with("b", Behaviour::Slow(delay))
                .with("c", Behaviour::Slow(delay)),
        );
        let stage = Stage::new(
            "build",
            vec![
                Job::new("a", "alpine"),
                Job::new("b", "alpine"),
                Job::new("c", "alpine"),
            ],
        );

        let result = runner(runtime)
            .run(&stage, 0, Arc::new(MemoryArtifactStore::new()), context())
            .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.jobs.len(), 3);
        assert!(result.duration >= delay);
        assert!(result.duration < delay * 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with("bad", Behaviour::Exit(1))
                .with("slow", Behaviour::Slow(Duration::from_millis(50))),
        );
        let stage = Stage::new(
            "test",
            vec![Job::new("bad", "alpine"), Job::new("slow", "alpine")],
        );

        let result = runner(runtime.clone())
            .run(&stage, 1, Arc::new(MemoryArtifactStore::new()), context())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.jobs["slow"].status, JobStatus::Succeeded);
        assert!(runtime.was_called("slow"));
        let failed: Vec<&str> = result.failed_jobs().map(|j| j.job.as_str()).collect();
        assert_eq!(failed, vec!["bad"]);
    }

    #[tokio::test]
    async fn test_every_job_reaches_terminal_state() {
        let runtime = Arc::new(MockRuntime::new().with("b", Behaviour::LaunchFailure));
        let stage = Stage::new(
            "build",
            vec![Job::new("a", "alpine"), Job::new("b", "alpine")],
        );
        let ctx = context();

        let result = runner(runtime)
            .run(&stage, 0, Arc::new(MemoryArtifactStore::new()), ctx.clone())
            .await;

        assert!(result.jobs.values().all(|j| j.status.is_terminal()));
        assert!(ctx.live_jobs().is_empty());
    }
}

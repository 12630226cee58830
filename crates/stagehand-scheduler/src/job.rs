//! Running a single job.

use stagehand_core::runtime::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, InputArtifact, LogLine,
};
use stagehand_core::{ArtifactError, ArtifactStore, FailureKind, Job, JobResult, LaunchError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::event::PipelineEvent;

/// How the runtime call ended.
enum Ending {
    Finished(Result<ExecutionOutcome, LaunchError>),
    TimedOut(Duration),
    Cancelled,
}

/// Runs one job: resolves its inputs, launches its container, stores its
/// artifact.
///
/// Never returns an error. Every failure ends up in the [`JobResult`].
#[derive(Clone)]
pub struct JobExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl JobExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run(
        &self,
        job: &Job,
        stage: &str,
        stage_index: usize,
        store: &dyn ArtifactStore,
        ctx: &RunContext,
    ) -> JobResult {
        let mut result = JobResult::pending(&job.name);

        if ctx.cancel_signal().is_cancelled() {
            debug!(job = %job.name, "Run cancelled before job start");
            result.fail(FailureKind::Cancelled);
            return finish(ctx, stage, result).await;
        }

        let mut inputs = Vec::with_capacity(job.needs.len());
        for upstream in &job.needs {
            match store.get(upstream).await {
                Ok(payload) => inputs.push(InputArtifact {
                    producer: upstream.clone(),
                    payload,
                }),
                Err(e) => {
                    warn!(job = %job.name, upstream = %upstream, error = %e, "Upstream artifact missing");
                    result.message = Some(e.to_string());
                    result.fail(FailureKind::ArtifactMissing {
                        upstream: upstream.clone(),
                    });
                    return finish(ctx, stage, result).await;
                }
            }
        }

        let vars = ctx.variables_for(stage, stage_index, &job.name);
        let timeout = ctx.timeout_for(job);
        let request = ExecutionRequest {
            run_id: ctx.run_id(),
            job: job.name.clone(),
            image: vars.interpolate(&job.image),
            command: vars.interpolate(&job.command()),
            env: vars.interpolate_map(&job.env),
            inputs,
            outputs: vars.interpolate_vec(&job.artifacts),
            timeout,
        };

        info!(
            job = %job.name,
            stage = %stage,
            image = %request.image,
            runtime = self.runtime.name(),
            "Starting job"
        );
        result.start();
        ctx.job_started(&job.name);
        ctx.emit(PipelineEvent::JobStarted {
            stage: stage.to_string(),
            job: job.name.clone(),
        })
        .await;

        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogLine>();
        let mut captured = String::new();
        let mut execution = self.runtime.execute(request, Some(log_tx));

        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let cancelled = ctx.cancel_signal().cancelled();
        tokio::pin!(cancelled);

        let ending = loop {
            tokio::select! {
                outcome = &mut execution => break Ending::Finished(outcome),
                Some(line) = log_rx.recv() => {
                    capture(&mut captured, &line);
                    ctx.try_emit(PipelineEvent::JobLog { job: job.name.clone(), line });
                }
                _ = &mut deadline => break Ending::TimedOut(timeout.unwrap_or_default()),
                _ = &mut cancelled => break Ending::Cancelled,
            }
        };
        // Dropping the runtime future tears the container down.
        drop(execution);

        while let Ok(line) = log_rx.try_recv() {
            capture(&mut captured, &line);
            ctx.emit(PipelineEvent::JobLog {
                job: job.name.clone(),
                line,
            })
            .await;
        }

        match ending {
            Ending::Finished(Ok(outcome)) => {
                result.output = if outcome.output.is_empty() {
                    captured
                } else {
                    outcome.output
                };

                if outcome.exit_code != 0 {
                    warn!(job = %job.name, exit_code = outcome.exit_code, "Job failed");
                    result.fail(FailureKind::NonZeroExit {
                        code: outcome.exit_code,
                    });
                } else {
                    match outcome.artifact {
                        Some(payload) => match store.put(&job.name, payload).await {
                            Ok(artifact) => {
                                debug!(job = %job.name, size = artifact.size, "Stored artifact");
                                result.artifact = Some(artifact);
                                result.succeed();
                            }
                            Err(e) => {
                                error!(job = %job.name, error = %e, "Failed to store artifact");
                                result.message = Some(e.to_string());
                                result.fail(match e {
                                    ArtifactError::Duplicate(_) => FailureKind::DuplicateArtifact,
                                    _ => FailureKind::ArtifactStorage,
                                });
                            }
                        },
                        None => {
                            if !job.artifacts.is_empty() {
                                warn!(job = %job.name, "Job declared artifacts but produced none");
                            }
                            result.succeed();
                        }
                    }
                }
            }
            Ending::Finished(Err(e)) => {
                error!(job = %job.name, error = %e, "Job failed to launch");
                result.output = captured;
                result.message = Some(e.to_string());
                result.fail(FailureKind::Launch);
            }
            Ending::TimedOut(after) => {
                warn!(job = %job.name, timeout = ?after, "Job timed out");
                result.output = captured;
                result.fail(FailureKind::Timeout { after });
            }
            Ending::Cancelled => {
                info!(job = %job.name, "Job cancelled");
                result.output = captured;
                result.fail(FailureKind::Cancelled);
            }
        }

        finish(ctx, stage, result).await
    }
}

/// Every path out of [`JobExecutor::run`] ends here.
async fn finish(ctx: &RunContext, stage: &str, result: JobResult) -> JobResult {
    ctx.job_finished(&result.job);
    info!(
        job = %result.job,
        success = result.is_success(),
        duration_ms = result.duration().map(|d| d.as_millis() as u64),
        "Job finished"
    );
    ctx.emit(PipelineEvent::JobFinished {
        stage: stage.to_string(),
        result: result.clone(),
    })
    .await;
    result
}

fn capture(output: &mut String, line: &LogLine) {
    output.push_str(&line.content);
    if !line.content.ends_with('\n') {
        output.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, MockRuntime, payload_for};
    use stagehand_config::{VariableContext, VariableContextBuilder};
    use stagehand_core::{CancelSignal, JobStatus, MemoryArtifactStore};

    fn context() -> RunContext {
        RunContext::new(
            "demo",
            VariableContextBuilder::new()
                .with_custom("TAG", "1.80")
                .build(),
            None,
            CancelSignal::new(),
            None,
        )
    }

    async fn run_job(runtime: Arc<MockRuntime>, job: &Job, store: &MemoryArtifactStore) -> JobResult {
        let ctx = context();
        JobExecutor::new(runtime).run(job, "build", 0, store, &ctx).await
    }

    #[tokio::test]
    async fn test_success_stores_artifact() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        let job = Job::new("compile", "rust:${TAG}")
            .with_script("cargo build")
            .with_artifact("target/app");

        let result = run_job(runtime.clone(), &job, &store).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert!(result.output.contains("running compile"));
        assert_eq!(result.artifact.as_ref().unwrap().producer, "compile");
        assert_eq!(store.get("compile").await.unwrap(), payload_for("compile"));

        let request = runtime.request_for("compile").unwrap();
        assert_eq!(request.image, "rust:1.80");
        assert_eq!(request.command, "cargo build");
        assert_eq!(request.outputs, vec!["target/app"]);
    }

    #[tokio::test]
    async fn test_job_without_artifacts_stores_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        let job = Job::new("lint", "alpine");

        let result = run_job(runtime, &job, &store).await;

        assert!(result.is_success());
        assert!(result.artifact.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_launch() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        let job = Job::new("test", "alpine").with_needs(vec!["compile"]);

        let result = run_job(runtime.clone(), &job, &store).await;

        assert_eq!(
            result.status.failure(),
            Some(&FailureKind::ArtifactMissing {
                upstream: "compile".to_string()
            })
        );
        assert!(result.started_at.is_none());
        assert_eq!(runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn test_inputs_are_passed_in_order() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        store.put("b", payload_for("b")).await.unwrap();
        store.put("a", payload_for("a")).await.unwrap();
        let job = Job::new("c", "alpine").with_needs(vec!["b", "a"]);

        let result = run_job(runtime.clone(), &job, &store).await;

        assert!(result.is_success());
        assert_eq!(runtime.inputs_for("c"), vec!["b", "a"]);
        assert_eq!(runtime.request_for("c").unwrap().inputs[0].payload, payload_for("b"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_discards_artifact() {
        let runtime = Arc::new(MockRuntime::new().with("compile", Behaviour::Exit(2)));
        let store = MemoryArtifactStore::new();
        let job = Job::new("compile", "alpine").with_artifact("out");

        let result = run_job(runtime, &job, &store).await;

        assert_eq!(
            result.status.failure(),
            Some(&FailureKind::NonZeroExit { code: 2 })
        );
        assert!(result.artifact.is_none());
        assert!(!store.contains("compile").await);
        assert!(!result.output.is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let runtime = Arc::new(MockRuntime::new().with("compile", Behaviour::LaunchFailure));
        let store = MemoryArtifactStore::new();
        let job = Job::new("compile", "missing:latest");

        let result = run_job(runtime, &job, &store).await;

        assert_eq!(result.status.failure(), Some(&FailureKind::Launch));
        assert!(result.message.unwrap().contains("image not found"));
    }

    #[tokio::test]
    async fn test_duplicate_artifact_fails_job() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        store.put("compile", payload_for("stale")).await.unwrap();
        let job = Job::new("compile", "alpine").with_artifact("out");

        let result = run_job(runtime, &job, &store).await;

        assert_eq!(result.status.failure(), Some(&FailureKind::DuplicateArtifact));
        assert_eq!(store.get("compile").await.unwrap(), payload_for("stale"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let runtime = Arc::new(MockRuntime::new().with("slow", Behaviour::Hang));
        let store = MemoryArtifactStore::new();
        let job = Job::new("slow", "alpine").with_timeout(Duration::from_millis(50));

        let result = run_job(runtime, &job, &store).await;

        assert_eq!(
            result.status.failure(),
            Some(&FailureKind::Timeout {
                after: Duration::from_millis(50)
            })
        );
        assert!(result.output.contains("running slow"));
    }

    #[tokio::test]
    async fn test_cancellation_during_run() {
        let runtime = Arc::new(MockRuntime::new().with("slow", Behaviour::Hang));
        let store = MemoryArtifactStore::new();
        let ctx = context();
        let job = Job::new("slow", "alpine");

        let signal = ctx.cancel_signal().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.cancel();
        });

        let result = JobExecutor::new(runtime)
            .run(&job, "build", 0, &store, &ctx)
            .await;

        assert_eq!(result.status.failure(), Some(&FailureKind::Cancelled));
        assert!(ctx.live_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_launches() {
        let runtime = Arc::new(MockRuntime::new());
        let store = MemoryArtifactStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = RunContext::new("demo", VariableContext::new(), None, CancelSignal::new(), Some(tx));
        ctx.cancel_signal().cancel();

        let result = JobExecutor::new(runtime.clone())
            .run(&Job::new("a", "alpine"), "build", 0, &store, &ctx)
            .await;

        assert_eq!(result.status.failure(), Some(&FailureKind::Cancelled));
        assert_eq!(runtime.call_count(), 0);
        match rx.try_recv() {
            Ok(PipelineEvent::JobFinished { result, .. }) => assert_eq!(result.job, "a"),
            other => panic!("expected JobFinished, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_reporter_does_not_delay_timeout() {
        let runtime = Arc::new(MockRuntime::new().with("slow", Behaviour::Hang));
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = Arc::new(RunContext::new(
            "demo",
            VariableContext::new(),
            Some(Duration::from_millis(50)),
            CancelSignal::new(),
            Some(tx),
        ));
        let job = Job::new("slow", "alpine");

        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let store = MemoryArtifactStore::new();
                JobExecutor::new(runtime)
                    .run(&job, "build", 0, &store, &ctx)
                    .await
            })
        };

        // Leave the reporter stalled well past the timeout.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while rx.try_recv().is_ok() {}
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let result = handle.await.unwrap();
        drop(ctx);
        drain.await.unwrap();

        assert!(matches!(
            result.status.failure(),
            Some(FailureKind::Timeout { .. })
        ));
        assert!(result.duration().unwrap() < Duration::from_millis(250));
    }
}

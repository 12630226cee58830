//! Pipeline scheduler - runs stages in declared order.

use chrono::Utc;
use stagehand_config::VariableContext;
use stagehand_core::runtime::ContainerRuntime;
use stagehand_core::{
    ArtifactStore, CancelSignal, MemoryArtifactStore, PipelineResult, PipelineSpec,
    PipelineStatus, StageResult, ValidationError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::{RunContext, RunState};
use crate::event::PipelineEvent;
use crate::job::JobExecutor;
use crate::stage::StageRunner;

/// Capacity of the event channel returned by [`PipelineScheduler::execute`].
const EVENT_BUFFER: usize = 256;

/// Drives a pipeline run from the first stage to a terminal status.
///
/// A scheduler can be reused for several runs; each run gets a fresh
/// [`RunContext`]. The artifact store is cleared when a run ends, and a
/// cancel signal that fired during the run is re-armed.
#[derive(Clone)]
pub struct PipelineScheduler {
    stages: StageRunner,
    store: Arc<dyn ArtifactStore>,
    variables: VariableContext,
    default_timeout: Option<Duration>,
    cancel: CancelSignal,
}

impl PipelineScheduler {
    /// Scheduler with an in-memory artifact store and no default timeout.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            stages: StageRunner::new(JobExecutor::new(runtime)),
            store: Arc::new(MemoryArtifactStore::new()),
            variables: VariableContext::default(),
            default_timeout: None,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Variables available to `${...}` in job images, scripts and env.
    pub fn with_variables(mut self, variables: VariableContext) -> Self {
        self.variables = variables;
        self
    }

    /// Timeout for jobs that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Signal that cancels the current run when triggered. Firing it
    /// between runs cancels the next run.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Run a pipeline to completion.
    ///
    /// Returns an error only when the pipeline is invalid, in which case no
    /// job was started. Job and stage failures are reported in the result.
    pub async fn run(&self, spec: &PipelineSpec) -> Result<PipelineResult, ValidationError> {
        self.run_with_events(spec, None).await
    }

    /// Run a pipeline in the background, returning a channel of events and a
    /// handle to the final result.
    ///
    /// The receiver must be drained, or the run stalls once the buffer fills.
    pub fn execute(
        &self,
        spec: &PipelineSpec,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<Result<PipelineResult, ValidationError>>,
    ) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let scheduler = self.clone();
        let spec = spec.clone();

        let handle =
            tokio::spawn(async move { scheduler.run_with_events(&spec, Some(tx)).await });

        (rx, handle)
    }

    async fn run_with_events(
        &self,
        spec: &PipelineSpec,
        events: Option<mpsc::Sender<PipelineEvent>>,
    ) -> Result<PipelineResult, ValidationError> {
        spec.validate()?;

        let ctx = Arc::new(RunContext::new(
            &spec.name,
            self.run_variables(spec),
            self.default_timeout,
            self.cancel.clone(),
            events,
        ));

        info!(
            run_id = %ctx.run_id(),
            pipeline = %spec.name,
            stages = spec.stages.len(),
            jobs = spec.job_count(),
            "Starting pipeline"
        );
        ctx.emit(PipelineEvent::PipelineStarted {
            run_id: ctx.run_id(),
            pipeline: spec.name.clone(),
            stages: spec.stages.len(),
            jobs: spec.job_count(),
        })
        .await;

        let started_at = Utc::now();
        let start = Instant::now();
        let mut stages = Vec::with_capacity(spec.stages.len());
        let mut halted: Option<String> = None;

        for (index, stage) in spec.stages.iter().enumerate() {
            if halted.is_some() {
                info!(stage = %stage.name, "Skipping stage");
                stages.push(StageResult::skipped(stage));
                ctx.emit(PipelineEvent::StageSkipped {
                    stage: stage.name.clone(),
                })
                .await;
                continue;
            }

            ctx.transition(RunState::RunningStage(index));
            info!(stage = %stage.name, index, "Starting stage");
            ctx.emit(PipelineEvent::StageStarted {
                stage: stage.name.clone(),
                index,
            })
            .await;

            let result = self
                .stages
                .run(stage, index, self.store.clone(), ctx.clone())
                .await;

            if !result.is_success() {
                warn!(stage = %stage.name, "Stage failed, halting pipeline");
                ctx.transition(RunState::Halted { stage: index });
                halted = Some(stage.name.clone());
            }

            ctx.emit(PipelineEvent::StageFinished {
                result: result.clone(),
            })
            .await;
            stages.push(result);
        }

        let duration = start.elapsed();
        let status = match halted {
            Some(stage) => PipelineStatus::Halted { stage },
            None => {
                ctx.transition(RunState::Completed);
                PipelineStatus::Completed
            }
        };

        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear artifact store");
        }
        if self.cancel.is_cancelled() {
            info!(run_id = %ctx.run_id(), "Run was cancelled, re-arming cancel signal");
            self.cancel.reset();
        }

        info!(
            run_id = %ctx.run_id(),
            status = ?status,
            duration_ms = duration.as_millis() as u64,
            "Pipeline finished"
        );
        ctx.emit(PipelineEvent::PipelineFinished {
            status: status.clone(),
            duration,
        })
        .await;

        Ok(PipelineResult {
            run_id: ctx.run_id(),
            pipeline: spec.name.clone(),
            status,
            stages,
            duration,
            job_count: spec.job_count(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Scheduler variables with the pipeline's own variables layered on top.
    fn run_variables(&self, spec: &PipelineSpec) -> VariableContext {
        let mut variables = self.variables.clone();
        for (name, value) in &spec.variables {
            variables.set(name, value.clone());
        }
        variables
    }
}

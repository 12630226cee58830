//! Per-run execution state.

use parking_lot::Mutex;
use stagehand_config::VariableContext;
use stagehand_core::{CancelSignal, Job, RunId};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::PipelineEvent;

/// Where the scheduler is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    RunningStage(usize),
    Completed,
    Halted { stage: usize },
}

/// State shared by everything working on one run.
///
/// Created when a run starts and dropped when it ends.
#[derive(Debug)]
pub struct RunContext {
    run_id: RunId,
    pipeline: String,
    variables: VariableContext,
    default_timeout: Option<Duration>,
    cancel: CancelSignal,
    events: Option<mpsc::Sender<PipelineEvent>>,
    state: Mutex<RunState>,
    live_jobs: Mutex<BTreeSet<String>>,
}

impl RunContext {
    pub fn new(
        pipeline: impl Into<String>,
        variables: VariableContext,
        default_timeout: Option<Duration>,
        cancel: CancelSignal,
        events: Option<mpsc::Sender<PipelineEvent>>,
    ) -> Self {
        let run_id = RunId::new();
        let pipeline = pipeline.into();
        let mut variables = variables;
        variables.pipeline_name = pipeline.clone();
        variables.run_id = run_id.to_string();

        Self {
            run_id,
            pipeline,
            variables,
            default_timeout,
            cancel,
            events,
            state: Mutex::new(RunState::Idle),
            live_jobs: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Send an event to the reporter, if one is listening.
    pub async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Send an event without waiting. Dropped when the reporter lags.
    pub fn try_emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn transition(&self, next: RunState) {
        let mut state = self.state.lock();
        debug!(run_id = %self.run_id, from = ?*state, to = ?next, "Run state change");
        *state = next;
    }

    pub fn job_started(&self, job: &str) {
        self.live_jobs.lock().insert(job.to_string());
    }

    pub fn job_finished(&self, job: &str) {
        self.live_jobs.lock().remove(job);
    }

    /// Jobs currently between start and finish.
    pub fn live_jobs(&self) -> Vec<String> {
        self.live_jobs.lock().iter().cloned().collect()
    }

    /// The job's own timeout, else the runner default.
    pub fn timeout_for(&self, job: &Job) -> Option<Duration> {
        job.timeout.or(self.default_timeout)
    }

    /// Interpolation context for one job.
    pub fn variables_for(&self, stage: &str, stage_index: usize, job: &str) -> VariableContext {
        self.variables.for_job(stage, stage_index, job)
    }
}

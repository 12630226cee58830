//! Structured events emitted while a pipeline runs.

use serde::Serialize;
use stagehand_core::runtime::LogLine;
use stagehand_core::{JobResult, PipelineStatus, RunId, StageResult};
use std::time::Duration;

/// Progress of a run, for reporters. Formatting is the reporter's business.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: RunId,
        pipeline: String,
        stages: usize,
        jobs: usize,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    JobStarted {
        stage: String,
        job: String,
    },
    JobLog {
        job: String,
        line: LogLine,
    },
    JobFinished {
        stage: String,
        result: JobResult,
    },
    StageFinished {
        result: StageResult,
    },
    StageSkipped {
        stage: String,
    },
    PipelineFinished {
        status: PipelineStatus,
        duration: Duration,
    },
}

//! Results of a pipeline run.
//!
//! Created fresh for every run and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::RunId;
use crate::artifact::ArtifactRef;
use crate::pipeline::Stage;

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// An upstream artifact was not in the store. No container was started.
    ArtifactMissing { upstream: String },
    /// The job's artifact could not be stored because one already exists.
    DuplicateArtifact,
    /// The artifact store failed while storing the job's artifact.
    ArtifactStorage,
    /// The runtime could not start the container.
    Launch,
    /// The container exited with a non-zero code.
    NonZeroExit { code: i64 },
    /// The job ran longer than its timeout.
    Timeout { after: Duration },
    /// The run was cancelled while the job was pending or running.
    Cancelled,
    /// The task running the job panicked.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ArtifactMissing { upstream } => {
                write!(f, "artifact from '{}' is missing", upstream)
            }
            FailureKind::DuplicateArtifact => write!(f, "artifact already stored"),
            FailureKind::ArtifactStorage => write!(f, "artifact could not be stored"),
            FailureKind::Launch => write!(f, "container failed to launch"),
            FailureKind::NonZeroExit { code } => write!(f, "exit code {}", code),
            FailureKind::Timeout { after } => write!(f, "timed out after {:?}", after),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: FailureKind },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    pub fn failure(&self) -> Option<&FailureKind> {
        match self {
            JobStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Outcome of a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Console output captured from the container.
    pub output: String,
    /// Artifact stored by the job, if it succeeded and produced one.
    pub artifact: Option<ArtifactRef>,
    /// Extra detail for failures (launch error text, store error, ...).
    pub message: Option<String>,
}

impl JobResult {
    pub fn pending(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            output: String::new(),
            artifact: None,
            message: None,
        }
    }

    /// Transition to `Running`, stamping the start time.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: FailureKind) {
        self.status = JobStatus::Failed { reason };
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Wall-clock run time, if the job started and finished.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Never started because an earlier stage failed.
    Skipped,
}

/// Outcome of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub jobs: BTreeMap<String, JobResult>,
    pub duration: Duration,
}

impl StageResult {
    /// Aggregate finished jobs: `Succeeded` iff every job succeeded.
    pub fn from_jobs(
        stage: impl Into<String>,
        jobs: impl IntoIterator<Item = JobResult>,
        duration: Duration,
    ) -> Self {
        let jobs: BTreeMap<String, JobResult> =
            jobs.into_iter().map(|j| (j.job.clone(), j)).collect();
        let status = if jobs.values().all(JobResult::is_success) {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        };
        Self {
            stage: stage.into(),
            status,
            jobs,
            duration,
        }
    }

    /// A stage that was never started. Its jobs stay `Pending`.
    pub fn skipped(stage: &Stage) -> Self {
        Self {
            stage: stage.name.clone(),
            status: StageStatus::Skipped,
            jobs: stage
                .jobs
                .iter()
                .map(|j| (j.name.clone(), JobResult::pending(&j.name)))
                .collect(),
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Failed { .. }))
    }
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every stage succeeded.
    Completed,
    /// `stage` failed; everything after it was skipped.
    Halted { stage: String },
}

/// Outcome of a whole run. The single source of truth for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    /// From the first stage start to the last stage or skip decision.
    pub duration: Duration,
    /// Jobs across all stages, executed or skipped.
    pub job_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Process exit code for a CLI wrapper: 0 iff completed.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.stages.iter().find_map(|s| s.jobs.get(name))
    }

    pub fn failed_jobs(&self) -> Vec<&JobResult> {
        self.stages.iter().flat_map(|s| s.failed_jobs()).collect()
    }

    /// Jobs that actually reached a terminal state.
    pub fn executed_jobs(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|s| s.jobs.values())
            .filter(|j| j.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Job;

    fn finished(job: &str, reason: Option<FailureKind>) -> JobResult {
        let mut result = JobResult::pending(job);
        result.start();
        match reason {
            Some(reason) => result.fail(reason),
            None => result.succeed(),
        }
        result
    }

    #[test]
    fn test_job_lifecycle() {
        let mut result = JobResult::pending("build");
        assert_eq!(result.status, JobStatus::Pending);
        assert!(!result.status.is_terminal());
        assert!(result.duration().is_none());

        result.start();
        assert_eq!(result.status, JobStatus::Running);
        assert!(result.started_at.is_some());

        result.fail(FailureKind::NonZeroExit { code: 2 });
        assert!(result.status.is_terminal());
        assert_eq!(
            result.status.failure(),
            Some(&FailureKind::NonZeroExit { code: 2 })
        );
        assert!(result.duration().is_some());
    }

    #[test]
    fn test_stage_aggregation() {
        let ok = StageResult::from_jobs(
            "build",
            vec![finished("a", None), finished("b", None)],
            Duration::from_secs(1),
        );
        assert_eq!(ok.status, StageStatus::Succeeded);

        let failed = StageResult::from_jobs(
            "build",
            vec![finished("a", None), finished("b", Some(FailureKind::Launch))],
            Duration::from_secs(1),
        );
        assert_eq!(failed.status, StageStatus::Failed);
        let names: Vec<&str> = failed.failed_jobs().map(|j| j.job.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_skipped_stage_keeps_jobs_pending() {
        let stage = Stage::new("deploy", vec![Job::new("ship", "alpine")]);
        let skipped = StageResult::skipped(&stage);
        assert_eq!(skipped.status, StageStatus::Skipped);
        assert_eq!(skipped.jobs["ship"].status, JobStatus::Pending);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(
            FailureKind::ArtifactMissing {
                upstream: "build".to_string()
            }
            .to_string(),
            "artifact from 'build' is missing"
        );
        assert_eq!(FailureKind::NonZeroExit { code: 3 }.to_string(), "exit code 3");
    }

    #[test]
    fn test_status_serialization() {
        let status = JobStatus::Failed {
            reason: FailureKind::Cancelled,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["failed"]["reason"]["kind"], "cancelled");
    }
}

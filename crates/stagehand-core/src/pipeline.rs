//! Pipeline, stage, and job definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::error::{ValidationError, ValidationIssue};

/// A pipeline definition. Read-only once loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name (e.g., "my-service").
    pub name: String,
    /// Stages, in execution order.
    pub stages: Vec<Stage>,
    /// Pipeline-wide variables available for `${NAME}` interpolation.
    pub variables: BTreeMap<String, String>,
}

/// An ordered phase of the pipeline. Its jobs are independent of each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub jobs: Vec<Job>,
}

/// A single unit of work run inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique across the whole pipeline.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Jobs from earlier stages whose artifacts this job consumes.
    pub needs: Vec<String>,
    /// Shell commands, run in order.
    pub script: Vec<String>,
    /// Paths the job publishes as its artifact.
    pub artifacts: Vec<String>,
    /// Per-job timeout; falls back to the runner default.
    pub timeout: Option<Duration>,
    /// Branches this job runs on. Empty means every branch.
    pub only: Vec<String>,
    /// Job-specific environment variables.
    pub env: BTreeMap<String, String>,
}

impl Job {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            needs: Vec::new(),
            script: Vec::new(),
            artifacts: Vec::new(),
            timeout: None,
            only: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(needs.into_iter().map(Into::into));
        self
    }

    pub fn with_script(mut self, command: impl Into<String>) -> Self {
        self.script.push(command.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_only(mut self, branch: impl Into<String>) -> Self {
        self.only.push(branch.into());
        self
    }

    /// The script as a single shell command line.
    pub fn command(&self) -> String {
        self.script.join(" && ")
    }

    /// Whether this job runs on `branch`.
    pub fn runs_on(&self, branch: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|b| b == branch)
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            name: name.into(),
            jobs,
        }
    }
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
            variables: BTreeMap::new(),
        }
    }

    /// Total number of jobs across all stages.
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.stages
            .iter()
            .flat_map(|s| s.jobs.iter())
            .find(|j| j.name == name)
    }

    /// Check the structural invariants of the pipeline.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate(self)
    }

    /// Keep only the jobs that run on `branch`, dropping stages left empty.
    ///
    /// The result is validated again: a kept job that needs a dropped job is
    /// reported as an unknown dependency.
    pub fn for_branch(&self, branch: &str) -> Result<PipelineSpec, ValidationError> {
        let stages: Vec<Stage> = self
            .stages
            .iter()
            .filter_map(|stage| {
                let jobs: Vec<Job> = stage
                    .jobs
                    .iter()
                    .filter(|j| j.runs_on(branch))
                    .cloned()
                    .collect();
                (!jobs.is_empty()).then(|| Stage::new(stage.name.clone(), jobs))
            })
            .collect();

        let filtered = PipelineSpec {
            name: self.name.clone(),
            stages,
            variables: self.variables.clone(),
        };
        filtered.validate()?;
        Ok(filtered)
    }
}

/// Validate a pipeline. Collects every issue instead of stopping at the first.
pub fn validate(spec: &PipelineSpec) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if spec.stages.is_empty() {
        issues.push(ValidationIssue::NoStages);
    }

    // Stage index of every job, for telling "same stage" from "later stage".
    let mut job_stage: HashMap<&str, usize> = HashMap::new();
    for (idx, stage) in spec.stages.iter().enumerate() {
        for job in &stage.jobs {
            job_stage.entry(job.name.as_str()).or_insert(idx);
        }
    }

    let mut stage_names = HashSet::new();
    let mut job_names = HashSet::new();

    for (idx, stage) in spec.stages.iter().enumerate() {
        if !stage_names.insert(stage.name.as_str()) {
            issues.push(ValidationIssue::DuplicateStage {
                stage: stage.name.clone(),
            });
        }
        if stage.jobs.is_empty() {
            issues.push(ValidationIssue::EmptyStage {
                stage: stage.name.clone(),
            });
        }

        for job in &stage.jobs {
            if !job_names.insert(job.name.as_str()) {
                issues.push(ValidationIssue::DuplicateJob {
                    job: job.name.clone(),
                });
            }
            if job.image.trim().is_empty() {
                issues.push(ValidationIssue::EmptyImage {
                    job: job.name.clone(),
                });
            }

            for dep in &job.needs {
                match job_stage.get(dep.as_str()) {
                    Some(&dep_idx) if dep_idx < idx => {}
                    Some(&dep_idx) if dep_idx == idx => {
                        issues.push(ValidationIssue::SameStageDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                            stage: stage.name.clone(),
                        });
                    }
                    Some(_) => issues.push(ValidationIssue::LaterStageDependency {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                    }),
                    None => issues.push(ValidationIssue::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                    }),
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

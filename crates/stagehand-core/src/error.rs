//! Error types for Stagehand.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single structural problem found in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    NoStages,
    DuplicateStage { stage: String },
    EmptyStage { stage: String },
    DuplicateJob { job: String },
    EmptyImage { job: String },
    UnknownDependency { job: String, dependency: String },
    SameStageDependency { job: String, dependency: String, stage: String },
    LaterStageDependency { job: String, dependency: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::NoStages => write!(f, "pipeline has no stages"),
            ValidationIssue::DuplicateStage { stage } => {
                write!(f, "stage '{}' is defined more than once", stage)
            }
            ValidationIssue::EmptyStage { stage } => write!(f, "stage '{}' has no jobs", stage),
            ValidationIssue::DuplicateJob { job } => {
                write!(f, "job '{}' is defined more than once", job)
            }
            ValidationIssue::EmptyImage { job } => write!(f, "job '{}' has no image", job),
            ValidationIssue::UnknownDependency { job, dependency } => {
                write!(f, "job '{}' needs unknown job '{}'", job, dependency)
            }
            ValidationIssue::SameStageDependency {
                job,
                dependency,
                stage,
            } => write!(
                f,
                "job '{}' needs '{}' from its own stage '{}'",
                job, dependency, stage
            ),
            ValidationIssue::LaterStageDependency { job, dependency } => write!(
                f,
                "job '{}' needs '{}' which runs in a later stage",
                job, dependency
            ),
        }
    }
}

/// A pipeline definition failed validation. Fatal before any job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        debug_assert!(!issues.is_empty());
        Self { issues }
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }
}

impl From<ValidationIssue> for ValidationError {
    fn from(issue: ValidationIssue) -> Self {
        Self::new(vec![issue])
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline: ")?;
        match self.issues.split_first() {
            Some((first, [])) => write!(f, "{}", first),
            Some((first, rest)) => write!(f, "{} (and {} more)", first, rest.len()),
            None => write!(f, "unknown problem"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Data-flow contract violations between jobs.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no artifact from job '{0}'")]
    NotFound(String),

    #[error("job '{0}' already stored an artifact")]
    Duplicate(String),

    #[error("artifact I/O for job '{job}': {source}")]
    Io {
        job: String,
        #[source]
        source: std::io::Error,
    },
}

/// The container runtime could not start a container.
#[derive(Debug, Error)]
#[error("failed to launch '{image}': {message}")]
pub struct LaunchError {
    pub image: String,
    pub message: String,
}

impl LaunchError {
    pub fn new(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            message: message.into(),
        }
    }
}

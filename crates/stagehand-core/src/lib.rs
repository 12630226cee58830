//! Core domain types and traits for the Stagehand pipeline runner.
//!
//! This crate contains:
//! - Run identifiers and the error taxonomy
//! - The pipeline model (stages, jobs) and its validation
//! - Run results (job, stage, pipeline)
//! - Artifact storage (in-memory and directory-scoped)
//! - The container runtime trait that job execution is delegated to
//! - The cancellation signal shared by a run

pub mod artifact;
pub mod cancel;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod result;
pub mod runtime;

pub use artifact::{ArtifactRef, ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
pub use cancel::CancelSignal;
pub use error::{ArtifactError, Error, LaunchError, Result, ValidationError, ValidationIssue};
pub use id::RunId;
pub use pipeline::{Job, PipelineSpec, Stage};
pub use result::{
    FailureKind, JobResult, JobStatus, PipelineResult, PipelineStatus, StageResult, StageStatus,
};
pub use runtime::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, InputArtifact, LogLine, LogSink, LogStream,
};

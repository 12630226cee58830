//! Container runtimes for Stagehand.
//!
//! Provides runtime implementations for running pipeline jobs:
//! - Local Docker daemon

pub mod docker;

pub use docker::DockerRuntime;
pub use stagehand_core::runtime::{
    ContainerRuntime, ExecutionOutcome, ExecutionRequest, InputArtifact, LogLine, LogSink,
    LogStream,
};

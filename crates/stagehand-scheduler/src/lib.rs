//! Pipeline scheduling for Stagehand.
//!
//! Stages run strictly in declared order; the jobs of a stage run
//! concurrently. The first failing stage halts the pipeline and every later
//! stage is recorded as skipped.
//!
//! - [`JobExecutor`] runs one job against a container runtime.
//! - [`StageRunner`] fans a stage out and waits for every job.
//! - [`PipelineScheduler`] walks the stages and aggregates the result.

pub mod context;
pub mod event;
pub mod job;
pub mod scheduler;
pub mod stage;

#[cfg(test)]
mod testing;

pub use context::{RunContext, RunState};
pub use event::PipelineEvent;
pub use job::JobExecutor;
pub use scheduler::PipelineScheduler;
pub use stage::StageRunner;

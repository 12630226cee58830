//! KDL configuration loading for Stagehand.
//!
//! This crate handles:
//! - Pipeline definitions (`stagehand.kdl`)
//! - Runner settings (the optional `runner` block)
//! - Variable interpolation
//! - Human-friendly durations ("90s", "10m", "1h30m")

pub mod duration;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod variables;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use runner::{ArtifactStoreKind, RunnerConfig, parse_runner_config};
pub use variables::{GitContext, VariableContext, VariableContextBuilder};

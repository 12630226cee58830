//! Runner settings.
//!
//! Read from an optional `runner` block in the pipeline file; CLI flags are
//! applied on top by the binary.
//!
//! ```kdl
//! runner {
//!     workspace "."
//!     default-timeout "1h"
//!     artifact-store "directory"
//!     artifact-dir ".pipeline_artifacts"
//!     branch "main"
//! }
//! ```

use crate::duration::parse_duration;
use crate::pipeline::get_first_string_arg;
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timeout applied to jobs that do not set their own.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Where artifacts live for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStoreKind {
    #[default]
    Memory,
    Directory,
}

impl std::str::FromStr for ArtifactStoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(ArtifactStoreKind::Memory),
            "directory" | "dir" => Ok(ArtifactStoreKind::Directory),
            _ => Err(ConfigError::InvalidValue {
                field: "artifact-store".to_string(),
                message: format!("unknown artifact store: {}", s),
            }),
        }
    }
}

/// How the runner executes a pipeline on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Host directory mounted into every container as `/workspace`.
    pub workspace: PathBuf,
    /// Timeout for jobs without one. `None` disables the default.
    pub default_timeout: Option<Duration>,
    pub artifact_store: ArtifactStoreKind,
    /// Root of the directory artifact store, relative to the workspace.
    pub artifact_dir: PathBuf,
    /// Branch used for `only` filters. Detected from git when unset.
    pub branch: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            default_timeout: Some(DEFAULT_JOB_TIMEOUT),
            artifact_store: ArtifactStoreKind::Memory,
            artifact_dir: PathBuf::from(".pipeline_artifacts"),
            branch: None,
        }
    }
}

impl RunnerConfig {
    /// Absolute-or-relative path of the directory store.
    pub fn artifact_root(&self) -> PathBuf {
        if self.artifact_dir.is_absolute() {
            self.artifact_dir.clone()
        } else {
            self.workspace.join(&self.artifact_dir)
        }
    }
}

/// Parse the `runner` block of a KDL document. Absent block means defaults.
pub fn parse_runner_config(kdl: &str) -> ConfigResult<RunnerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = RunnerConfig::default();

    let Some(runner) = doc.nodes().iter().find(|n| n.name().value() == "runner") else {
        return Ok(config);
    };

    if let Some(children) = runner.children() {
        for child in children.nodes() {
            let key = child.name().value();
            let value = get_first_string_arg(child);
            match (key, value) {
                ("workspace", Some(v)) => config.workspace = PathBuf::from(v),
                ("default-timeout", Some(v)) if v == "none" => config.default_timeout = None,
                ("default-timeout", Some(v)) => config.default_timeout = Some(parse_duration(&v)?),
                ("artifact-store", Some(v)) => config.artifact_store = v.parse()?,
                ("artifact-dir", Some(v)) => config.artifact_dir = PathBuf::from(v),
                ("branch", Some(v)) => config.branch = Some(v),
                (
                    "workspace" | "default-timeout" | "artifact-store" | "artifact-dir" | "branch",
                    None,
                ) => {
                    return Err(ConfigError::MissingField(format!("runner {}", key)));
                }
                _ => {}
            }
        }
    }

    Ok(config)
}

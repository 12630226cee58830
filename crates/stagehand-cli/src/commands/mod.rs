//! CLI command implementations.

pub mod run;

use anyhow::Result;
use stagehand_config::{ConfigError, load_pipeline};
use stagehand_core::PipelineSpec;
use std::path::Path;
use std::process::ExitCode;

use crate::EXIT_CONFIG_ERROR;

pub fn validate(path: &Path) -> Result<ExitCode> {
    match load_pipeline(path) {
        Ok(spec) => {
            println!(
                "Configuration is valid: {} stage(s), {} job(s)",
                spec.stages.len(),
                spec.job_count()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            report_config_error(&e);
            Ok(ExitCode::from(EXIT_CONFIG_ERROR))
        }
    }
}

pub fn plan(path: &Path, branch: Option<&str>) -> Result<ExitCode> {
    let spec = match load_pipeline(path) {
        Ok(spec) => spec,
        Err(e) => {
            report_config_error(&e);
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    let spec = match branch {
        Some(branch) => match spec.for_branch(branch) {
            Ok(filtered) => filtered,
            Err(e) => {
                report_config_error(&ConfigError::Invalid(e));
                return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
            }
        },
        None => spec,
    };

    print_plan(&spec);
    Ok(ExitCode::SUCCESS)
}

/// Print a config error, one line per validation issue.
pub(crate) fn report_config_error(err: &ConfigError) {
    match err {
        ConfigError::Invalid(invalid) => {
            eprintln!("Pipeline is invalid:");
            for issue in invalid.issues() {
                eprintln!("  - {}", issue);
            }
        }
        other => eprintln!("Configuration error: {}", other),
    }
}

fn print_plan(spec: &PipelineSpec) {
    println!("Pipeline: {}", spec.name);
    for (index, stage) in spec.stages.iter().enumerate() {
        println!("{}. {}", index + 1, stage.name);
        for job in &stage.jobs {
            println!("   - {} ({})", job.name, job.image);
            if !job.needs.is_empty() {
                println!("       needs: {}", job.needs.join(", "));
            }
            if !job.artifacts.is_empty() {
                println!("       artifacts: {}", job.artifacts.join(", "));
            }
            if let Some(timeout) = job.timeout {
                println!("       timeout: {:?}", timeout);
            }
        }
    }
}

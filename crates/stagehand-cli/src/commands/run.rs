//! Local pipeline execution command.

use anyhow::{Context, Result};
use clap::Args;
use stagehand_config::{
    ArtifactStoreKind, ConfigError, RunnerConfig, VariableContext, parse_duration,
    parse_pipeline, parse_runner_config,
};
use stagehand_core::runtime::LogStream;
use stagehand_core::{
    ArtifactStore, CancelSignal, JobStatus, LocalArtifactStore, MemoryArtifactStore,
    PipelineResult, StageStatus,
};
use stagehand_executor::DockerRuntime;
use stagehand_scheduler::{PipelineEvent, PipelineScheduler};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use super::report_config_error;
use crate::EXIT_CONFIG_ERROR;

/// Shell convention for termination by SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the configuration file
    #[arg(default_value = "stagehand.kdl")]
    pub path: PathBuf,

    /// Host directory mounted into every container
    #[arg(long, env = "STAGEHAND_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Branch used for `only` filters (detected from git when unset)
    #[arg(long, env = "STAGEHAND_BRANCH")]
    pub branch: Option<String>,

    /// Default job timeout, e.g. "30m", or "none"
    #[arg(long, env = "STAGEHAND_TIMEOUT")]
    pub timeout: Option<String>,

    /// Artifact store to use
    #[arg(long, value_parser = ["memory", "directory", "dir"])]
    pub artifact_store: Option<String>,

    /// Root directory for the directory artifact store
    #[arg(long, env = "STAGEHAND_ARTIFACT_DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Print the final result as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Layer the flags over the `runner` block.
    fn apply(&self, config: &mut RunnerConfig) -> Result<(), ConfigError> {
        if let Some(workspace) = &self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(branch) = &self.branch {
            config.branch = Some(branch.clone());
        }
        if let Some(timeout) = &self.timeout {
            config.default_timeout = match timeout.as_str() {
                "none" => None,
                value => Some(parse_duration(value)?),
            };
        }
        if let Some(store) = &self.artifact_store {
            config.artifact_store = store.parse()?;
        }
        if let Some(dir) = &self.artifact_dir {
            config.artifact_dir = dir.clone();
        }
        Ok(())
    }
}

/// Run a pipeline locally using Docker.
pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let content = std::fs::read_to_string(&args.path)
        .with_context(|| format!("Failed to read config file: {}", args.path.display()))?;

    let loaded = parse_pipeline(&content).and_then(|spec| {
        let mut config = parse_runner_config(&content)?;
        args.apply(&mut config)?;
        Ok((spec, config))
    });
    let (spec, config) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            report_config_error(&e);
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    let workspace = resolve_workspace(&config.workspace)?;
    let mut variables = VariableContext::from_git_repo(&workspace.to_string_lossy());
    variables.populate_env();
    if let Some(branch) = &config.branch {
        variables.git.branch = branch.clone();
        if variables.git.tag.is_none() {
            variables.git.ref_name = branch.clone();
        }
    }
    let branch = variables.git.branch.clone();

    if !spec
        .stages
        .iter()
        .flat_map(|s| s.jobs.iter())
        .any(|j| j.runs_on(&branch))
    {
        println!("No jobs run on branch '{}'", branch);
        return Ok(ExitCode::SUCCESS);
    }
    let spec = match spec.for_branch(&branch) {
        Ok(spec) => spec,
        Err(e) => {
            report_config_error(&ConfigError::Invalid(e));
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    let store: Arc<dyn ArtifactStore> = match config.artifact_store {
        ArtifactStoreKind::Memory => Arc::new(MemoryArtifactStore::new()),
        ArtifactStoreKind::Directory => Arc::new(LocalArtifactStore::new(config.artifact_root())),
    };

    let runtime = DockerRuntime::new()
        .context("Failed to connect to Docker")?
        .with_workspace(workspace.clone());

    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(watch_interrupts(signal));

    info!(
        pipeline = %spec.name,
        workspace = %workspace.display(),
        branch = %branch,
        "Running pipeline"
    );

    let scheduler = PipelineScheduler::new(Arc::new(runtime))
        .with_store(store)
        .with_variables(variables)
        .with_default_timeout(config.default_timeout)
        .with_cancel_signal(cancel);

    let (mut rx, result_handle) = scheduler.execute(&spec);

    while let Some(event) = rx.recv().await {
        if !args.json {
            print_event(event);
        }
    }

    let result = match result_handle
        .await
        .context("Pipeline execution task failed")?
    {
        Ok(result) => result,
        Err(e) => {
            report_config_error(&ConfigError::Invalid(e));
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(ExitCode::from(result.exit_code() as u8))
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    ForceQuit,
}

/// First Ctrl-C cancels the run; a second one exits immediately.
fn on_interrupt(signal: &CancelSignal) -> Interrupt {
    if signal.is_cancelled() {
        Interrupt::ForceQuit
    } else {
        signal.cancel();
        Interrupt::Cancel
    }
}

async fn watch_interrupts(signal: CancelSignal) {
    while tokio::signal::ctrl_c().await.is_ok() {
        match on_interrupt(&signal) {
            Interrupt::Cancel => {
                warn!("Interrupt received, cancelling run (press Ctrl-C again to force quit)");
            }
            Interrupt::ForceQuit => {
                warn!("Second interrupt, exiting without cleanup");
                std::process::exit(EXIT_INTERRUPTED);
            }
        }
    }
}

/// The workspace as an absolute path.
fn resolve_workspace(workspace: &Path) -> Result<PathBuf> {
    workspace
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace: {}", workspace.display()))
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted {
            run_id,
            pipeline,
            stages,
            jobs,
        } => {
            println!(
                "--- Pipeline '{}' ({} stages, {} jobs) run {} ---\n",
                pipeline,
                stages,
                jobs,
                run_id.short()
            );
        }
        PipelineEvent::StageStarted { stage, .. } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::JobStarted { job, .. } => {
            println!("  ▶ {}", job);
        }
        PipelineEvent::JobLog { job, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", job, stream_marker, line.content.trim_end());
        }
        PipelineEvent::JobFinished { result, .. } => match &result.status {
            JobStatus::Succeeded => println!("  ✓ {}", result.job),
            JobStatus::Failed { reason } => println!("  ✗ {}: {}", result.job, reason),
            _ => {}
        },
        PipelineEvent::StageFinished { result } => {
            if result.is_success() {
                println!("✓ Stage '{}' completed successfully\n", result.stage);
            } else {
                println!("✗ Stage '{}' failed\n", result.stage);
            }
        }
        PipelineEvent::StageSkipped { stage } => {
            println!("⊘ Stage '{}' skipped", stage);
        }
        PipelineEvent::PipelineFinished { status, duration } => {
            println!("\n--- Pipeline finished ({:?}) in {:.1?} ---", status, duration);
        }
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Stage Summary ---");
    for stage in &result.stages {
        let status = match stage.status {
            StageStatus::Succeeded => "✓ succeeded",
            StageStatus::Failed => "✗ failed",
            StageStatus::Skipped => "⊘ skipped",
        };
        println!("  {} - {}", stage.stage, status);
        for job in stage.failed_jobs() {
            match &job.message {
                Some(message) => println!(
                    "      {}: {} ({})",
                    job.job,
                    job.status.failure().map(ToString::to_string).unwrap_or_default(),
                    message
                ),
                None => println!(
                    "      {}: {}",
                    job.job,
                    job.status.failure().map(ToString::to_string).unwrap_or_default()
                ),
            }
        }
    }

    println!(
        "\n{} of {} jobs executed in {:.1?}",
        result.executed_jobs(),
        result.job_count,
        result.duration
    );
    if result.is_success() {
        println!("✓ Pipeline succeeded!");
    } else {
        println!("✗ Pipeline failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: RunArgs,
    }

    fn args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["stagehand"];
        full.extend_from_slice(argv);
        Wrapper::parse_from(full).args
    }

    #[test]
    fn test_flags_override_runner_block() {
        let mut config = parse_runner_config(
            r#"runner { workspace "/src"; default-timeout "1h"; artifact-store "memory"; }"#,
        )
        .unwrap();

        args(&[
            "pipeline.kdl",
            "--timeout",
            "90s",
            "--artifact-store",
            "directory",
            "--artifact-dir",
            "/tmp/out",
        ])
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.workspace, PathBuf::from("/src"));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.artifact_store, ArtifactStoreKind::Directory);
        assert_eq!(config.artifact_root(), PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_timeout_none_disables_default() {
        let mut config = RunnerConfig::default();
        args(&["--timeout", "none"]).apply(&mut config).unwrap();
        assert!(config.default_timeout.is_none());
    }

    #[test]
    fn test_bad_timeout_is_config_error() {
        let mut config = RunnerConfig::default();
        let err = args(&["--timeout", "later"]).apply(&mut config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_default_path() {
        assert_eq!(args(&[]).path, PathBuf::from("stagehand.kdl"));
    }

    #[test]
    fn test_second_interrupt_forces_quit() {
        let signal = CancelSignal::new();

        assert_eq!(on_interrupt(&signal), Interrupt::Cancel);
        assert!(signal.is_cancelled());
        assert_eq!(on_interrupt(&signal), Interrupt::ForceQuit);
    }
}

//! Variable interpolation for pipeline definitions.
//!
//! Supports variables like:
//! - `${NAME}` - Pipeline variable from the `variables` block
//! - `${git.branch}` - Current branch name
//! - `${git.sha}` / `${git.short_sha}` - Commit SHA
//! - `${git.tag}` - Tag at HEAD, if any
//! - `${git.ref}` - Tag if present, else branch
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${stage.name}` / `${stage.index}` - Current stage
//! - `${job.name}` - Current job
//! - `${env.VAR_NAME}` - Host environment variable
//! - `${date}` / `${timestamp}` - Current date / Unix time
//!
//! Unknown variables are left untouched so the shell can still see `${...}`.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

/// Branch assumed when git cannot tell us.
pub const DEFAULT_BRANCH: &str = "main";

/// All variables available for interpolation during a run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline_name: String,
    pub run_id: String,
    pub stage_name: String,
    pub stage_index: usize,
    pub job_name: String,
    /// Host environment variables, opt-in via `populate_env`.
    pub env: BTreeMap<String, String>,
    /// Pipeline variables.
    pub custom: BTreeMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
}

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with git information read from the repository at `repo_path`.
    pub fn from_git_repo(repo_path: &str) -> Self {
        let mut ctx = Self::new();
        ctx.populate_git_from_repo(repo_path);
        ctx
    }

    /// Fill the git context by running git in `repo_path`.
    ///
    /// Anything git cannot answer stays empty, except the branch, which falls
    /// back to [`DEFAULT_BRANCH`].
    pub fn populate_git_from_repo(&mut self, repo_path: &str) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        self.git.branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .filter(|b| b != "HEAD")
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        self.git.ref_name = self.git.branch.clone();

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }

        debug!(branch = %self.git.branch, sha = %self.git.short_sha, "Resolved git context");
    }

    /// Copy the current process environment into `${env.*}`.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    /// Set a pipeline variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Narrow the context to one job of one stage.
    pub fn for_job(&self, stage: &str, stage_index: usize, job: &str) -> Self {
        let mut ctx = self.clone();
        ctx.stage_name = stage.to_string();
        ctx.stage_index = stage_index;
        ctx.job_name = job.to_string();
        ctx
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),

            ["pipeline", "name"] => Some(self.pipeline_name.clone()),
            ["run", "id"] => Some(self.run_id.clone()),
            ["stage", "name"] => Some(self.stage_name.clone()),
            ["stage", "index"] => Some(self.stage_index.to_string()),
            ["job", "name"] => Some(self.job_name.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all `${...}` variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// Builder for creating a VariableContext.
#[derive(Default)]
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if self.ctx.git.tag.is_none() {
            self.ctx.git.ref_name = branch.clone();
        }
        self.ctx.git.branch = branch;
        self
    }

    pub fn with_git_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.ctx.git.ref_name = tag.clone();
        self.ctx.git.tag = Some(tag);
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline_name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>) -> Self {
        self.ctx.run_id = id.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: &BTreeMap<String, String>) -> Self {
        self.ctx
            .custom
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

//! Pipeline configuration parsing.

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use stagehand_core::pipeline::{Job, PipelineSpec, Stage};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Read and parse a pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineSpec> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_pipeline(&content)
}

/// Parse a pipeline from KDL text and validate it.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineSpec> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut stages = Vec::new();
    let mut variables = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "variables" => {
                variables.extend(parse_string_map(node));
            }
            "stage" => {
                stages.push(parse_stage(node)?);
            }
            _ => {} // `runner` and unknown nodes are handled elsewhere
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let spec = PipelineSpec {
        name,
        stages,
        variables,
    };
    spec.validate()?;

    debug!(
        pipeline = %spec.name,
        stages = spec.stages.len(),
        jobs = spec.job_count(),
        "Parsed pipeline"
    );
    Ok(spec)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut jobs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "job" {
                jobs.push(parse_job(child)?);
            }
        }
    }

    Ok(Stage::new(name, jobs))
}

fn parse_job(node: &KdlNode) -> ConfigResult<Job> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut image = String::new();
    let mut job = Job::new(name.clone(), String::new());
    job.needs = get_string_list_prop(node, "needs");

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "run" | "script" => {
                    job.script.extend(get_all_string_args(child));
                }
                "artifacts" => {
                    job.artifacts.extend(get_all_string_args(child));
                }
                "only" => {
                    job.only.extend(get_all_string_args(child));
                }
                "timeout" => {
                    job.timeout = Some(parse_timeout(&name, child)?);
                }
                "env" => {
                    job.env.extend(parse_string_map(child));
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!("image for job '{}'", name)));
    }
    job.image = image;

    Ok(job)
}

fn parse_timeout(job: &str, node: &KdlNode) -> ConfigResult<Duration> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(format!("timeout value for job '{}'", job)))?;

    match value {
        KdlValue::String(s) => parse_duration(s),
        KdlValue::Integer(secs) => u64::try_from(*secs)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                field: format!("timeout for job '{}'", job),
                message: format!("{} is not a valid number of seconds", secs),
            }),
        other => Err(ConfigError::InvalidValue {
            field: format!("timeout for job '{}'", job),
            message: format!("expected a duration, got {}", other),
        }),
    }
}

// Helper functions for extracting values from KDL nodes

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// Children of the form `KEY "value"` as a map.
fn parse_string_map(node: &KdlNode) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if let Some(val) = get_first_string_arg(child) {
                map.insert(child.name().value().to_string(), val);
            }
        }
    }
    map
}

/// Collect a list given as repeated props (`needs="a" needs="b"`) or as a
/// child node (`needs "a" "b"`).
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}

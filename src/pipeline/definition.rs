// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Pipeline definition files
//!
//! Defines the schema for .seqflow.yaml files and their lowering into the
//! composition tree. Stage commands are templates: `$input`/`$inputs`
//! expand to the stage's inputs, `$output`/`$outputs` to its declared
//! outputs, `$branch` to the fan-out branch label.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::RunConfig;
use crate::errors::{SeqflowError, SeqflowResult};
use crate::pipeline::composer::{FanKeys, Node};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::StageDef;

/// Pipeline definition from .seqflow.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Run configuration overrides
    #[serde(default)]
    pub config: RunConfig,

    /// Starting inputs fed to the first stage
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Stage tree in execution order
    pub stages: Vec<NodeDef>,
}

impl PipelineDef {
    /// Load a definition from a YAML file.
    pub fn from_file(path: &std::path::Path) -> SeqflowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SeqflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> SeqflowResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialise back to YAML.
    pub fn to_yaml(&self) -> SeqflowResult<String> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Structural checks before anything runs.
    pub fn validate(&self) -> SeqflowResult<()> {
        if self.stages.is_empty() {
            return Err(SeqflowError::InvalidDefinition {
                reason: "pipeline has no stages".into(),
                help: None,
            });
        }

        let mut seen = HashSet::new();
        validate_nodes(&self.stages, &mut seen)
    }

    /// Lower the definition into a composition tree.
    pub fn to_node(&self) -> SeqflowResult<Node> {
        lower_sequence(&self.stages)
    }

    /// Resolve the starting inputs, expanding glob patterns against the
    /// working directory. Plain paths pass through untouched; a glob that
    /// matches nothing is fatal.
    pub fn resolve_inputs(&self, base_dir: &std::path::Path) -> SeqflowResult<Vec<String>> {
        let mut files = Vec::new();

        for input in &self.inputs {
            if !input.contains('*') && !input.contains('?') && !input.contains('[') {
                files.push(input.clone());
                continue;
            }

            let full_pattern = if std::path::Path::new(input).is_absolute() {
                input.clone()
            } else {
                base_dir.join(input).to_string_lossy().to_string()
            };

            let matches: Vec<_> = glob::glob(&full_pattern)?
                .filter_map(Result::ok)
                .collect();

            if matches.is_empty() {
                return Err(SeqflowError::PatternMatch {
                    pattern: input.clone(),
                });
            }

            for path in matches {
                let relative = path.strip_prefix(base_dir).unwrap_or(&path);
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }

        Ok(files)
    }
}

/// One element of the stage tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeDef {
    /// Parallel section over branches or a filename pattern
    Fanout {
        fanout: FanoutDef,
    },
    /// A single stage
    Stage(StageSpec),
}

/// A fan-out block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutDef {
    /// Explicit branch keys (chromosomes, samples, regions)
    #[serde(default)]
    pub branches: Vec<String>,

    /// Filename pattern with `%` as the branch-id capture
    #[serde(default)]
    pub pattern: Option<String>,

    /// Parallel segments, each a sequence of stages
    pub segments: Vec<Vec<NodeDef>>,
}

/// One stage: a name, a command template and its declared outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,

    /// Shell command template
    pub command: String,

    /// Output path templates
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Explicit onward inputs; defaults to the outputs, then the inputs
    #[serde(default)]
    pub next_inputs: Option<Vec<String>>,
}

fn validate_nodes(defs: &[NodeDef], seen: &mut HashSet<String>) -> SeqflowResult<()> {
    for def in defs {
        match def {
            NodeDef::Stage(spec) => {
                if spec.command.trim().is_empty() {
                    return Err(SeqflowError::InvalidStage {
                        stage: spec.name.clone(),
                        reason: "command is empty".into(),
                    });
                }
                if !seen.insert(spec.name.clone()) {
                    return Err(SeqflowError::InvalidDefinition {
                        reason: format!("duplicate stage name '{}'", spec.name),
                        help: Some("Stage names must be unique across the pipeline".into()),
                    });
                }
            }
            NodeDef::Fanout { fanout } => {
                let has_branches = !fanout.branches.is_empty();
                let has_pattern = fanout.pattern.is_some();
                if has_branches == has_pattern {
                    return Err(SeqflowError::InvalidDefinition {
                        reason: "fanout needs either 'branches' or 'pattern'".into(),
                        help: None,
                    });
                }
                if fanout.segments.is_empty() || fanout.segments.iter().any(|s| s.is_empty()) {
                    return Err(SeqflowError::InvalidDefinition {
                        reason: "fanout segments must be non-empty".into(),
                        help: None,
                    });
                }
                for segment in &fanout.segments {
                    validate_nodes(segment, seen)?;
                }
            }
        }
    }
    Ok(())
}

fn lower_sequence(defs: &[NodeDef]) -> SeqflowResult<Node> {
    let mut lowered = Vec::new();
    for def in defs {
        lowered.push(lower(def)?);
    }

    let mut nodes = lowered.into_iter();
    let first = nodes.next().ok_or_else(|| SeqflowError::InvalidDefinition {
        reason: "empty stage sequence".into(),
        help: None,
    })?;

    Ok(nodes.fold(first, |acc, node| acc + node))
}

fn lower(def: &NodeDef) -> SeqflowResult<Node> {
    match def {
        NodeDef::Stage(spec) => Ok(Node::Stage(stage_from_spec(spec.clone()))),
        NodeDef::Fanout { fanout } => {
            let keys = if fanout.branches.is_empty() {
                let pattern =
                    fanout
                        .pattern
                        .clone()
                        .ok_or_else(|| SeqflowError::InvalidDefinition {
                            reason: "fanout needs either 'branches' or 'pattern'".into(),
                            help: None,
                        })?;
                FanKeys::Pattern(pattern)
            } else {
                FanKeys::Branches(fanout.branches.clone())
            };

            let mut segments = Vec::new();
            for segment in &fanout.segments {
                segments.push(lower_sequence(segment)?);
            }

            Ok(Node::Fanout(keys, segments))
        }
    }
}

fn stage_from_spec(spec: StageSpec) -> StageDef {
    StageDef::new(spec.name.clone(), move |ctx, rt| {
        let spec = spec.clone();
        Box::pin(async move {
            let outputs: Vec<String> = spec
                .outputs
                .iter()
                .map(|o| substitute(o, ctx, &[]))
                .collect();
            let command = substitute(&spec.command, ctx, &outputs);

            rt.exec(ctx, &command, &outputs).await?;

            if let Some(next) = &spec.next_inputs {
                let next = next.iter().map(|n| substitute(n, ctx, &outputs)).collect();
                ctx.set_next_inputs(next);
            }
            Ok(())
        })
    })
}

/// Expand `$inputs`, `$input`, `$outputs`, `$output` and `$branch`.
fn substitute(template: &str, ctx: &PipelineContext, outputs: &[String]) -> String {
    // Plural forms first so `$inputs` is not clobbered by `$input`
    template
        .replace("$inputs", &ctx.input.join(" "))
        .replace("$input", ctx.input.first().map(String::as_str).unwrap_or(""))
        .replace("$outputs", &outputs.join(" "))
        .replace("$output", outputs.first().map(String::as_str).unwrap_or(""))
        .replace("$branch", &ctx.branch)
}

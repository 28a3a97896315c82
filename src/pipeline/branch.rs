// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Pipelines and branch merging
//!
//! A pipeline is the ordered list of stage records produced by one walk of
//! the composition tree. Fan-outs fork child pipelines; when all branches
//! finish, the children's stages are folded back into the parent so a
//! downstream stage sees the parallel section as a flat sequence.

use crate::errors::{SeqflowError, SeqflowResult};

/// Synthetic stage name for the element seeding a branch's inputs
const PRIOR_STAGE: &str = "prior";

/// What one executed stage left behind
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage_name: String,
    pub branch: String,
    pub input: Vec<String>,
    pub output: Vec<String>,
    /// Outputs before merge rewriting
    pub raw_output: Vec<String>,
    pub next_inputs: Option<Vec<String>>,
    /// Synthetic elements introduced by composition; excluded from merging
    pub joiner: bool,
}

impl StageRecord {
    /// What flows onward from this stage.
    pub fn next_or_output(&self) -> Vec<String> {
        if let Some(next) = &self.next_inputs {
            return next.clone();
        }
        if !self.output.is_empty() {
            return self.output.clone();
        }
        self.input.clone()
    }

    /// Synthetic stage whose outputs are a branch's inputs, so downstream
    /// resolution inside the branch finds them.
    pub(crate) fn prior(branch: &str, inputs: Vec<String>) -> Self {
        Self {
            stage_name: PRIOR_STAGE.into(),
            branch: branch.into(),
            input: inputs.clone(),
            output: inputs.clone(),
            raw_output: inputs,
            next_inputs: None,
            joiner: true,
        }
    }
}

/// One pipeline instance: the root, or a forked fan-out branch
#[derive(Debug, Default)]
pub struct Pipeline {
    /// Display name; branch labels are appended on fork
    pub name: String,

    /// Branch label chain, empty for the root
    pub branch: String,

    /// Stages in execution order
    pub stages: Vec<StageRecord>,

    /// Forked child pipelines, populated by fan-outs
    pub children: Vec<Pipeline>,

    /// Set when any stage in this pipeline failed
    pub failed: bool,

    /// Failure messages accumulated on this pipeline
    pub fail_messages: Vec<String>,

    /// Guards against applying a branch name twice
    name_applied: bool,
}

impl Pipeline {
    /// The root pipeline for a run.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fork a child for one fan-out branch.
    pub fn fork(&self, key: &str) -> Pipeline {
        let label = if self.branch.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.branch, key)
        };

        let mut child = Pipeline {
            name: self.name.clone(),
            ..Default::default()
        };
        child.apply_branch_name(&label);
        child
    }

    /// Apply a branch label to this pipeline's identity. A second call is
    /// a no-op; nested fan-outs fold labels into the key instead.
    pub fn apply_branch_name(&mut self, label: &str) {
        if self.name_applied {
            return;
        }

        self.branch = label.to_string();
        self.name = if self.name.is_empty() {
            label.to_string()
        } else {
            format!("{}.{}", self.name, label)
        };
        self.name_applied = true;
    }

    /// Record a stage failure on this pipeline.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.fail_messages.push(message.into());
    }

    /// Fold completed children back into this pipeline.
    ///
    /// Children are taken in sorted branch order. Their stage lists
    /// (joiners excluded) are padded to equal length and transposed; at
    /// each index, records are grouped by stage name and merged into one
    /// record whose `raw_output` concatenates the members'
    /// `next_inputs`-or-`output`. A final merged stage carries the
    /// deduplicated outputs of the last layer, which are also returned as
    /// the fan-out's onward inputs.
    ///
    /// If any child failed, their messages are aggregated into one
    /// [`SeqflowError::BranchFailed`] instead.
    pub fn merge_children(&mut self) -> SeqflowResult<Vec<String>> {
        if self.children.iter().any(|c| c.failed) {
            let messages = self
                .children
                .iter()
                .filter(|c| c.failed)
                .flat_map(|c| c.fail_messages.iter().cloned())
                .collect();
            return Err(SeqflowError::branch_failures(messages));
        }

        self.children.sort_by(|a, b| a.branch.cmp(&b.branch));

        let lists: Vec<Vec<&StageRecord>> = self
            .children
            .iter()
            .map(|c| c.stages.iter().filter(|s| !s.joiner).collect())
            .collect();
        let depth = lists.iter().map(|l| l.len()).max().unwrap_or(0);

        let mut merged_stages = Vec::new();
        for idx in 0..depth {
            // Group the records at this depth by stage name, keeping
            // first-seen order
            let mut groups: Vec<(String, Vec<&StageRecord>)> = Vec::new();
            for list in &lists {
                let Some(record) = list.get(idx) else {
                    continue;
                };
                match groups.iter_mut().find(|(name, _)| *name == record.stage_name) {
                    Some((_, members)) => members.push(record),
                    None => groups.push((record.stage_name.clone(), vec![record])),
                }
            }

            for (name, members) in groups {
                let raw_output: Vec<String> =
                    members.iter().flat_map(|m| m.next_or_output()).collect();
                let input: Vec<String> = members.iter().flat_map(|m| m.input.clone()).collect();

                merged_stages.push(StageRecord {
                    stage_name: name,
                    branch: self.branch.clone(),
                    input,
                    output: raw_output.clone(),
                    raw_output,
                    next_inputs: None,
                    joiner: false,
                });
            }
        }

        // Final outputs: each branch's last stage, concatenated in sorted
        // branch order and deduplicated
        let mut finals = Vec::new();
        for child in &self.children {
            if let Some(last) = child.stages.iter().rev().find(|s| !s.joiner) {
                finals.extend(last.next_or_output());
            } else if let Some(last) = child.stages.last() {
                finals.extend(last.next_or_output());
            }
        }
        dedup_preserving_order(&mut finals);

        merged_stages.push(StageRecord {
            stage_name: "merge".into(),
            branch: self.branch.clone(),
            input: finals.clone(),
            output: finals.clone(),
            raw_output: finals.clone(),
            next_inputs: None,
            joiner: true,
        });

        self.stages.extend(merged_stages);
        Ok(finals)
    }
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Per-stage execution context
//!
//! The mutable state a stage body works against: the inputs it was given,
//! the outputs it declares, the commands it issued and what they produced,
//! and the branch identity when running inside a fan-out.

use std::collections::HashMap;
use std::path::Path;

use crate::meta::mtime_ms;

/// Mutable per-stage state during a run
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    /// Name of the executing stage
    pub stage_name: String,

    /// Branch label when inside a fan-out, empty at the top level
    pub branch: String,

    /// Inputs flowing into this stage, in order
    pub input: Vec<String>,

    /// Outputs the stage declares
    pub output: Vec<String>,

    /// Outputs before any merge rewriting
    pub raw_output: Vec<String>,

    /// What the stage passes to the next stage; defaults to `input` when
    /// unset so a stage that produces nothing is transparent
    pub next_inputs: Option<Vec<String>>,

    /// Command string -> outputs it produced, in issue order
    pub tracked_outputs: Vec<(String, Vec<String>)>,

    /// Output mtimes observed before each command ran, keyed by path.
    /// `None` means the file did not exist yet.
    pre_run: HashMap<String, Option<i64>>,
}

impl PipelineContext {
    pub fn new(
        stage_name: impl Into<String>,
        branch: impl Into<String>,
        input: Vec<String>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            branch: branch.into(),
            input,
            ..Default::default()
        }
    }

    /// Declare what the next stage should consume.
    pub fn set_next_inputs(&mut self, inputs: Vec<String>) {
        self.next_inputs = Some(inputs);
    }

    /// Record a command and the outputs it is about to produce.
    ///
    /// Snapshots each output's mtime so the driver can tell afterwards
    /// whether the command actually touched it.
    pub fn track(&mut self, command: &str, outputs: &[String], workdir: &Path) {
        for output in outputs {
            let path = if Path::new(output).is_absolute() {
                Path::new(output).to_path_buf()
            } else {
                workdir.join(output)
            };
            self.pre_run
                .entry(output.clone())
                .or_insert_with(|| mtime_ms(&path));

            if !self.output.contains(output) {
                self.output.push(output.clone());
                self.raw_output.push(output.clone());
            }
        }

        self.tracked_outputs
            .push((command.to_string(), outputs.to_vec()));
    }

    /// The mtime snapshot taken when `output` was tracked, if any.
    pub(crate) fn pre_run_mtime(&self, output: &str) -> Option<Option<i64>> {
        self.pre_run.get(output).copied()
    }

    /// What flows to the next stage: explicit `next_inputs`, else this
    /// stage's outputs, else its own inputs.
    pub fn next_or_output(&self) -> Vec<String> {
        if let Some(next) = &self.next_inputs {
            return next.clone();
        }
        if !self.output.is_empty() {
            return self.output.clone();
        }
        self.input.clone()
    }

    /// Derive a branch-qualified name from a base path, inserting the
    /// branch label before the extension: `out.txt` -> `out.chr1.txt`.
    pub fn branch_path(&self, base: &str) -> String {
        if self.branch.is_empty() {
            return base.to_string();
        }

        match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{}.{}.{}", stem, self.branch, ext)
            }
            _ => format!("{}.{}", base, self.branch),
        }
    }
}

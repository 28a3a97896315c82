// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Error types for pipeline execution
//!
//! Failures that reach the user carry the failing stage, the backend job id
//! where one was assigned, the exit code and the exact command line, with
//! captured output indented underneath.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for seqflow operations
pub type SeqflowResult<T> = Result<T, SeqflowError>;

/// Main error type for seqflow
#[derive(Error, Debug, Diagnostic)]
pub enum SeqflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Backend Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to submit command to {backend} backend (exit code {exit_code})\n  command: {command}\n{}", indent_output(.stdout, .stderr))]
    #[diagnostic(code(seqflow::start_failed))]
    StartFailed {
        backend: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Status query for job {id} failed {attempts} consecutive times: {message}")]
    #[diagnostic(
        code(seqflow::status_failed),
        help("The backend may be unreachable; check the scheduler is accepting queries")
    )]
    StatusFailed {
        id: String,
        attempts: u32,
        message: String,
    },

    #[error("Failed to stop job {id}: {message}")]
    #[diagnostic(code(seqflow::stop_failed))]
    StopFailed { id: String, message: String },

    #[error("Backend '{backend}' is not usable: {reason}")]
    #[diagnostic(code(seqflow::backend_unavailable))]
    BackendUnavailable { backend: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Stage Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stage '{stage}' failed with exit code {exit_code}{}\n  command: {command}\n{}", format_job_id(.job_id), indent_output(.stdout, .stderr))]
    #[diagnostic(code(seqflow::stage_failed))]
    StageFailed {
        stage: String,
        job_id: Option<String>,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Stage '{stage}' declared output '{path}' but the file does not exist and no metadata explains its absence")]
    #[diagnostic(
        code(seqflow::missing_output),
        help("The command may have written to a different path, or failed silently")
    )]
    MissingOutput { stage: String, path: String },

    #[error("Stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(seqflow::invalid_stage))]
    InvalidStage { stage: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Dependency cycle detected among outputs")]
    #[diagnostic(
        code(seqflow::dependency_cycle),
        help("Output metadata records reference each other as inputs; this never happens in a correct pipeline run. Inspect the listed records under .seqflow/outputs/")
    )]
    DependencyCycle { outputs: Vec<String> },

    #[error("Malformed output metadata record '{path}': {reason}")]
    #[diagnostic(
        code(seqflow::bad_meta_record),
        help("Remove or repair the record; it was expected to be key=value lines written by a previous run")
    )]
    BadMetaRecord { path: PathBuf, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Composition Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pattern '{pattern}' matched no input files")]
    #[diagnostic(
        code(seqflow::pattern_match),
        help("Check the pattern against the inputs flowing into the fan-out; '%' captures the branch id, '*' is a free wildcard")
    )]
    PatternMatch { pattern: String },

    #[error("{} parallel branch(es) failed", .messages.len())]
    #[diagnostic(code(seqflow::branch_failed))]
    BranchFailed {
        #[help]
        help: Option<String>,
        messages: Vec<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Definition Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline definition not found: {path}")]
    #[diagnostic(
        code(seqflow::definition_not_found),
        help("Create a .seqflow.yaml describing your stages, or pass --pipeline")
    )]
    DefinitionNotFound { path: PathBuf },

    #[error("Invalid pipeline definition: {reason}")]
    #[diagnostic(code(seqflow::invalid_definition))]
    InvalidDefinition {
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(seqflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(seqflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(seqflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(seqflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON error: {message}")]
    #[diagnostic(code(seqflow::json_error))]
    Json { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(seqflow::glob_error))]
    GlobPattern { message: String },

    #[error("Regex error: {message}")]
    #[diagnostic(code(seqflow::regex_error))]
    Regex { message: String },

    #[error("Internal error: {message}")]
    #[diagnostic(code(seqflow::internal))]
    Internal { message: String },
}

impl From<std::io::Error> for SeqflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for SeqflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for SeqflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<glob::PatternError> for SeqflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl From<regex::Error> for SeqflowError {
    fn from(e: regex::Error) -> Self {
        Self::Regex { message: e.to_string() }
    }
}

impl SeqflowError {
    /// Aggregate the failures of sibling branches into one composite error.
    ///
    /// Messages are deduplicated so that N identical failures across
    /// branches read as one.
    pub fn branch_failures(mut messages: Vec<String>) -> Self {
        messages.sort();
        messages.dedup();

        let help = Some(
            messages
                .iter()
                .map(|m| format!("- {}", m))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        Self::BranchFailed { help, messages }
    }
}

/// Indent captured stdout/stderr for display under an error heading.
fn indent_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();

    if !stdout.trim().is_empty() {
        out.push_str("  stdout:\n");
        for line in stdout.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }

    if !stderr.trim().is_empty() {
        out.push_str("  stderr:\n");
        for line in stderr.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

fn format_job_id(job_id: &Option<String>) -> String {
    match job_id {
        Some(id) => format!(" (job {})", id),
        None => String::new(),
    }
}

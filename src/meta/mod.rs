// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Output metadata records
//!
//! Every output file a stage produces gets one record describing how it was
//! made: the command, the inputs it was derived from, a fingerprint and the
//! timestamp observed at save time. Records are plain key=value text files
//! so users can inspect and repair them by hand.

mod store;

pub use store::MetaStore;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::SeqflowError;

/// Header written at the top of every record file
const HEADER: &str = "# seqflow output metadata";

/// Metadata describing one produced output file
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMeta {
    /// Path of the output file as recorded by the producing stage
    pub output_file: PathBuf,

    /// Normalised forward-slash form of the output path
    pub output_path: String,

    /// Inputs the output was derived from, in stage order
    pub inputs: Vec<String>,

    /// The shell command that produced the output
    pub command: String,

    /// Stable hash of command + output path
    pub fingerprint: String,

    /// Millisecond timestamp; the filesystem mtime while the file exists
    pub timestamp: i64,

    /// User-pinned: never a cleanup candidate
    pub preserve: bool,

    /// The file was intentionally removed by seqflow
    pub cleaned: bool,

    /// Computed during graph analysis, never persisted
    pub up_to_date: bool,

    /// Computed during graph analysis, never persisted
    pub max_timestamp: i64,
}

impl OutputMeta {
    /// Create a record for a freshly produced output.
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        let output_file = output_file.into();
        let output_path = normalize_path(&output_file);

        Self {
            output_file,
            output_path,
            inputs: Vec::new(),
            command: String::new(),
            fingerprint: String::new(),
            timestamp: 0,
            preserve: false,
            cleaned: false,
            up_to_date: false,
            max_timestamp: 0,
        }
    }

    /// Serialise to the on-disk key=value form.
    ///
    /// Booleans are written as `true`/`false`, lists comma-joined, the
    /// timestamp as a decimal string. The computed fields are stripped.
    pub fn to_record(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');

        let mut field = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&escape_value(value));
            out.push('\n');
        };

        field("outputFile", &self.output_file.to_string_lossy());
        field("outputPath", &self.output_path);
        field("inputs", &self.inputs.join(","));
        field("command", &self.command);
        field("fingerprint", &self.fingerprint);
        field("timestamp", &self.timestamp.to_string());
        field("preserve", if self.preserve { "true" } else { "false" });
        field("cleaned", if self.cleaned { "true" } else { "false" });

        out
    }

    /// Parse a record from its on-disk form.
    ///
    /// `source` names the file in errors; a record without an `outputFile`
    /// or with an unparseable `timestamp` is rejected.
    pub fn parse(content: &str, source: &Path) -> Result<Self, SeqflowError> {
        let bad = |reason: &str| SeqflowError::BadMetaRecord {
            path: source.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut meta = Self::new(PathBuf::new());
        let mut saw_output_file = false;
        let mut saw_timestamp = false;

        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, raw)) = line.split_once('=') else {
                return Err(bad(&format!("line '{}' is not key=value", line)));
            };
            let value = unescape_value(raw);

            match key {
                "outputFile" => {
                    meta.output_file = PathBuf::from(&value);
                    saw_output_file = true;
                }
                "outputPath" => meta.output_path = value,
                "inputs" => {
                    meta.inputs = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "command" => meta.command = value,
                "fingerprint" => meta.fingerprint = value,
                "timestamp" => {
                    meta.timestamp = value
                        .parse()
                        .map_err(|_| bad(&format!("timestamp '{}' is not an integer", value)))?;
                    saw_timestamp = true;
                }
                "preserve" => meta.preserve = value == "true",
                "cleaned" => meta.cleaned = value == "true",
                // Unknown keys are tolerated so newer versions can add fields
                _ => {}
            }
        }

        if !saw_output_file || meta.output_file.as_os_str().is_empty() {
            return Err(bad("missing required key 'outputFile'"));
        }
        if !saw_timestamp {
            return Err(bad("missing required key 'timestamp'"));
        }

        if meta.output_path.is_empty() {
            meta.output_path = normalize_path(&meta.output_file);
        }

        Ok(meta)
    }
}

/// Normalise a path to its forward-slash string form.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Modification time of a file in milliseconds, if it exists.
pub fn mtime_ms(path: &Path) -> Option<i64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

// Values are single-line on disk; embedded newlines and backslashes in
// commands are escaped.
fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

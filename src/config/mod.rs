// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Run configuration
//!
//! Keys consumed by the core: the global concurrency limit, the status-poll
//! tuning knobs, the backend selection, and the per-job resource requests
//! handed through to batch schedulers and custom scripts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum simultaneous backend invocations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lower bound on the status poll interval (ms)
    #[serde(default = "default_min_poll", rename = "minimumCommandStatusPollInterval")]
    pub min_poll_interval_ms: u64,

    /// Upper bound on the growth term of the poll interval (ms)
    #[serde(default = "default_max_poll", rename = "maxCommandStatusPollInterval")]
    pub max_poll_interval_ms: u64,

    /// Time over which the poll interval ramps up to its maximum (ms)
    #[serde(default = "default_backoff_period", rename = "commandStatusBackoffPeriod")]
    pub backoff_period_ms: u64,

    /// Which backend runs stage commands
    #[serde(default)]
    pub backend: BackendKind,

    /// Path to the user script for the custom-script backend
    #[serde(default)]
    pub custom_script: Option<PathBuf>,

    /// Per-job resource requests passed to the backend
    #[serde(flatten)]
    pub resources: ResourceRequest,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            min_poll_interval_ms: default_min_poll(),
            max_poll_interval_ms: default_max_poll(),
            backoff_period_ms: default_backoff_period(),
            backend: BackendKind::default(),
            custom_script: None,
            resources: ResourceRequest::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_min_poll() -> u64 {
    2000
}

fn default_max_poll() -> u64 {
    5000
}

fn default_backoff_period() -> u64 {
    180_000
}

/// Available command backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run commands directly on this host
    #[default]
    Local,
    /// Delegate to a user-provided start/status/stop script
    Custom,
    /// Submit to an LSF batch scheduler
    Lsf,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Custom => write!(f, "custom"),
            Self::Lsf => write!(f, "lsf"),
        }
    }
}

/// Resource requests attached to each submitted job
///
/// Every field is optional; backends pass through only what is set. The
/// driver does not enforce wall-time itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceRequest {
    /// Accounting project
    #[serde(default)]
    pub account: Option<String>,

    /// Wall-time limit, backend-specific format
    #[serde(default)]
    pub walltime: Option<String>,

    /// Memory request, backend-specific format
    #[serde(default)]
    pub memory: Option<String>,

    /// Processor/slot count
    #[serde(default)]
    pub procs: Option<u32>,

    /// Scheduler queue name
    #[serde(default)]
    pub queue: Option<String>,

    /// Job name override shown to the scheduler
    #[serde(default)]
    pub jobname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: RunConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.min_poll_interval_ms, 2000);
        assert_eq!(cfg.max_poll_interval_ms, 5000);
        assert_eq!(cfg.backoff_period_ms, 180_000);
        assert_eq!(cfg.backend, BackendKind::Local);
        assert!(cfg.resources.queue.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
concurrency: 8
minimumCommandStatusPollInterval: 1000
backend: lsf
queue: normal
walltime: "02:00"
procs: 4
"#;
        let cfg: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.min_poll_interval_ms, 1000);
        assert_eq!(cfg.max_poll_interval_ms, 5000);
        assert_eq!(cfg.backend, BackendKind::Lsf);
        assert_eq!(cfg.resources.queue.as_deref(), Some("normal"));
        assert_eq!(cfg.resources.procs, Some(4));
    }
}

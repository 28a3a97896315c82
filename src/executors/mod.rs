// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Command backends
//!
//! Every stage command runs through a backend implementing the same
//! start/status/wait/stop/cleanup contract: directly on this host, through
//! a user-provided control script, or on an LSF batch scheduler. All
//! external process launches go through the [`ConcurrencyGate`].

mod custom;
mod gate;
mod local;
mod lsf;
mod poll;

pub use custom::CustomScriptExecutor;
pub use gate::ConcurrencyGate;
pub use local::LocalExecutor;
pub use lsf::LsfExecutor;
pub use poll::{PollSchedule, PollTuning, MAX_STATUS_ERRORS, STATUS_RETRY_GAP};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{BackendKind, ResourceRequest, RunConfig};
use crate::errors::{SeqflowError, SeqflowResult};

/// Lifecycle state of a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Accepted but not yet running
    Queueing,
    /// Executing
    Running,
    /// Finished; an exit code is available
    Complete,
    /// The backend cannot say
    Unknown,
}

impl FromStr for CommandStatus {
    type Err = SeqflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUEING" => Ok(Self::Queueing),
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(SeqflowError::Internal {
                message: format!("unrecognised command status '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queueing => write!(f, "QUEUEING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One command submission
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Driver-assigned id, unique within the working directory
    pub id: String,
    /// Human-readable job name (usually the stage name)
    pub name: String,
    /// The shell command to run
    pub command: String,
    /// Pipeline working directory
    pub workdir: PathBuf,
    /// Per-job scratch directory: `.seqflow/commandtmp/<id>/`
    pub job_dir: PathBuf,
    /// Resource requests handed to the backend
    pub resources: ResourceRequest,
}

impl JobRequest {
    pub fn new(
        workdir: impl Into<PathBuf>,
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        resources: ResourceRequest,
    ) -> Self {
        let workdir = workdir.into();
        let id = id.into();
        let job_dir = workdir.join(".seqflow").join("commandtmp").join(&id);

        Self {
            id,
            name: name.into(),
            command: command.into(),
            workdir,
            job_dir,
            resources,
        }
    }

    /// Create the per-job scratch directory.
    pub fn create_job_dir(&self) -> SeqflowResult<()> {
        std::fs::create_dir_all(&self.job_dir).map_err(|e| SeqflowError::FileWriteError {
            path: self.job_dir.clone(),
            error: e.to_string(),
        })
    }
}

/// Contract every backend implements
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Submit a command, blocking until the backend assigns it an id.
    ///
    /// Creates the per-job scratch directory. A failed submission carries
    /// the start command line, exit code and captured output.
    async fn start(&mut self, job: &JobRequest) -> SeqflowResult<()>;

    /// Cheap state query.
    async fn status(&mut self) -> SeqflowResult<CommandStatus>;

    /// Block until the command finishes; returns its exit code.
    async fn wait_for(&mut self) -> SeqflowResult<i32>;

    /// Request cancellation. Idempotent; a job that is already gone is not
    /// an error.
    async fn stop(&mut self) -> SeqflowResult<()>;

    /// Release resources attached during `start` (e.g. output forwarders).
    async fn cleanup(&mut self);

    /// Regexes of backend chatter the driver should suppress from captured
    /// output, if any.
    fn ignorable_outputs(&self) -> Option<Vec<String>> {
        None
    }
}

/// Build the executor for the configured backend.
pub fn create_executor(
    config: &RunConfig,
    gate: ConcurrencyGate,
) -> SeqflowResult<Box<dyn CommandExecutor>> {
    let tuning = PollTuning::from_config(config);

    match config.backend {
        BackendKind::Local => Ok(Box::new(LocalExecutor::new(gate))),
        BackendKind::Custom => {
            let script = config.custom_script.clone().ok_or_else(|| {
                SeqflowError::BackendUnavailable {
                    backend: "custom".into(),
                    reason: "no custom_script configured".into(),
                }
            })?;
            Ok(Box::new(CustomScriptExecutor::new(script, tuning, gate)))
        }
        BackendKind::Lsf => Ok(Box::new(LsfExecutor::new(tuning, gate))),
    }
}

/// Verify the configured backend's binaries exist before running anything.
pub fn check_backend(config: &RunConfig) -> SeqflowResult<()> {
    match config.backend {
        BackendKind::Local => Ok(()),
        BackendKind::Custom => {
            let script = config.custom_script.as_deref().ok_or_else(|| {
                SeqflowError::BackendUnavailable {
                    backend: "custom".into(),
                    reason: "no custom_script configured".into(),
                }
            })?;
            if !script.exists() {
                return Err(SeqflowError::BackendUnavailable {
                    backend: "custom".into(),
                    reason: format!("script '{}' does not exist", script.display()),
                });
            }
            Ok(())
        }
        BackendKind::Lsf => {
            for binary in ["bsub", "bkill"] {
                which::which(binary).map_err(|_| SeqflowError::BackendUnavailable {
                    backend: "lsf".into(),
                    reason: format!("'{}' not found in PATH", binary),
                })?;
            }
            Ok(())
        }
    }
}

/// Result of running one command to completion
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Driver-assigned job id
    pub id: String,
    /// The command's exit code
    pub exit_code: i32,
    /// Captured stdout, where the backend records it
    pub stdout: String,
    /// Captured stderr, where the backend records it
    pub stderr: String,
}

/// Runs stage commands through the configured backend.
///
/// Allocates job ids, wires the global gate through to executors and reads
/// back any output the backend captured into the job directory.
pub struct CommandDispatcher {
    config: Arc<RunConfig>,
    workdir: PathBuf,
    gate: ConcurrencyGate,
    counter: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(config: Arc<RunConfig>, workdir: impl Into<PathBuf>) -> Self {
        ConcurrencyGate::init_global(config.concurrency);

        Self {
            config,
            workdir: workdir.into(),
            gate: ConcurrencyGate::global(),
            counter: AtomicU64::new(0),
        }
    }

    /// Dispatcher bound to a private gate. Test seam.
    pub fn with_gate(config: Arc<RunConfig>, workdir: impl Into<PathBuf>, gate: ConcurrencyGate) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            gate,
            counter: AtomicU64::new(0),
        }
    }

    /// Run one command to completion and return its outcome.
    pub async fn dispatch(&self, name: &str, command: &str) -> SeqflowResult<CommandOutcome> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}_{}", sanitize_id(name), seq);

        let job_name = self
            .config
            .resources
            .jobname
            .clone()
            .unwrap_or_else(|| name.to_string());

        let job = JobRequest::new(
            &self.workdir,
            &id,
            job_name,
            command,
            self.config.resources.clone(),
        );

        debug!(job = %id, backend = %self.config.backend, "dispatching command");

        let mut executor = create_executor(&self.config, self.gate.clone())?;
        executor.start(&job).await?;

        let waited = executor.wait_for().await;
        executor.cleanup().await;
        let exit_code = waited?;

        let (stdout, stderr) = read_captured(&job.job_dir, executor.ignorable_outputs());

        Ok(CommandOutcome {
            id,
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Read back `cmd.out`/`cmd.err` from the job directory, dropping lines the
/// backend marked as its own chatter.
fn read_captured(job_dir: &Path, ignorable: Option<Vec<String>>) -> (String, String) {
    let patterns: Vec<regex::Regex> = ignorable
        .unwrap_or_default()
        .iter()
        .filter_map(|p| regex::Regex::new(p).ok())
        .collect();

    let read = |file: &str| -> String {
        let content = std::fs::read_to_string(job_dir.join(file)).unwrap_or_default();
        if patterns.is_empty() {
            return content;
        }
        content
            .lines()
            .filter(|line| !patterns.iter().any(|p| p.is_match(line)))
            .map(|line| format!("{}\n", line))
            .collect()
    };

    (read("cmd.out"), read("cmd.err"))
}

fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_str() {
        assert_eq!("RUNNING".parse::<CommandStatus>().unwrap(), CommandStatus::Running);
        assert_eq!("COMPLETE".parse::<CommandStatus>().unwrap(), CommandStatus::Complete);
        assert!("FINISHED".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn test_job_request_dir_layout() {
        let job = JobRequest::new("/work", "align_1", "align", "true", ResourceRequest::default());
        assert_eq!(
            job.job_dir,
            PathBuf::from("/work/.seqflow/commandtmp/align_1")
        );
    }

    #[tokio::test]
    async fn test_dispatch_local_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Arc::new(RunConfig::default());
        let dispatcher =
            CommandDispatcher::with_gate(config, dir.path(), ConcurrencyGate::new(2));

        let outcome = dispatcher.dispatch("hello", "echo hi").await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.id, "hello_1");
        assert!(outcome.stdout.contains("hi"));

        let outcome = dispatcher.dispatch("hello", "exit 3").await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.id, "hello_2");
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Local backend
//!
//! Runs commands directly on this host through `bash -c`. Output is
//! captured to `cmd.out`/`cmd.err` in the job directory so failures can be
//! reported with the command's own words.
//!
//! The gate permit is held for the whole life of the child process; a local
//! job occupies a slot on this machine until it exits.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::{CommandExecutor, CommandStatus, ConcurrencyGate, JobRequest};
use crate::errors::{SeqflowError, SeqflowResult};

/// Direct execution on the driver host
pub struct LocalExecutor {
    gate: ConcurrencyGate,
    child: Option<Child>,
    permit: Option<OwnedSemaphorePermit>,
    command: String,
    exit_code: Option<i32>,
}

impl LocalExecutor {
    pub fn new(gate: ConcurrencyGate) -> Self {
        Self {
            gate,
            child: None,
            permit: None,
            command: String::new(),
            exit_code: None,
        }
    }

    fn record_exit(&mut self, status: std::process::ExitStatus) -> i32 {
        let code = status.code().unwrap_or(-1);
        self.exit_code = Some(code);
        self.permit = None;
        code
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn start(&mut self, job: &JobRequest) -> SeqflowResult<()> {
        let permit = self.gate.acquire().await?;
        job.create_job_dir()?;
        self.command = job.command.clone();

        let stdout = std::fs::File::create(job.job_dir.join("cmd.out")).map_err(|e| {
            SeqflowError::FileWriteError {
                path: job.job_dir.join("cmd.out"),
                error: e.to_string(),
            }
        })?;
        let stderr = std::fs::File::create(job.job_dir.join("cmd.err")).map_err(|e| {
            SeqflowError::FileWriteError {
                path: job.job_dir.join("cmd.err"),
                error: e.to_string(),
            }
        })?;

        let child = Command::new("bash")
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| SeqflowError::StartFailed {
                backend: "local".into(),
                command: job.command.clone(),
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
            })?;

        debug!(job = %job.id, pid = child.id(), "started local command");

        self.child = Some(child);
        self.permit = Some(permit);
        Ok(())
    }

    async fn status(&mut self) -> SeqflowResult<CommandStatus> {
        if self.exit_code.is_some() {
            return Ok(CommandStatus::Complete);
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(CommandStatus::Unknown);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                Ok(CommandStatus::Complete)
            }
            Ok(None) => Ok(CommandStatus::Running),
            Err(_) => Ok(CommandStatus::Unknown),
        }
    }

    async fn wait_for(&mut self) -> SeqflowResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        let Some(child) = self.child.as_mut() else {
            return Err(SeqflowError::Internal {
                message: "wait_for called before start".into(),
            });
        };

        match child.wait().await {
            Ok(status) => Ok(self.record_exit(status)),
            Err(e) => {
                self.permit = None;
                Err(SeqflowError::Io {
                    message: format!("waiting for '{}': {}", self.command, e),
                })
            }
        }
    }

    async fn stop(&mut self) -> SeqflowResult<()> {
        if let Some(child) = self.child.as_mut() {
            // Already-exited children are not an error
            let _ = child.start_kill();
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.permit = None;
        self.child = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceRequest;
    use tempfile::TempDir;

    fn job(dir: &TempDir, id: &str, command: &str) -> JobRequest {
        JobRequest::new(dir.path(), id, "test", command, ResourceRequest::default())
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let dir = TempDir::new().unwrap();
        let mut exec = LocalExecutor::new(ConcurrencyGate::new(1));

        exec.start(&job(&dir, "t_1", "echo hello")).await.unwrap();
        assert_eq!(exec.wait_for().await.unwrap(), 0);

        let out =
            std::fs::read_to_string(dir.path().join(".seqflow/commandtmp/t_1/cmd.out")).unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = TempDir::new().unwrap();
        let mut exec = LocalExecutor::new(ConcurrencyGate::new(1));

        exec.start(&job(&dir, "t_1", "exit 7")).await.unwrap();
        assert_eq!(exec.wait_for().await.unwrap(), 7);

        // Completed status and repeated waits stay stable
        assert_eq!(exec.status().await.unwrap(), CommandStatus::Complete);
        assert_eq!(exec.wait_for().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_permit_released_on_completion() {
        let dir = TempDir::new().unwrap();
        let gate = ConcurrencyGate::new(1);
        let mut exec = LocalExecutor::new(gate.clone());

        exec.start(&job(&dir, "t_1", "true")).await.unwrap();
        assert_eq!(gate.available(), 0);

        exec.wait_for().await.unwrap();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut exec = LocalExecutor::new(ConcurrencyGate::new(1));

        exec.start(&job(&dir, "t_1", "sleep 30")).await.unwrap();
        exec.stop().await.unwrap();
        exec.stop().await.unwrap();

        let code = exec.wait_for().await.unwrap();
        assert_ne!(code, 0);
        exec.cleanup().await;
    }

    #[tokio::test]
    async fn test_status_before_start_is_unknown() {
        let mut exec = LocalExecutor::new(ConcurrencyGate::new(1));
        assert_eq!(exec.status().await.unwrap(), CommandStatus::Unknown);
    }
}

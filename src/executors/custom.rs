// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Custom-script backend
//!
//! Delegates job control to a user-provided shell script spoken to over a
//! three-verb stdio protocol:
//!
//! - `<script> start` with the job described in environment variables
//!   (`NAME`, `JOBDIR`, `COMMAND`, plus any resource keys). On success the
//!   script prints the backend-assigned job id to stdout.
//! - `<script> status <id>` prints `QUEUEING`, `RUNNING`, `UNKNOWN`, or
//!   `COMPLETE <exit code>`.
//! - `<script> stop <id>` ends the job.
//!
//! Status failures are transient and retried; stop failures whose stderr
//! shows the job is already gone are accepted.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::poll::{PollSchedule, PollTuning, MAX_STATUS_ERRORS, STATUS_RETRY_GAP};
use super::{CommandExecutor, CommandStatus, ConcurrencyGate, JobRequest};
use crate::errors::{SeqflowError, SeqflowResult};

/// stderr substrings from `stop` that mean the job already finished
const BENIGN_STOP_MARKERS: &[&str] = &["Unknown Job Id", "invalid state for job - COMPLETE"];

/// Backend driven by a user-provided control script
pub struct CustomScriptExecutor {
    script: PathBuf,
    tuning: PollTuning,
    gate: ConcurrencyGate,
    job_id: Option<String>,
    exit_code: Option<i32>,
}

impl CustomScriptExecutor {
    pub fn new(script: impl Into<PathBuf>, tuning: PollTuning, gate: ConcurrencyGate) -> Self {
        Self {
            script: script.into(),
            tuning,
            gate,
            job_id: None,
            exit_code: None,
        }
    }

    fn start_command_line(&self) -> String {
        format!("{} start", self.script.display())
    }

    /// One `status` invocation. Any failure here is transient; the caller
    /// counts consecutive failures.
    async fn query_status(&mut self) -> SeqflowResult<CommandStatus> {
        let Some(id) = self.job_id.clone() else {
            return Ok(CommandStatus::Unknown);
        };

        let output = {
            let _permit = self.gate.acquire().await?;
            Command::new(&self.script)
                .arg("status")
                .arg(&id)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| SeqflowError::Io {
                    message: format!("running '{} status {}': {}", self.script.display(), id, e),
                })?
        };

        if !output.status.success() {
            return Err(SeqflowError::Internal {
                message: format!(
                    "'{} status {}' exited with {}",
                    self.script.display(),
                    id,
                    output.status.code().unwrap_or(-1)
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tokens = stdout.split_whitespace();

        let status: CommandStatus = tokens
            .next()
            .ok_or_else(|| SeqflowError::Internal {
                message: format!("'{} status {}' printed nothing", self.script.display(), id),
            })?
            .parse()?;

        if status == CommandStatus::Complete {
            let code = tokens
                .next()
                .and_then(|t| t.parse::<i32>().ok())
                .ok_or_else(|| SeqflowError::Internal {
                    message: format!(
                        "'{} status {}' reported COMPLETE without an exit code",
                        self.script.display(),
                        id
                    ),
                })?;
            self.exit_code = Some(code);
        }

        Ok(status)
    }
}

#[async_trait]
impl CommandExecutor for CustomScriptExecutor {
    async fn start(&mut self, job: &JobRequest) -> SeqflowResult<()> {
        job.create_job_dir()?;

        let mut cmd = Command::new(&self.script);
        cmd.arg("start")
            .stdin(Stdio::null())
            .current_dir(&job.workdir)
            .env("NAME", &job.name)
            .env("JOBDIR", &job.job_dir)
            .env("COMMAND", &job.command);

        let r = &job.resources;
        if let Some(account) = &r.account {
            cmd.env("ACCOUNT", account);
        }
        if let Some(walltime) = &r.walltime {
            cmd.env("WALLTIME", walltime);
        }
        if let Some(memory) = &r.memory {
            cmd.env("MEMORY", memory);
        }
        if let Some(procs) = r.procs {
            cmd.env("PROCS", procs.to_string());
        }
        if let Some(queue) = &r.queue {
            cmd.env("QUEUE", queue);
        }

        let output = {
            let _permit = self.gate.acquire().await?;
            cmd.output().await.map_err(|e| SeqflowError::StartFailed {
                backend: "custom".into(),
                command: self.start_command_line(),
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
            })?
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(SeqflowError::StartFailed {
                backend: "custom".into(),
                command: self.start_command_line(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(SeqflowError::StartFailed {
                backend: "custom".into(),
                command: self.start_command_line(),
                exit_code: 0,
                stdout,
                stderr: "script exited successfully but printed no job id".into(),
            });
        }

        debug!(job = %job.id, backend_id = %id, "custom script accepted job");
        self.job_id = Some(id);
        Ok(())
    }

    async fn status(&mut self) -> SeqflowResult<CommandStatus> {
        if self.exit_code.is_some() {
            return Ok(CommandStatus::Complete);
        }
        self.query_status().await
    }

    async fn wait_for(&mut self) -> SeqflowResult<i32> {
        let id = self.job_id.clone().ok_or_else(|| SeqflowError::Internal {
            message: "wait_for called before start".into(),
        })?;

        let schedule = PollSchedule::start(self.tuning);
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.status().await {
                Ok(CommandStatus::Complete) => {
                    return Ok(self.exit_code.unwrap_or(-1));
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    schedule.pause().await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(job = %id, attempt = consecutive_errors, "status query failed: {}", e);

                    if consecutive_errors >= MAX_STATUS_ERRORS {
                        return Err(SeqflowError::StatusFailed {
                            id,
                            attempts: consecutive_errors,
                            message: e.to_string(),
                        });
                    }
                    tokio::time::sleep(STATUS_RETRY_GAP).await;
                }
            }
        }
    }

    async fn stop(&mut self) -> SeqflowResult<()> {
        let Some(id) = self.job_id.clone() else {
            return Ok(());
        };

        let mut last_failure = String::new();

        for _ in 0..MAX_STATUS_ERRORS {
            let result = {
                let _permit = self.gate.acquire().await?;
                Command::new(&self.script)
                    .arg("stop")
                    .arg(&id)
                    .stdin(Stdio::null())
                    .output()
                    .await
            };

            match result {
                Err(e) => last_failure = e.to_string(),
                Ok(output) => {
                    if output.status.success() {
                        return Ok(());
                    }

                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if BENIGN_STOP_MARKERS.iter().any(|m| stderr.contains(m)) {
                        return Ok(());
                    }

                    last_failure = format!(
                        "exit {}: {}",
                        output.status.code().unwrap_or(-1),
                        stderr.trim()
                    );
                }
            }

            tokio::time::sleep(STATUS_RETRY_GAP).await;
        }

        Err(SeqflowError::StopFailed {
            id,
            message: last_failure,
        })
    }

    async fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceRequest;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fast_tuning() -> PollTuning {
        PollTuning {
            min_ms: 1,
            max_ms: 5,
            backoff_period_ms: 50,
        }
    }

    fn write_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("backend.sh");
        std::fs::write(&path, format!("#!/bin/bash\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn job(dir: &TempDir, command: &str) -> JobRequest {
        let mut resources = ResourceRequest::default();
        resources.queue = Some("short".into());
        JobRequest::new(dir.path(), "stage_1", "stage", command, resources)
    }

    fn executor(script: PathBuf) -> CustomScriptExecutor {
        CustomScriptExecutor::new(script, fast_tuning(), ConcurrencyGate::new(1))
    }

    #[tokio::test]
    async fn test_start_parses_job_id() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, r#"[ "$1" = start ] && echo "J42""#);

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();
        assert_eq!(exec.job_id.as_deref(), Some("J42"));
    }

    #[tokio::test]
    async fn test_start_failure_carries_output() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, r#"echo "queue is down" >&2; exit 3"#);

        let err = executor(script).start(&job(&dir, "true")).await.unwrap_err();
        match err {
            SeqflowError::StartFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("queue is down"));
            }
            other => panic!("expected StartFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_without_id_is_failure() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "exit 0");

        let err = executor(script).start(&job(&dir, "true")).await.unwrap_err();
        assert!(matches!(err, SeqflowError::StartFailed { .. }));
    }

    #[tokio::test]
    async fn test_environment_contract() {
        let dir = TempDir::new().unwrap();
        let env_dump = dir.path().join("env.txt");
        let script = write_script(
            &dir,
            &format!(
                r#"if [ "$1" = start ]; then
  echo "NAME=$NAME COMMAND=$COMMAND QUEUE=$QUEUE JOBDIR=$JOBDIR" > {}
  echo "J1"
fi"#,
                env_dump.display()
            ),
        );

        executor(script)
            .start(&job(&dir, "samtools index x.bam"))
            .await
            .unwrap();

        let dump = std::fs::read_to_string(&env_dump).unwrap();
        assert!(dump.contains("NAME=stage"));
        assert!(dump.contains("COMMAND=samtools index x.bam"));
        assert!(dump.contains("QUEUE=short"));
        assert!(dump.contains("commandtmp/stage_1"));
    }

    #[tokio::test]
    async fn test_wait_for_polls_until_complete() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("count");
        let script = write_script(
            &dir,
            &format!(
                r#"case "$1" in
  start) echo "J42";;
  status)
    n=$(cat {c} 2>/dev/null || echo 0)
    n=$((n+1))
    echo "$n" > {c}
    if [ "$n" -le 3 ]; then echo "RUNNING"; else echo "COMPLETE 0"; fi
    ;;
esac"#,
                c = counter.display()
            ),
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();
        assert_eq!(exec.wait_for().await.unwrap(), 0);

        // Three RUNNING polls plus the COMPLETE one
        let polls: u32 = std::fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_wait_for_reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            r#"case "$1" in
  start) echo "J9";;
  status) echo "COMPLETE 17";;
esac"#,
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "false")).await.unwrap();
        assert_eq!(exec.wait_for().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_transient_status_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("count");
        let script = write_script(
            &dir,
            &format!(
                r#"case "$1" in
  start) echo "J1";;
  status)
    n=$(cat {c} 2>/dev/null || echo 0)
    n=$((n+1))
    echo "$n" > {c}
    if [ "$n" -le 3 ]; then exit 1; fi
    echo "COMPLETE 0"
    ;;
esac"#,
                c = counter.display()
            ),
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();

        // Three failures, then success: the wait recovers
        assert_eq!(exec.wait_for().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_four_consecutive_status_failures_fail_hard() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            r#"case "$1" in
  start) echo "J1";;
  status) exit 1;;
esac"#,
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();

        match exec.wait_for().await.unwrap_err() {
            SeqflowError::StatusFailed { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected StatusFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_accepts_already_finished() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            r#"case "$1" in
  start) echo "J1";;
  stop) echo "Unknown Job Id" >&2; exit 255;;
esac"#,
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();
        exec.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_failure_is_fatal_after_retries() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            r#"case "$1" in
  start) echo "J1";;
  stop) echo "scheduler melted" >&2; exit 1;;
esac"#,
        );

        let mut exec = executor(script);
        exec.start(&job(&dir, "true")).await.unwrap();

        match exec.stop().await.unwrap_err() {
            SeqflowError::StopFailed { message, .. } => {
                assert!(message.contains("scheduler melted"));
            }
            other => panic!("expected StopFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "exit 1");
        executor(script).stop().await.unwrap();
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! LSF batch scheduler backend
//!
//! Wraps the user command in a `cmd.sh` script that records the exit code
//! to `cmd.exit` and the command's stdout to `cmd.out`, then submits it
//! with `bsub`. Because compute nodes share the filesystem with the head
//! node, job state is derived from those files rather than from scheduler
//! queries: `cmd.exit` appearing means the job is done.
//!
//! Output forwarders stream `cmd.out` and `cmd.err` into the driver's own
//! stdio while the job runs; they are cancelled (after a final drain) on
//! `cleanup`.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::poll::{PollSchedule, PollTuning, MAX_STATUS_ERRORS, STATUS_RETRY_GAP};
use super::{CommandExecutor, CommandStatus, ConcurrencyGate, JobRequest};
use crate::errors::{SeqflowError, SeqflowResult};

/// The scheduler's submission announcement, e.g.
/// `Job <12345> is submitted to queue normal.`
const SUBMIT_ID_PATTERN: &str = r"Job <(\d+)> is submitted";

/// stderr substrings from `bkill` that mean the job is already gone
const BENIGN_KILL_MARKERS: &[&str] = &["already finished", "No matching job found"];

/// Attempts to re-read a `cmd.exit` whose content is not yet a valid integer
const EXIT_PARSE_RETRIES: u32 = 10;
const EXIT_PARSE_GAP: Duration = Duration::from_millis(500);

/// LSF batch scheduler backend
pub struct LsfExecutor {
    tuning: PollTuning,
    gate: ConcurrencyGate,
    submit_cmd: String,
    kill_cmd: String,
    job_dir: Option<PathBuf>,
    lsf_id: Option<String>,
    exit_code: Option<i32>,
    forwarders: Vec<OutputForwarder>,
}

impl LsfExecutor {
    pub fn new(tuning: PollTuning, gate: ConcurrencyGate) -> Self {
        Self::with_commands(tuning, gate, "bsub", "bkill")
    }

    /// Use site-specific submit/kill commands instead of `bsub`/`bkill`.
    pub fn with_commands(
        tuning: PollTuning,
        gate: ConcurrencyGate,
        submit_cmd: impl Into<String>,
        kill_cmd: impl Into<String>,
    ) -> Self {
        Self {
            tuning,
            gate,
            submit_cmd: submit_cmd.into(),
            kill_cmd: kill_cmd.into(),
            job_dir: None,
            lsf_id: None,
            exit_code: None,
            forwarders: Vec::new(),
        }
    }

    fn wrapper_script(command: &str, job_dir: &Path) -> String {
        format!(
            "#!/bin/bash\n\
             ( {command} ) > {out}\n\
             result=$?\n\
             echo $result > {exit}\n\
             exit $result\n",
            command = command,
            out = job_dir.join("cmd.out").display(),
            exit = job_dir.join("cmd.exit").display(),
        )
    }

    /// Read `cmd.exit`, re-reading a few times if the content is not yet a
    /// complete integer (the scheduler may still be flushing it).
    async fn read_exit_code(&self, exit_file: &Path) -> i32 {
        for _ in 0..EXIT_PARSE_RETRIES {
            if let Ok(content) = tokio::fs::read_to_string(exit_file).await {
                if let Ok(code) = content.trim().parse::<i32>() {
                    return code;
                }
            }
            tokio::time::sleep(EXIT_PARSE_GAP).await;
        }

        warn!(file = %exit_file.display(), "exit file never contained a valid integer");
        -1
    }
}

#[async_trait]
impl CommandExecutor for LsfExecutor {
    async fn start(&mut self, job: &JobRequest) -> SeqflowResult<()> {
        job.create_job_dir()?;
        self.job_dir = Some(job.job_dir.clone());

        let script_path = job.job_dir.join("cmd.sh");
        std::fs::write(&script_path, Self::wrapper_script(&job.command, &job.job_dir)).map_err(
            |e| SeqflowError::FileWriteError {
                path: script_path.clone(),
                error: e.to_string(),
            },
        )?;

        let err_path = job.job_dir.join("cmd.err");

        let mut submit = Command::new(&self.submit_cmd);
        submit.arg("-J").arg(&job.name);
        if let Some(queue) = &job.resources.queue {
            submit.arg("-q").arg(queue);
        }
        if let Some(account) = &job.resources.account {
            submit.arg("-P").arg(account);
        }
        if let Some(walltime) = &job.resources.walltime {
            submit.arg("-W").arg(walltime);
        }
        if let Some(memory) = &job.resources.memory {
            submit.arg("-M").arg(memory);
        }
        if let Some(procs) = job.resources.procs {
            submit.arg("-n").arg(procs.to_string());
        }

        let command_line = format!("{} < {}", self.submit_cmd, script_path.display());

        let script_file = std::fs::File::open(&script_path).map_err(|e| {
            SeqflowError::FileReadError {
                path: script_path.clone(),
                error: e.to_string(),
            }
        })?;
        let err_file = std::fs::File::create(&err_path).map_err(|e| {
            SeqflowError::FileWriteError {
                path: err_path.clone(),
                error: e.to_string(),
            }
        })?;

        let output = {
            let _permit = self.gate.acquire().await?;
            submit
                .current_dir(&job.workdir)
                .stdin(Stdio::from(script_file))
                .stdout(Stdio::piped())
                .stderr(Stdio::from(err_file))
                .output()
                .await
                .map_err(|e| SeqflowError::StartFailed {
                    backend: "lsf".into(),
                    command: command_line.clone(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                })?
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = std::fs::read_to_string(&err_path).unwrap_or_default();

        if !output.status.success() {
            return Err(SeqflowError::StartFailed {
                backend: "lsf".into(),
                command: command_line,
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        let id = parse_submit_id(&stdout).ok_or_else(|| SeqflowError::StartFailed {
            backend: "lsf".into(),
            command: command_line,
            exit_code: 0,
            stdout: stdout.clone(),
            stderr: "could not parse a job id from the submission output".into(),
        })?;

        debug!(job = %job.id, lsf_id = %id, "job submitted");
        self.lsf_id = Some(id);

        self.forwarders
            .push(OutputForwarder::spawn(job.job_dir.join("cmd.out"), false));
        self.forwarders
            .push(OutputForwarder::spawn(err_path, true));

        Ok(())
    }

    async fn status(&mut self) -> SeqflowResult<CommandStatus> {
        let Some(job_dir) = &self.job_dir else {
            return Ok(CommandStatus::Unknown);
        };
        if !job_dir.join("cmd.sh").exists() {
            return Ok(CommandStatus::Unknown);
        }
        if self.lsf_id.is_none() {
            return Ok(CommandStatus::Queueing);
        }
        if !job_dir.join("cmd.exit").exists() {
            return Ok(CommandStatus::Running);
        }
        Ok(CommandStatus::Complete)
    }

    async fn wait_for(&mut self) -> SeqflowResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        let job_dir = self.job_dir.clone().ok_or_else(|| SeqflowError::Internal {
            message: "wait_for called before start".into(),
        })?;
        let exit_file = job_dir.join("cmd.exit");

        let schedule = PollSchedule::start(self.tuning);
        while !exit_file.exists() {
            schedule.pause().await;
        }

        let code = self.read_exit_code(&exit_file).await;
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn stop(&mut self) -> SeqflowResult<()> {
        let Some(id) = self.lsf_id.clone() else {
            return Ok(());
        };

        let mut last_failure = String::new();

        for _ in 0..MAX_STATUS_ERRORS {
            let result = {
                let _permit = self.gate.acquire().await?;
                Command::new(&self.kill_cmd).arg(&id).output().await
            };

            match result {
                Err(e) => last_failure = e.to_string(),
                Ok(output) => {
                    if output.status.success() {
                        return Ok(());
                    }

                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if BENIGN_KILL_MARKERS.iter().any(|m| stderr.contains(m)) {
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

    async fn cleanup(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.finish().await;
        }
    }

    fn ignorable_outputs(&self) -> Option<Vec<String>> {
        Some(vec![SUBMIT_ID_PATTERN.to_string()])
    }
}

fn parse_submit_id(stdout: &str) -> Option<String> {
    // The pattern is a constant; compilation cannot fail
    let re = Regex::new(SUBMIT_ID_PATTERN).ok()?;
    re.captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Streams a growing file into the driver's stdout or stderr.
struct OutputForwarder {
    path: PathBuf,
    offset: Arc<AtomicU64>,
    to_stderr: bool,
    handle: JoinHandle<()>,
}

impl OutputForwarder {
    fn spawn(path: PathBuf, to_stderr: bool) -> Self {
        let offset = Arc::new(AtomicU64::new(0));

        let handle = {
            let path = path.clone();
            let offset = offset.clone();
            tokio::spawn(async move {
                loop {
                    drain(&path, &offset, to_stderr).await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
        };

        Self {
            path,
            offset,
            to_stderr,
            handle,
        }
    }

    /// Cancel the background task and flush anything not yet forwarded.
    async fn finish(self) {
        self.handle.abort();
        let _ = self.handle.await;
        drain(&self.path, &self.offset, self.to_stderr).await;
    }
}

async fn drain(path: &Path, offset: &AtomicU64, to_stderr: bool) {
    let Ok(data) = tokio::fs::read(path).await else {
        return;
    };

    let seen = offset.load(Ordering::SeqCst) as usize;
    if data.len() <= seen {
        return;
    }

    let text = String::from_utf8_lossy(&data[seen..]);
    if to_stderr {
        eprint!("{}", text);
    } else {
        print!("{}", text);
    }
    offset.store(data.len() as u64, Ordering::SeqCst);
}

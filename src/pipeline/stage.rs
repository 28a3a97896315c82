// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Stage definitions and the stage driver
//!
//! A stage is a name plus a user-supplied async body run against a
//! [`PipelineContext`]. The body issues commands through the runtime; after
//! it returns, the driver validates the declared outputs and persists a
//! metadata record for everything the commands actually produced.

use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::errors::{SeqflowError, SeqflowResult};
use crate::executors::CommandDispatcher;
use crate::graph::DependencyGraph;
use crate::meta::{mtime_ms, normalize_path, now_ms, MetaStore, OutputMeta};
use crate::pipeline::branch::StageRecord;
use crate::pipeline::context::PipelineContext;

/// A stage body: async user code over the context and runtime
pub type StageBody = Arc<
    dyn for<'a> Fn(&'a mut PipelineContext, &'a StageRuntime) -> BoxFuture<'a, SeqflowResult<()>>
        + Send
        + Sync,
>;

/// A named unit of work producing outputs from its inputs
#[derive(Clone)]
pub struct StageDef {
    pub name: String,
    pub body: StageBody,
}

impl StageDef {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut PipelineContext, &'a StageRuntime) -> BoxFuture<'a, SeqflowResult<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

impl std::fmt::Debug for StageDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDef").field("name", &self.name).finish()
    }
}

/// Shared services stage bodies run against
pub struct StageRuntime {
    workdir: PathBuf,
    config: Arc<RunConfig>,
    dispatcher: CommandDispatcher,
    store: MetaStore,
}

impl StageRuntime {
    pub fn new(config: Arc<RunConfig>, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            dispatcher: CommandDispatcher::new(config.clone(), &workdir),
            store: MetaStore::new(&workdir),
            config,
            workdir,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    /// Run a command that produces the given outputs.
    ///
    /// The command is skipped when the dependency graph shows every output
    /// current with respect to the stage's inputs; the tracked outputs
    /// still flow onward so downstream stages resolve them. A non-zero
    /// exit is a stage failure carrying the captured output.
    pub async fn exec(
        &self,
        ctx: &mut PipelineContext,
        command: &str,
        outputs: &[String],
    ) -> SeqflowResult<()> {
        ctx.track(command, outputs, &self.workdir);

        // The staleness query treats unrecorded outputs leniently, so a
        // never-built output must force the command regardless
        let mut all_known = true;
        for output in outputs {
            if !self.store.resolve(Path::new(output)).exists()
                && self.store.record_for(output)?.is_none()
            {
                all_known = false;
                break;
            }
        }

        if all_known {
            let graph = DependencyGraph::build(self.store.scan()?, &self.workdir)?;
            if graph.check_up_to_date(outputs, &ctx.input) {
                info!(
                    stage = %ctx.stage_name,
                    "outputs up to date, skipping: {}",
                    command
                );
                return Ok(());
            }
        }

        let outcome = self.dispatcher.dispatch(&ctx.stage_name, command).await?;

        if outcome.exit_code != 0 {
            return Err(SeqflowError::StageFailed {
                stage: ctx.stage_name.clone(),
                job_id: Some(outcome.id),
                command: command.to_string(),
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            });
        }

        Ok(())
    }
}

/// Stable hash identifying a (command, output) pair across runs.
pub fn fingerprint(command: &str, output: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(command.as_bytes());
    hasher.update(b"_");
    hasher.update(output.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run one stage body and perform the driver's bookkeeping.
pub(crate) async fn run_stage(
    def: &StageDef,
    runtime: &StageRuntime,
    branch: &str,
    inputs: Vec<String>,
) -> SeqflowResult<StageRecord> {
    debug!(stage = %def.name, branch = %branch, "running stage");

    let mut ctx = PipelineContext::new(&def.name, branch, inputs);
    (def.body)(&mut ctx, runtime).await?;
    finalize_stage(ctx, runtime)
}

/// Post-body bookkeeping: validate outputs, persist metadata, settle what
/// flows to the next stage.
fn finalize_stage(ctx: PipelineContext, runtime: &StageRuntime) -> SeqflowResult<StageRecord> {
    let store = runtime.store();

    // Every declared output must exist, or carry a record explaining why
    // it is allowed to be absent
    for output in &ctx.output {
        if store.resolve(Path::new(output)).exists() {
            continue;
        }
        let explained = store
            .record_for(output)?
            .map(|record| record.cleaned)
            .unwrap_or(false);
        if !explained {
            return Err(SeqflowError::MissingOutput {
                stage: ctx.stage_name.clone(),
                path: output.clone(),
            });
        }
    }

    for (command, outputs) in &ctx.tracked_outputs {
        for output in outputs {
            let resolved = store.resolve(Path::new(output));
            let current_mtime = mtime_ms(&resolved);

            // An output whose mtime is unchanged since before the command
            // (including one still absent under a cleaned record) was not
            // produced by this stage; keep the existing record
            let untouched = ctx.pre_run_mtime(output) == Some(current_mtime);
            if untouched && store.record_for(output)?.is_some() {
                continue;
            }

            let mut meta = OutputMeta::new(output);
            meta.output_path = normalize_path(Path::new(output));
            meta.inputs = ctx.input.clone();
            meta.command = command.clone();
            meta.fingerprint = fingerprint(command, output);
            meta.timestamp = current_mtime.unwrap_or_else(now_ms);
            store.save(&meta)?;
        }
    }

    let next_inputs = ctx.next_inputs.clone();
    Ok(StageRecord {
        stage_name: ctx.stage_name,
        branch: ctx.branch,
        input: ctx.input,
        output: ctx.output,
        raw_output: ctx.raw_output,
        next_inputs,
        joiner: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::ConcurrencyGate;
    use tempfile::TempDir;

    fn runtime(dir: &TempDir) -> StageRuntime {
        let config = Arc::new(RunConfig::default());
        StageRuntime {
            dispatcher: CommandDispatcher::with_gate(
                config.clone(),
                dir.path(),
                ConcurrencyGate::new(2),
            ),
            store: MetaStore::new(dir.path()),
            config,
            workdir: dir.path().to_path_buf(),
        }
    }

    fn echo_stage(name: &str, output: &'static str) -> StageDef {
        StageDef::new(name, move |ctx, rt| {
            Box::pin(async move {
                let command = format!("echo content > {}", output);
                rt.exec(ctx, &command, &[output.to_string()]).await
            })
        })
    }

    #[test]
    fn test_fingerprint_depends_only_on_bytes() {
        let a = fingerprint("sort x.bam", "x.sorted.bam");
        let b = fingerprint("sort x.bam", "x.sorted.bam");
        assert_eq!(a, b);

        assert_ne!(a, fingerprint("sort y.bam", "x.sorted.bam"));
        assert_ne!(a, fingerprint("sort x.bam", "y.sorted.bam"));
    }

    #[tokio::test]
    async fn test_stage_produces_output_and_record() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        let record = run_stage(
            &echo_stage("write", "out.txt"),
            &rt,
            "",
            vec!["in.txt".into()],
        )
        .await
        .unwrap();

        assert!(dir.path().join("out.txt").exists());
        assert_eq!(record.output, vec!["out.txt"]);
        assert_eq!(record.next_or_output(), vec!["out.txt"]);

        let meta = rt.store().record_for("out.txt").unwrap().unwrap();
        assert_eq!(meta.inputs, vec!["in.txt"]);
        assert_eq!(meta.command, "echo content > out.txt");
        assert_eq!(meta.fingerprint, fingerprint(&meta.command, "out.txt"));
    }

    #[tokio::test]
    async fn test_missing_output_is_fatal() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        let lying = StageDef::new("lying", |ctx, rt| {
            Box::pin(async move {
                rt.exec(ctx, "true", &["never_made.txt".to_string()]).await
            })
        });

        match run_stage(&lying, &rt, "", vec![]).await.unwrap_err() {
            SeqflowError::MissingOutput { path, stage } => {
                assert_eq!(path, "never_made.txt");
                assert_eq!(stage, "lying");
            }
            other => panic!("expected MissingOutput, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cleaned_record_explains_missing_output() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        // A cleaned, up-to-date record from an earlier run
        let mut meta = OutputMeta::new("cleaned.txt");
        meta.timestamp = 100;
        meta.cleaned = true;
        rt.store().save(&meta).unwrap();

        let quiet = StageDef::new("quiet", |ctx, rt| {
            Box::pin(async move { rt.exec(ctx, "true", &["cleaned.txt".to_string()]).await })
        });

        run_stage(&quiet, &rt, "", vec![]).await.unwrap();

        // The cleaned record survives untouched
        let meta = rt.store().record_for("cleaned.txt").unwrap().unwrap();
        assert!(meta.cleaned);
    }

    #[tokio::test]
    async fn test_untouched_preexisting_output_not_rerecorded() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        // First run writes the file and its record
        run_stage(&echo_stage("write", "out.txt"), &rt, "", vec![])
            .await
            .unwrap();
        let first = rt.store().record_for("out.txt").unwrap().unwrap();

        // A stage that tracks the output but leaves the file alone
        let noop = StageDef::new("noop", |ctx, rt| {
            Box::pin(async move { rt.exec(ctx, "true", &["out.txt".to_string()]).await })
        });
        run_stage(&noop, &rt, "", vec![]).await.unwrap();

        let second = rt.store().record_for("out.txt").unwrap().unwrap();
        assert_eq!(second.command, first.command);
    }

    #[tokio::test]
    async fn test_stage_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        let failing = StageDef::new("broken", |ctx, rt| {
            Box::pin(async move {
                rt.exec(
                    ctx,
                    "echo oh no >&2; exit 9",
                    &["wanted.txt".to_string()],
                )
                .await
            })
        });

        match run_stage(&failing, &rt, "", vec![]).await.unwrap_err() {
            SeqflowError::StageFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 9);
                assert!(stderr.contains("oh no"));
            }
            other => panic!("expected StageFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transparent_stage_passes_inputs_through() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir);

        let transparent = StageDef::new("check", |_ctx, _rt| Box::pin(async { Ok(()) }));
        let record = run_stage(&transparent, &rt, "", vec!["a.txt".into()])
            .await
            .unwrap();

        assert_eq!(record.next_or_output(), vec!["a.txt"]);
    }
}

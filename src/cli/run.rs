// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Run command - execute the pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::SeqflowError;
use crate::executors::check_backend;
use crate::pipeline::{Composer, PipelineDef, StageRuntime};

/// Run the pipeline
pub async fn run(pipeline_path: PathBuf, inputs: Vec<String>, verbose: bool) -> Result<()> {
    if !pipeline_path.exists() {
        return Err(SeqflowError::DefinitionNotFound {
            path: pipeline_path,
        }
        .into());
    }

    let def = PipelineDef::from_file(&pipeline_path)?;
    def.validate()?;
    check_backend(&def.config)?;

    let workdir = std::env::current_dir().map_err(|e| {
        miette::miette!("Failed to get current directory: {}", e)
    })?;

    let inputs = if inputs.is_empty() {
        def.resolve_inputs(&workdir)?
    } else {
        inputs
    };

    println!();
    println!("{}: {}", "Pipeline".bold(), def.name);
    println!("{}", "═".repeat(50));
    if verbose {
        println!("backend: {}", def.config.backend);
        println!("concurrency: {}", def.config.concurrency);
        if !inputs.is_empty() {
            println!("inputs: {}", inputs.join(", "));
        }
        println!();
    }

    let start = Instant::now();
    let node = def.to_node()?;
    let runtime = Arc::new(StageRuntime::new(Arc::new(def.config.clone()), &workdir));

    let pipeline = Composer::new(runtime).run(&node, &def.name, inputs).await?;

    for stage in pipeline.stages.iter().filter(|s| !s.joiner) {
        println!("  {} {}", "✓".green(), stage.stage_name.bold());
    }

    let duration = start.elapsed();
    println!();
    println!(
        "{}",
        format!(
            "Pipeline completed successfully in {:.2}s",
            duration.as_secs_f64()
        )
        .green()
    );

    let finals = pipeline
        .stages
        .last()
        .map(|s| s.next_or_output())
        .unwrap_or_default();
    if !finals.is_empty() {
        println!();
        println!("{}:", "Outputs".bold());
        for output in finals {
            println!("  - {}", output);
        }
    }

    Ok(())
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Graph command - render the recorded output dependency graph

use colored::Colorize;
use miette::Result;

use crate::cli::GraphFormat;
use crate::graph::DependencyGraph;
use crate::meta::MetaStore;

/// Show the dependency graph reconstructed from the metadata store
pub async fn run(format: GraphFormat, output: Option<String>, verbose: bool) -> Result<()> {
    let workdir = std::env::current_dir().map_err(|e| {
        miette::miette!("Failed to get current directory: {}", e)
    })?;

    let store = MetaStore::new(&workdir);
    let metas = store.scan()?;

    if metas.is_empty() {
        println!(
            "{}",
            "No output metadata recorded yet. Run a pipeline first.".dimmed()
        );
        return Ok(());
    }

    let graph = DependencyGraph::build(metas, &workdir)?;
    let graph = match output {
        Some(path) => graph.filter(&path).ok_or_else(|| {
            miette::miette!("No metadata recorded for output '{}'", path)
        })?,
        None => graph,
    };

    match format {
        GraphFormat::Text => print!("{}", graph.to_text()),
        GraphFormat::Dot => print!("{}", graph.to_dot()),
        GraphFormat::Mermaid => print!("{}", graph.to_mermaid()),
        GraphFormat::Json => {
            let records: Vec<serde_json::Value> = graph
                .entries()
                .map(|record| {
                    serde_json::json!({
                        "outputPath": record.output_path,
                        "inputs": record.inputs,
                        "command": record.command,
                        "timestamp": record.timestamp,
                        "preserve": record.preserve,
                        "cleaned": record.cleaned,
                        "upToDate": record.up_to_date,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&records).map_err(
                |e| miette::miette!("Failed to serialise graph: {}", e)
            )?);
        }
    }

    if verbose && format == GraphFormat::Text {
        let leaves = graph.leaves();
        println!();
        println!("{} ({}):", "Final outputs".bold(), leaves.len());
        for leaf in leaves {
            for value in &leaf.values {
                println!("  - {}", value.output_path);
            }
        }
    }

    Ok(())
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for seqflow.

pub mod graph;
pub mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pipeline runner for bioinformatics-style workflows
#[derive(Parser, Debug)]
#[clap(
    name = "seqflow",
    version,
    about = "Pipeline runner with file-dependency tracking and pluggable command backends",
    long_about = None,
    after_help = "Examples:\n\
        seqflow run                     Execute the pipeline in .seqflow.yaml\n\
        seqflow run -p calling.yaml     Execute a specific definition\n\
        seqflow graph                   Show the output dependency graph\n\
        seqflow graph -f dot            Render the graph as DOT\n\n\
        See 'seqflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run {
        /// Pipeline definition file
        #[clap(short, long, default_value = ".seqflow.yaml")]
        pipeline: PathBuf,

        /// Override the definition's starting inputs
        #[clap(short, long)]
        input: Vec<String>,
    },

    /// Show the recorded output dependency graph
    Graph {
        /// Output format
        #[clap(short, long, default_value = "text", value_enum)]
        format: GraphFormat,

        /// Restrict the graph to the lineage of one output
        #[clap(short, long)]
        output: Option<String>,
    },
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
    Json,
}

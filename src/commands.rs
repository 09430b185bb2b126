//! CLI command definitions
//!
//! Defines the clap commands for the dact CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a case file, or every *.case.yml under a directory
    Run {
        /// Path to a case file or directory
        path: PathBuf,

        /// Show step output and debug logging
        #[arg(long, short)]
        verbose: bool,

        /// Configuration file (default: dact.toml in the project root)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum steps of one stage running at the same time
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Only run cases carrying this tag (repeatable)
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,

        /// Write the results as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// List available tools
    #[command(name = "list-tools")]
    ListTools,

    /// List available scenarios
    #[command(name = "list-scenarios")]
    ListScenarios,

    /// Show a scenario's execution plan
    #[command(name = "show-scenario")]
    ShowScenario {
        /// Scenario name
        name: String,

        /// Print a Mermaid graph instead of stages
        #[arg(long)]
        mermaid: bool,
    },

    /// List cases with their scenario or tool
    #[command(name = "list-cases")]
    ListCases {
        /// Case file or directory (default: current directory)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

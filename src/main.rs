//! dact - scenario-driven tool pipelines
//!
//! Runs external tools as dependency-ordered, templated, retried steps and
//! checks the results against declared validations.

use clap::Parser;
use dact::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "dact", about = "Scenario-driven test orchestration")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli::dispatch(cli.command).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}

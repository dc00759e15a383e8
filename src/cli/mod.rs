pub mod config;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deluge")]
#[command(about = "Scenario-driven HTTP load generator", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log filter (e.g. "debug" or "deluge=trace"); overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the deluge declared in a script
    Run(RunArgs),
    /// Load a script and check its deluge declaration without running it
    Validate {
        /// Path to the deluge script
        script: PathBuf,
        /// Optional engine config file to validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the JSON schema of the engine config file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the deluge script
    pub script: PathBuf,

    /// Engine config file (YAML, or JSON by extension)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the final report as JSON instead of the summary
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Write the final report as JSON to a file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Grace period for in-flight iterations when the deluge ends (e.g. "5s")
    #[arg(long)]
    pub grace: Option<String>,
}

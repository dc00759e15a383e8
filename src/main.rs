use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use deluge::cli::{Cli, Commands};
use deluge::stats::Status;

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Run(args) => {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            let report = rt.block_on(deluge::cli::run::run_deluge(&args))?;
            drop(rt);
            if report.status == Status::DoneError {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Validate { script, config } => {
            deluge::cli::validate::run_validate(&script, config.as_deref())?;
            Ok(())
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(deluge::cli::config::EngineConfig);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "deluge", &mut std::io::stdout());
            Ok(())
        }
    }
}

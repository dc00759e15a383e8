use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::cli::config::EngineConfig;
use crate::cli::RunArgs;
use crate::engine::Engine;
use crate::stats::RunReport;
use crate::utils::parse_duration;

/// Config file values with command line overrides applied.
pub fn resolve_config(config: Option<&Path>, grace: Option<&str>) -> Result<EngineConfig> {
    let mut resolved = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(grace) = grace {
        parse_duration(grace).context("invalid --grace")?;
        resolved.grace_period = Some(grace.to_string());
    }
    Ok(resolved)
}

pub fn read_script(path: &Path) -> Result<(String, String)> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    Ok((source, path.display().to_string()))
}

/// Load, run and report. Ctrl-C stops the run; the report of what ran so far is
/// still produced.
pub async fn run_deluge(args: &RunArgs) -> Result<RunReport> {
    let config = resolve_config(args.config.as_deref(), args.grace.as_deref())?;
    let engine = Engine::new(&config)?;
    let (source, origin) = read_script(&args.script)?;
    let plan = engine.load(&source, &origin)?;

    let handle = engine.start(&plan);
    let control = handle.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping the deluge");
            control.stop();
        }
    });
    let report = handle.wait().await;
    interrupt.abort();

    if args.json {
        println!("{}", report.to_json());
    } else {
        report.print_summary();
    }
    if let Some(path) = &args.export_json {
        export_json(&report, path)?;
    }
    Ok(report)
}

pub fn export_json(report: &RunReport, path: &Path) -> Result<()> {
    std::fs::write(path, report.to_json())
        .with_context(|| format!("failed to write report to {}", path.display()))
}

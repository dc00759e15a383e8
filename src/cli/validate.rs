use anyhow::Result;
use std::path::Path;

use crate::bridge::loader::load_plan;
use crate::cli::config::EngineConfig;
use crate::cli::run::read_script;
use crate::engine::plan::DelugePlan;

/// Validate a deluge script without running it.
/// Checks for:
/// - JavaScript syntax errors
/// - a single, well-formed deluge declaration
/// - configured scenarios that are not defined
/// - duration literals
pub fn run_validate(script: &Path, config_path: Option<&Path>) -> Result<DelugePlan> {
    println!("Validating {}...", script.display());

    let (source, origin) = read_script(script)?;
    let plan = match load_plan(&source, &origin) {
        Ok(plan) => plan,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("  ✓ Script OK");
    println!("    deluge: {}", plan.name);
    match plan.duration {
        Some(d) => println!("    duration: {}s", d.as_secs_f64()),
        None => println!("    duration: until stopped"),
    }
    for (name, scenario) in &plan.scenarios {
        println!(
            "    scenario {}: {} users, ramp {}s{}",
            name,
            scenario.concurrency,
            scenario.ramp.as_secs_f64(),
            scenario
                .iteration_duration
                .map(|d| format!(", paced to {}ms", d.as_millis()))
                .unwrap_or_default()
        );
    }

    if let Some(cfg_path) = config_path {
        match EngineConfig::from_file(cfg_path).and_then(|c| c.settings().map_err(Into::into)) {
            Ok(_) => println!("  ✓ Config file valid: {}", cfg_path.display()),
            Err(e) => {
                println!("  ✗ Config file invalid: {:#}", e);
                anyhow::bail!("Config validation failed");
            }
        }
    }

    Ok(plan)
}

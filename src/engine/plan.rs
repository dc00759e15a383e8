//! The immutable description of a run, produced once by the loader.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::utils::{parse_duration, parse_optional_duration};

/// What a script passed to `deluge(...)`, before validation.
#[derive(Debug, Clone)]
pub struct DelugeDecl {
    pub name: String,
    pub duration: Option<String>,
    pub config: Value,
}

/// One entry of the deluge configuration object as written in a script.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioEntry {
    concurrent: u64,
    #[serde(default)]
    delay: Option<String>,
    #[serde(default)]
    args: Option<Map<String, Value>>,
    #[serde(default, rename = "iterationDuration")]
    iteration_duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioPlan {
    pub name: String,
    pub description: String,
    /// Target number of concurrent virtual users.
    pub concurrency: u64,
    /// Time over which workers are admitted, linearly.
    pub ramp: Duration,
    /// Frozen per-scenario arguments handed to every iteration.
    pub args: Value,
    /// Minimum wall time of one iteration; shorter iterations wait out the rest.
    pub iteration_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DelugePlan {
    pub name: String,
    /// `None` runs until stopped.
    pub duration: Option<Duration>,
    pub scenarios: BTreeMap<String, ScenarioPlan>,
    pub origin: String,
    source: Arc<str>,
}

impl DelugePlan {
    pub fn from_declaration(
        decl: DelugeDecl,
        defined: &[(String, String)],
        source: &str,
        origin: &str,
    ) -> Result<Self, ConfigurationError> {
        if decl.name.trim().is_empty() {
            return Err(ConfigurationError::InvalidDeluge(
                "deluge name must not be empty".to_string(),
            ));
        }
        let duration = decl.duration.as_deref().map(parse_duration).transpose()?;
        let config = match decl.config {
            Value::Object(map) => map,
            other => {
                return Err(ConfigurationError::InvalidDeluge(format!(
                    "scenario configuration must be an object, got {}",
                    other
                )))
            }
        };

        let mut scenarios = BTreeMap::new();
        for (name, entry) in config {
            let description = defined
                .iter()
                .find(|(id, _)| *id == name)
                .map(|(_, description)| description.clone())
                .ok_or_else(|| ConfigurationError::UnknownScenario(name.clone()))?;

            let entry: ScenarioEntry =
                serde_json::from_value(entry).map_err(|e| ConfigurationError::InvalidScenarioConfig {
                    scenario: name.clone(),
                    reason: e.to_string(),
                })?;

            let ramp = parse_optional_duration(entry.delay.as_deref(), Duration::ZERO)?;
            let iteration_duration = entry
                .iteration_duration
                .as_deref()
                .map(parse_duration)
                .transpose()?;

            scenarios.insert(
                name.clone(),
                ScenarioPlan {
                    name,
                    description,
                    concurrency: entry.concurrent,
                    ramp,
                    args: Value::Object(entry.args.unwrap_or_default()),
                    iteration_duration,
                },
            );
        }

        for (id, _) in defined {
            if !scenarios.contains_key(id) {
                debug!(scenario = %id, "scenario defined but not part of the deluge");
            }
        }

        Ok(Self {
            name: decl.name,
            duration,
            scenarios,
            origin: origin.to_string(),
            source: Arc::from(source),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn shared_source(&self) -> Arc<str> {
        self.source.clone()
    }

    pub fn total_concurrency(&self) -> u64 {
        self.scenarios.values().map(|s| s.concurrency).sum()
    }
}

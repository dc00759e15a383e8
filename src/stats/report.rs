use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{RequestStats, ScenarioStats, Status};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub transport_errors: BTreeMap<String, usize>,
    pub status_codes: BTreeMap<u16, usize>,
    /// Milliseconds, computed over requests that received a response.
    pub latency: LatencySummary,
}

impl RequestReport {
    pub fn from_stats(stats: &RequestStats) -> Self {
        let responses = stats.responses();
        let latency = if responses == 0 {
            LatencySummary::default()
        } else {
            let quantile_ms =
                |q: f64| Duration::from_micros(stats.latency_quantile(q)).as_secs_f64() * 1000.0;
            LatencySummary {
                min: millis(stats.min_duration.unwrap_or_default()),
                max: millis(stats.max_duration),
                mean: millis(stats.total_duration) / responses as f64,
                p50: quantile_ms(0.5),
                p90: quantile_ms(0.9),
                p95: quantile_ms(0.95),
                p99: quantile_ms(0.99),
            }
        };

        Self {
            total: stats.total,
            passed: stats.passed,
            failed: stats.failed,
            transport_errors: stats.transport_errors.clone(),
            status_codes: stats.status_codes.clone(),
            latency,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub status: Status,
    /// Virtual users that actually ran.
    pub users: usize,
    pub iterations: usize,
    pub passed: usize,
    pub assertion_failures: usize,
    pub script_errors: usize,
    pub cancelled: usize,
    pub errors: BTreeMap<String, usize>,
    pub requests: BTreeMap<String, RequestReport>,
}

impl ScenarioReport {
    pub fn from_stats(stats: &ScenarioStats) -> Self {
        Self {
            status: stats.effective_status(),
            users: stats.users,
            iterations: stats.iterations,
            passed: stats.passed,
            assertion_failures: stats.assertion_failures,
            script_errors: stats.script_errors,
            cancelled: stats.cancelled,
            errors: stats
                .errors
                .iter()
                .map(|(msg, count)| (msg.clone(), *count))
                .collect(),
            requests: stats
                .requests
                .iter()
                .map(|(label, req)| (label.clone(), RequestReport::from_stats(req)))
                .collect(),
        }
    }
}

/// Aggregated outcome of a deluge, per scenario and per request label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub deluge: String,
    pub status: Status,
    pub elapsed_ms: u128,
    pub scenarios: BTreeMap<String, ScenarioReport>,
    /// Per label, merged across scenarios.
    pub requests: BTreeMap<String, RequestReport>,
}

impl RunReport {
    pub fn total_requests(&self) -> usize {
        self.requests.values().map(|r| r.total).sum()
    }

    pub fn total_iterations(&self) -> usize {
        self.scenarios.values().map(|s| s.iterations).sum()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        println!("\n--- Deluge Summary: {} ---", self.deluge);
        println!("Status:       {}", self.status);
        println!("Elapsed:      {:?}", Duration::from_millis(self.elapsed_ms as u64));

        if self.scenarios.is_empty() {
            println!("No scenarios ran.");
            println!("--------------------\n");
            return;
        }

        println!("\nScenarios:");
        for (name, s) in &self.scenarios {
            let mark = if s.status == Status::DoneError { "✗" } else { "✓" };
            println!("  {} {} ({})", mark, name, s.status);
            println!("    Users:      {}", s.users);
            println!("    Iterations: {} ({} passed)", s.iterations, s.passed);
            if s.assertion_failures > 0 {
                println!("    Assertion failures: {}", s.assertion_failures);
            }
            if s.script_errors > 0 {
                println!("    Script errors:      {}", s.script_errors);
            }
            if s.cancelled > 0 {
                println!("    Cancelled:          {}", s.cancelled);
            }
            let mut errors: Vec<_> = s.errors.iter().collect();
            errors.sort_by(|a, b| b.1.cmp(a.1));
            for (msg, count) in errors.into_iter().take(5) {
                println!("      {}x {}", count, msg);
            }
        }

        if !self.requests.is_empty() {
            println!("\nRequests:");
            for (label, r) in &self.requests {
                println!("  Request: {}", label);
                println!("    Count:  {} ({} passed, {} failed)", r.total, r.passed, r.failed);
                println!(
                    "    Latency: avg={:.2}ms p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
                    r.latency.mean, r.latency.p50, r.latency.p95, r.latency.p99, r.latency.max
                );
                if !r.status_codes.is_empty() {
                    let codes: Vec<String> = r
                        .status_codes
                        .iter()
                        .map(|(code, count)| format!("{}={}", code, count))
                        .collect();
                    println!("    Status: {}", codes.join(" "));
                }
                for (kind, count) in &r.transport_errors {
                    println!("    Transport error {}: {}", kind, count);
                }
            }
        }

        println!("--------------------\n");
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

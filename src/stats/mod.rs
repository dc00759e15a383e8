use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IterationFailure, TransportError};

pub mod report;

pub use report::{LatencySummary, RequestReport, RunReport, ScenarioReport};

/// Distinct error messages kept per scenario before new ones are dropped.
const MAX_DISTINCT_ERRORS: usize = 100;

/// Progress of a deluge or of one of its scenarios.
///
/// Ordered so that merging two statuses keeps the most significant one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    InProgress,
    DoneSuccess,
    Interrupted,
    DoneError,
}

impl Status {
    pub fn merge(self, other: Status) -> Status {
        self.max(other)
    }

    pub fn is_done(self) -> bool {
        self >= Status::DoneSuccess
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotStarted => "not started",
            Status::InProgress => "in progress",
            Status::DoneSuccess => "done",
            Status::Interrupted => "interrupted",
            Status::DoneError => "done with errors",
        };
        f.write_str(s)
    }
}

/// One HTTP step as seen by the collector, emitted whether or not it succeeded.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub scenario: Arc<str>,
    pub label: String,
    pub user: u64,
    pub iteration: u64,
    pub method: String,
    pub url: String,
    /// 0 when no response was received.
    pub status: u16,
    pub latency: Duration,
    pub started_at: Instant,
    pub error: Option<TransportError>,
}

impl RequestRecord {
    /// Transport succeeded and the server did not answer with an error status.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.status > 0 && self.status < 400
    }
}

/// Outcome of one scenario execution by one virtual user.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub scenario: Arc<str>,
    pub user: u64,
    pub iteration: u64,
    pub started_at: Instant,
    pub duration: Duration,
    pub outcome: Result<(), IterationFailure>,
}

pub enum Metric {
    Request(RequestRecord),
    Iteration(IterationRecord),
    WorkerStarted { scenario: Arc<str> },
    /// A virtual user whose script runtime could not be built; counted as a script error.
    WorkerFailed { scenario: Arc<str>, error: String },
    ScenarioStatus { scenario: Arc<str>, status: Status },
    /// Barrier: answered once every metric sent before it has been folded in.
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Cheap, cloneable handle workers use to push metrics to the aggregator thread.
#[derive(Clone)]
pub struct MetricsSink {
    tx: Sender<Metric>,
}

impl MetricsSink {
    pub fn new(tx: Sender<Metric>) -> Self {
        Self { tx }
    }

    pub fn record_request(&self, record: RequestRecord) {
        self.send(Metric::Request(record));
    }

    pub fn record_iteration(&self, record: IterationRecord) {
        self.send(Metric::Iteration(record));
    }

    pub fn worker_started(&self, scenario: &Arc<str>) {
        self.send(Metric::WorkerStarted {
            scenario: scenario.clone(),
        });
    }

    pub fn worker_failed(&self, scenario: &Arc<str>, error: impl Into<String>) {
        self.send(Metric::WorkerFailed {
            scenario: scenario.clone(),
            error: error.into(),
        });
    }

    pub fn scenario_status(&self, scenario: &Arc<str>, status: Status) {
        self.send(Metric::ScenarioStatus {
            scenario: scenario.clone(),
            status,
        });
    }

    fn send(&self, metric: Metric) {
        if self.tx.send(metric).is_err() {
            debug!("metrics aggregator is gone, dropping metric");
        }
    }
}

pub struct RequestStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub transport_errors: BTreeMap<String, usize>,
    pub status_codes: BTreeMap<u16, usize>,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    /// Absent only when the latency histogram could not be allocated.
    pub histogram: Option<Histogram<u64>>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
            transport_errors: BTreeMap::new(),
            status_codes: BTreeMap::new(),
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            histogram: new_latency_histogram(),
        }
    }

    pub fn add(&mut self, record: &RequestRecord) {
        self.total += 1;
        if record.passed() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }

        if let Some(err) = &record.error {
            *self
                .transport_errors
                .entry(err.kind.as_str().to_string())
                .or_insert(0) += 1;
            return;
        }

        *self.status_codes.entry(record.status).or_insert(0) += 1;
        self.total_duration += record.latency;
        if self.min_duration.is_none_or(|min| record.latency < min) {
            self.min_duration = Some(record.latency);
        }
        if record.latency > self.max_duration {
            self.max_duration = record.latency;
        }
        if let Some(histogram) = &mut self.histogram {
            histogram.saturating_record((record.latency.as_micros() as u64).max(1));
        }
    }

    pub fn merge(&mut self, other: &RequestStats) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        for (kind, count) in &other.transport_errors {
            *self.transport_errors.entry(kind.clone()).or_insert(0) += count;
        }
        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }
        self.total_duration += other.total_duration;
        if let Some(other_min) = other.min_duration {
            if self.min_duration.is_none_or(|min| other_min < min) {
                self.min_duration = Some(other_min);
            }
        }
        if other.max_duration > self.max_duration {
            self.max_duration = other.max_duration;
        }
        if let (Some(mine), Some(theirs)) = (&mut self.histogram, &other.histogram) {
            mine.add(theirs).ok();
        }
    }

    /// Number of requests that produced a response and therefore a latency sample.
    pub fn responses(&self) -> u64 {
        self.status_codes.values().sum::<usize>() as u64
    }

    /// Latency at quantile `q` in microseconds.
    pub fn latency_quantile(&self, q: f64) -> u64 {
        self.histogram.as_ref().map_or(0, |h| h.value_at_quantile(q))
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ScenarioStats {
    pub status: Status,
    pub users: usize,
    pub iterations: usize,
    pub passed: usize,
    pub assertion_failures: usize,
    pub script_errors: usize,
    pub cancelled: usize,
    pub errors: HashMap<String, usize>,
    pub requests: BTreeMap<String, RequestStats>,
}

impl ScenarioStats {
    /// Terminal scenarios with failed iterations are reported as errors.
    pub fn effective_status(&self) -> Status {
        if self.status.is_done() && self.assertion_failures + self.script_errors > 0 {
            self.status.merge(Status::DoneError)
        } else {
            self.status
        }
    }

    fn add_error(&mut self, message: String) {
        let distinct = self.errors.len();
        match self.errors.get_mut(&message) {
            Some(count) => *count += 1,
            None if distinct < MAX_DISTINCT_ERRORS => {
                self.errors.insert(message, 1);
            }
            None => {}
        }
    }
}

pub struct StatsAggregator {
    pub deluge: String,
    pub status: Status,
    pub scenarios: BTreeMap<String, ScenarioStats>,
}

impl StatsAggregator {
    pub fn new(deluge: impl Into<String>) -> Self {
        Self {
            deluge: deluge.into(),
            status: Status::NotStarted,
            scenarios: BTreeMap::new(),
        }
    }

    /// Declare a scenario up front so it shows in reports even before it runs.
    pub fn register_scenario(&mut self, scenario: &str) {
        self.scenarios.entry(scenario.to_string()).or_default();
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request(record) => {
                self.scenario_mut(&record.scenario)
                    .requests
                    .entry(record.label.clone())
                    .or_default()
                    .add(&record);
            }
            Metric::Iteration(record) => {
                let stats = self.scenario_mut(&record.scenario);
                stats.iterations += 1;
                match record.outcome {
                    Ok(()) => stats.passed += 1,
                    Err(failure) => {
                        match &failure {
                            IterationFailure::AssertionFailure(_) => stats.assertion_failures += 1,
                            IterationFailure::ScriptError(_) => stats.script_errors += 1,
                            IterationFailure::Cancelled => stats.cancelled += 1,
                        }
                        if failure != IterationFailure::Cancelled {
                            stats.add_error(failure.to_string());
                        }
                    }
                }
            }
            Metric::WorkerStarted { scenario } => {
                self.scenario_mut(&scenario).users += 1;
            }
            Metric::WorkerFailed { scenario, error } => {
                let stats = self.scenario_mut(&scenario);
                stats.script_errors += 1;
                stats.add_error(format!("worker failed to start: {}", error));
            }
            Metric::ScenarioStatus { scenario, status } => {
                let stats = self.scenario_mut(&scenario);
                stats.status = stats.status.merge(status);
            }
            Metric::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn scenario_mut(&mut self, scenario: &str) -> &mut ScenarioStats {
        self.scenarios.entry(scenario.to_string()).or_default()
    }

    pub fn run_status(&self) -> Status {
        self.scenarios
            .values()
            .map(ScenarioStats::effective_status)
            .fold(self.status, Status::merge)
    }

    pub fn to_report(&self, elapsed: Duration) -> RunReport {
        let mut merged: BTreeMap<String, RequestStats> = BTreeMap::new();
        let mut scenarios = BTreeMap::new();

        for (name, stats) in &self.scenarios {
            for (label, req) in &stats.requests {
                merged.entry(label.clone()).or_default().merge(req);
            }
            scenarios.insert(name.clone(), ScenarioReport::from_stats(stats));
        }

        RunReport {
            deluge: self.deluge.clone(),
            status: self.run_status(),
            elapsed_ms: elapsed.as_millis(),
            scenarios,
            requests: merged
                .iter()
                .map(|(label, stats)| (label.clone(), RequestReport::from_stats(stats)))
                .collect(),
        }
    }
}

// 1us .. 1h, 2 significant digits
static LATENCY_TEMPLATE: LazyLock<Option<Histogram<u64>>> = LazyLock::new(|| {
    Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2)
        .map_err(|e| warn!(error = %e, "latency histogram unavailable, percentiles disabled"))
        .ok()
});

pub fn new_latency_histogram() -> Option<Histogram<u64>> {
    LATENCY_TEMPLATE.as_ref().map(Histogram::new_from)
}

struct CollectorInner {
    tx: Sender<Metric>,
    aggregator: Arc<RwLock<StatsAggregator>>,
    started: Instant,
    sealed: Mutex<Option<Duration>>,
}

/// Run-wide metrics collector.
///
/// Workers push through [`MetricsSink`]s; a single aggregator thread folds metrics in
/// arrival order, so concurrent producers never contend on the statistics themselves.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl Collector {
    pub fn new(deluge: impl Into<String>) -> Self {
        let (tx, rx): (Sender<Metric>, Receiver<Metric>) = crossbeam_channel::unbounded();
        let aggregator = Arc::new(RwLock::new(StatsAggregator::new(deluge)));

        let agg = aggregator.clone();
        let spawned = std::thread::Builder::new()
            .name("deluge-metrics".to_string())
            .spawn(move || {
                while let Ok(metric) = rx.recv() {
                    agg.write().add(metric);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn metrics aggregator thread");
        }

        Self {
            inner: Arc::new(CollectorInner {
                tx,
                aggregator,
                started: Instant::now(),
                sealed: Mutex::new(None),
            }),
        }
    }

    pub fn sink(&self) -> MetricsSink {
        MetricsSink::new(self.inner.tx.clone())
    }

    pub fn register_scenario(&self, scenario: &str) {
        self.inner.aggregator.write().register_scenario(scenario);
    }

    pub fn set_run_status(&self, status: Status) {
        let mut agg = self.inner.aggregator.write();
        agg.status = agg.status.merge(status);
    }

    pub fn record_request(&self, record: RequestRecord) {
        self.sink().record_request(record);
    }

    pub fn record_iteration(&self, record: IterationRecord) {
        self.sink().record_iteration(record);
    }

    /// Resolves once every metric sent before this call has been aggregated.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.inner.tx.send(Metric::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Freeze the elapsed time. Reports produced afterwards are identical.
    pub fn seal(&self) {
        let mut sealed = self.inner.sealed.lock();
        if sealed.is_none() {
            *sealed = Some(self.inner.started.elapsed());
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.lock().is_some()
    }

    /// Consistent snapshot mid-run, final report once sealed. Never blocks on the run.
    pub fn finalize(&self) -> RunReport {
        let elapsed = (*self.inner.sealed.lock()).unwrap_or_else(|| self.inner.started.elapsed());
        self.inner.aggregator.read().to_report(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    fn request(scenario: &str, label: &str, status: u16, latency_ms: u64) -> RequestRecord {
        RequestRecord {
            scenario: Arc::from(scenario),
            label: label.to_string(),
            user: 0,
            iteration: 0,
            method: "GET".to_string(),
            url: "http://localhost/".to_string(),
            status,
            latency: Duration::from_millis(latency_ms),
            started_at: Instant::now(),
            error: None,
        }
    }

    fn iteration(scenario: &str, outcome: Result<(), IterationFailure>) -> IterationRecord {
        IterationRecord {
            scenario: Arc::from(scenario),
            user: 0,
            iteration: 0,
            started_at: Instant::now(),
            duration: Duration::from_millis(5),
            outcome,
        }
    }

    #[test]
    fn test_status_merge_keeps_highest() {
        assert_eq!(Status::InProgress.merge(Status::DoneSuccess), Status::DoneSuccess);
        assert_eq!(Status::DoneError.merge(Status::Interrupted), Status::DoneError);
        assert_eq!(Status::Interrupted.merge(Status::DoneSuccess), Status::Interrupted);
        assert_eq!(Status::NotStarted.merge(Status::NotStarted), Status::NotStarted);
    }

    #[test]
    fn test_aggregator_math() {
        let mut agg = StatsAggregator::new("d1");
        agg.add(Metric::Request(request("s1", "home", 200, 100)));
        agg.add(Metric::Request(request("s1", "home", 200, 200)));

        let stats = &agg.scenarios["s1"].requests["home"];
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.total_duration, Duration::from_millis(300));
        assert_eq!(stats.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(stats.max_duration, Duration::from_millis(200));
        assert_eq!(stats.status_codes[&200], 2);
        assert_eq!(stats.responses(), 2);
        assert!(stats.latency_quantile(0.99) >= 199_000);
    }

    #[test]
    fn test_stats_without_histogram() {
        let mut stats = RequestStats {
            histogram: None,
            ..RequestStats::new()
        };
        stats.add(&request("s1", "home", 200, 40));
        let mut merged = RequestStats::new();
        merged.merge(&stats);

        assert_eq!(stats.responses(), 1);
        assert_eq!(stats.latency_quantile(0.5), 0);
        let report = RequestReport::from_stats(&stats);
        assert_eq!(report.latency.max, 40.0);
        assert_eq!(report.latency.p50, 0.0);
        assert_eq!(merged.total, 1);
    }

    #[test]
    fn test_failed_requests() {
        let mut agg = StatsAggregator::new("d1");
        agg.add(Metric::Request(request("s1", "api", 503, 10)));

        let mut timed_out = request("s1", "api", 0, 0);
        timed_out.error = Some(TransportError::new(TransportErrorKind::Timeout, "slow"));
        agg.add(Metric::Request(timed_out));

        let stats = &agg.scenarios["s1"].requests["api"];
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passed, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.transport_errors["timeout"], 1);
        assert_eq!(stats.status_codes[&503], 1);
        assert_eq!(stats.responses(), 1);
    }

    #[test]
    fn test_iteration_outcomes_are_distinguished() {
        let mut agg = StatsAggregator::new("d1");
        agg.add(Metric::Iteration(iteration("s1", Ok(()))));
        agg.add(Metric::Iteration(iteration(
            "s1",
            Err(IterationFailure::AssertionFailure("Assertion failed".to_string())),
        )));
        agg.add(Metric::Iteration(iteration(
            "s1",
            Err(IterationFailure::ScriptError("ReferenceError: x".to_string())),
        )));
        agg.add(Metric::Iteration(iteration("s1", Err(IterationFailure::Cancelled))));

        let stats = &agg.scenarios["s1"];
        assert_eq!(stats.iterations, 4);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.assertion_failures, 1);
        assert_eq!(stats.script_errors, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.errors.len(), 2);
    }

    #[test]
    fn test_worker_startup_failure_is_a_script_error() {
        let mut agg = StatsAggregator::new("d1");
        let s1: Arc<str> = Arc::from("s1");
        agg.add(Metric::WorkerStarted { scenario: s1.clone() });
        agg.add(Metric::WorkerFailed {
            scenario: s1.clone(),
            error: "out of memory".to_string(),
        });
        agg.add(Metric::ScenarioStatus {
            scenario: s1,
            status: Status::DoneSuccess,
        });

        let stats = &agg.scenarios["s1"];
        assert_eq!(stats.users, 1);
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.script_errors, 1);
        assert_eq!(stats.errors["worker failed to start: out of memory"], 1);
        assert_eq!(stats.effective_status(), Status::DoneError);
    }

    #[test]
    fn test_error_messages_are_capped() {
        let mut agg = StatsAggregator::new("d1");
        for i in 0..(MAX_DISTINCT_ERRORS + 20) {
            agg.add(Metric::Iteration(iteration(
                "s1",
                Err(IterationFailure::ScriptError(format!("error {}", i))),
            )));
        }
        agg.add(Metric::Iteration(iteration(
            "s1",
            Err(IterationFailure::ScriptError("error 0".to_string())),
        )));

        let stats = &agg.scenarios["s1"];
        assert_eq!(stats.errors.len(), MAX_DISTINCT_ERRORS);
        assert_eq!(stats.errors["script error: error 0"], 2);
        assert_eq!(stats.script_errors, MAX_DISTINCT_ERRORS + 21);
    }

    #[test]
    fn test_scenario_status_with_failures() {
        let mut agg = StatsAggregator::new("d1");
        let s1: Arc<str> = Arc::from("s1");
        agg.add(Metric::ScenarioStatus {
            scenario: s1.clone(),
            status: Status::InProgress,
        });
        agg.add(Metric::Iteration(iteration(
            "s1",
            Err(IterationFailure::AssertionFailure("Assertion failed".to_string())),
        )));
        // Still running: failures do not leak into an in-progress status
        assert_eq!(agg.scenarios["s1"].effective_status(), Status::InProgress);

        agg.add(Metric::ScenarioStatus {
            scenario: s1,
            status: Status::DoneSuccess,
        });
        assert_eq!(agg.scenarios["s1"].effective_status(), Status::DoneError);
        assert_eq!(agg.run_status(), Status::DoneError);
    }

    #[test]
    fn test_report_merges_labels_across_scenarios() {
        let mut agg = StatsAggregator::new("d1");
        for i in 1..=50 {
            agg.add(Metric::Request(request("s1", "login", 200, i)));
            agg.add(Metric::Request(request("s2", "login", 200, 50 + i)));
        }
        agg.add(Metric::Request(request("s2", "search", 404, 3)));

        let report = agg.to_report(Duration::from_secs(1));
        assert_eq!(report.requests["login"].total, 100);
        assert_eq!(report.scenarios["s1"].requests["login"].total, 50);
        assert_eq!(report.requests["search"].failed, 1);

        let p50 = report.requests["login"].latency.p50;
        assert!((49.0..=51.5).contains(&p50), "P50 was {}", p50);
        let p99 = report.requests["login"].latency.p99;
        assert!((98.0..=100.5).contains(&p99), "P99 was {}", p99);
        assert_eq!(report.requests["login"].latency.min, 1.0);
    }

    #[tokio::test]
    async fn test_collector_concurrent_producers() {
        let collector = Collector::new("d1");
        let mut threads = Vec::new();
        for _ in 0..8 {
            let sink = collector.sink();
            threads.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    sink.record_request(request("s1", "home", 200, 1));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        collector.flush().await;
        let report = collector.finalize();
        assert_eq!(report.requests["home"].total, 4000);
        assert_eq!(report.scenarios["s1"].requests["home"].passed, 4000);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent_once_sealed() {
        let collector = Collector::new("d1");
        collector.record_request(request("s1", "home", 200, 7));
        collector.flush().await;
        assert!(!collector.is_sealed());
        collector.seal();
        assert!(collector.is_sealed());

        let first = collector.finalize();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = collector.finalize();
        assert_eq!(first.elapsed_ms, second.elapsed_ms);
        assert_eq!(first.to_json(), second.to_json());
    }
}

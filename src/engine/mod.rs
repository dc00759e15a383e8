use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::bridge::RuntimeLimits;
use crate::cli::config::EngineConfig;
use crate::engine::control::{RunControl, ScenarioPhase, ScenarioState};
use crate::engine::executor::StepExecutor;
use crate::engine::http_client::{HttpClient, Transport};
use crate::engine::plan::DelugePlan;
use crate::engine::scheduler::Pipeline;
use crate::error::ConfigurationError;
use crate::stats::{Collector, RunReport, Status};

pub mod control;
pub mod executor;
pub mod http_client;
pub mod plan;
pub mod scheduler;
pub mod session;
pub mod worker;

/// Validated, parsed form of [`EngineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub limits: RuntimeLimits,
    pub pool_max_idle_per_host: usize,
}

pub struct Engine {
    settings: EngineSettings,
    transport: Arc<dyn Transport>,
}

impl Engine {
    /// Engine backed by the pooled hyper client.
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigurationError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let settings = config.settings()?;
        let transport = Arc::new(HttpClient::with_pool_size(settings.pool_max_idle_per_host));
        Ok(Self { settings, transport })
    }

    pub fn with_transport(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            settings: config.settings()?,
            transport,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Evaluate a script and validate its deluge declaration.
    pub fn load(&self, source: &str, origin: &str) -> Result<DelugePlan, ConfigurationError> {
        crate::bridge::loader::load_plan(source, origin)
    }

    /// Start every scenario of `plan` concurrently. Must be called from within a
    /// multi-threaded Tokio runtime.
    pub fn start(&self, plan: &DelugePlan) -> RunHandle {
        let collector = Collector::new(plan.name.clone());
        let control = Arc::new(RunControl::new());
        let executor = Arc::new(StepExecutor::new(
            self.transport.clone(),
            collector.sink(),
            self.settings.request_timeout,
        ));

        let start = Instant::now();
        let deadline = plan.duration.map(|d| start + d);
        info!(
            deluge = %plan.name,
            scenarios = plan.scenarios.len(),
            users = plan.total_concurrency(),
            duration_ms = plan.duration.map(|d| d.as_millis() as u64),
            "deluge started"
        );
        collector.set_run_status(Status::InProgress);

        let mut scenarios = BTreeMap::new();
        let mut pipelines = Vec::with_capacity(plan.scenarios.len());
        for (name, scenario) in &plan.scenarios {
            collector.register_scenario(name);
            let state = Arc::new(ScenarioState::new(Arc::from(name.as_str())));
            scenarios.insert(name.clone(), state.clone());
            pipelines.push(Pipeline {
                state,
                plan: scenario.clone(),
                source: plan.shared_source(),
                origin: plan.origin.clone(),
                executor: executor.clone(),
                sink: collector.sink(),
                control: control.clone(),
                start,
                deadline,
                grace: self.settings.grace_period,
                limits: self.settings.limits,
            });
        }

        if let Some(deadline) = deadline {
            let timer = control.clone();
            let drain = control.drain_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        info!("deluge duration elapsed, draining");
                        timer.expire();
                    }
                    _ = drain.cancelled() => {}
                }
            });
        }

        let task = tokio::spawn(drive(pipelines, collector.clone(), control.clone(), plan.name.clone()));
        RunHandle {
            control,
            scenarios,
            collector,
            task,
        }
    }

    /// Run `plan` to completion.
    pub async fn run(&self, plan: &DelugePlan) -> RunReport {
        self.start(plan).wait().await
    }
}

async fn drive(
    pipelines: Vec<Pipeline>,
    collector: Collector,
    control: Arc<RunControl>,
    deluge: String,
) -> RunReport {
    let handles: Vec<_> = pipelines.into_iter().map(|p| tokio::spawn(p.run())).collect();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "scenario pipeline failed");
        }
    }

    // Releases the deadline timer when the run ended some other way.
    control.expire();

    collector.flush().await;
    collector.set_run_status(if control.is_stopped() {
        Status::Interrupted
    } else {
        Status::DoneSuccess
    });
    collector.seal();

    let report = collector.finalize();
    info!(
        deluge = %deluge,
        status = %report.status,
        iterations = report.total_iterations(),
        requests = report.total_requests(),
        elapsed_ms = report.elapsed_ms as u64,
        "deluge finished"
    );
    report
}

/// Control surface of a started run.
pub struct RunHandle {
    control: Arc<RunControl>,
    scenarios: BTreeMap<String, Arc<ScenarioState>>,
    collector: Collector,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Operator abort: stop admitting, cancel in-flight iterations and finish as
    /// `Interrupted`.
    pub fn stop(&self) {
        if !self.control.is_stopped() {
            info!("stop requested");
        }
        self.control.stop();
    }

    /// Shared run control, for stopping the run from another task.
    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    pub fn phase(&self, scenario: &str) -> Option<ScenarioPhase> {
        self.scenarios.get(scenario).map(|s| s.phase())
    }

    pub fn active_workers(&self, scenario: &str) -> Option<usize> {
        self.scenarios.get(scenario).map(|s| s.active_workers())
    }

    pub fn total_active_workers(&self) -> usize {
        self.scenarios.values().map(|s| s.active_workers()).sum()
    }

    /// Point-in-time report; safe to call while the run is in progress.
    pub fn snapshot(&self) -> RunReport {
        self.collector.finalize()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for every scenario to finish and return the final report.
    pub async fn wait(self) -> RunReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "run task failed");
                self.control.stop();
                self.collector.set_run_status(Status::Interrupted);
                self.collector.seal();
                self.collector.finalize()
            }
        }
    }
}

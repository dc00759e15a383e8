//! Per-scenario pipelines: admit workers along the ramp, hold until the run ends,
//! then drain with a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bridge::RuntimeLimits;
use crate::engine::control::{RunControl, ScenarioPhase, ScenarioState};
use crate::engine::executor::StepExecutor;
use crate::engine::plan::ScenarioPlan;
use crate::engine::worker::{self, WorkerContext};
use crate::stats::{MetricsSink, Status};

/// Offset from the run start at which worker `index` of `total` is admitted.
pub fn admission_offset(ramp: Duration, index: u64, total: u64) -> Duration {
    if total == 0 || ramp.is_zero() {
        return Duration::ZERO;
    }
    let nanos = ramp.as_nanos() * u128::from(index) / u128::from(total);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

pub struct Pipeline {
    pub state: Arc<ScenarioState>,
    pub plan: ScenarioPlan,
    pub source: Arc<str>,
    pub origin: String,
    pub executor: Arc<StepExecutor>,
    pub sink: MetricsSink,
    pub control: Arc<RunControl>,
    pub start: Instant,
    pub deadline: Option<Instant>,
    pub grace: Duration,
    pub limits: RuntimeLimits,
}

impl Pipeline {
    pub async fn run(self) -> Status {
        let name: Arc<str> = Arc::from(self.plan.name.as_str());
        let drain = self.control.drain_token();
        let cancel = self.control.cancel_token();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let handle = Handle::current();
        let total = self.plan.concurrency;

        self.sink.scenario_status(&name, Status::InProgress);
        info!(
            scenario = %name,
            concurrency = total,
            ramp_ms = self.plan.ramp.as_millis() as u64,
            "scenario started"
        );

        let mut spawned: u64 = 0;
        for index in 0..total {
            let offset = admission_offset(self.plan.ramp, index, total);
            if offset.is_zero() {
                if drain.is_cancelled() {
                    break;
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep_until(self.start + offset) => {}
                    _ = drain.cancelled() => break,
                }
            }

            let active = self.state.active_counter();
            active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let spawn = worker::spawn(WorkerContext {
                scenario: name.clone(),
                user: index,
                source: self.source.clone(),
                origin: self.origin.clone(),
                args: self.plan.args.clone(),
                iteration_duration: self.plan.iteration_duration,
                executor: self.executor.clone(),
                sink: self.sink.clone(),
                handle: handle.clone(),
                drain: drain.clone(),
                cancel: cancel.clone(),
                deadline: self.deadline.map(Instant::into_std),
                limits: self.limits,
                active: active.clone(),
                exits: exit_tx.clone(),
            });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => {
                    active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    error!(scenario = %name, user = index, error = %e, "failed to spawn worker thread");
                }
            }
        }

        if !drain.is_cancelled() {
            self.state.set_phase(ScenarioPhase::Steady);
            drain.cancelled().await;
        }
        self.state.set_phase(ScenarioPhase::Draining);

        let grace = if self.control.is_stopped() {
            Duration::ZERO
        } else {
            self.grace
        };
        let grace_ends = Instant::now() + grace;
        let mut retired: u64 = 0;
        while retired < spawned {
            match tokio::time::timeout_at(grace_ends, exit_rx.recv()).await {
                Ok(Some(_)) => retired += 1,
                Ok(None) | Err(_) => break,
            }
        }

        if retired < spawned {
            if !self.control.is_stopped() {
                warn!(
                    scenario = %name,
                    remaining = spawned - retired,
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed, cancelling in-flight iterations"
                );
            }
            cancel.cancel();
            while retired < spawned {
                match exit_rx.recv().await {
                    Some(_) => retired += 1,
                    None => break,
                }
            }
        }

        let status = if self.control.is_stopped() {
            Status::Interrupted
        } else {
            Status::DoneSuccess
        };
        self.sink.scenario_status(&name, status);
        self.state.set_phase(ScenarioPhase::Done);
        info!(scenario = %name, workers = spawned, status = %status, "scenario finished");
        status
    }
}

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle of one scenario pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    /// Admitting workers along the ramp.
    Ramping,
    /// All workers admitted, waiting for the run to end.
    Steady,
    /// No new iterations start; in-flight ones get the grace period.
    Draining,
    Done,
}

impl ScenarioPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ScenarioPhase::Ramping,
            1 => ScenarioPhase::Steady,
            2 => ScenarioPhase::Draining,
            _ => ScenarioPhase::Done,
        }
    }
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioPhase::Ramping => "ramping",
            ScenarioPhase::Steady => "steady",
            ScenarioPhase::Draining => "draining",
            ScenarioPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Live view of one scenario pipeline, shared between the pipeline and the run handle.
pub struct ScenarioState {
    name: Arc<str>,
    phase: AtomicU8,
    /// Admitted and not yet retired.
    active: Arc<AtomicUsize>,
}

impl ScenarioState {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            phase: AtomicU8::new(ScenarioPhase::Ramping as u8),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ScenarioPhase {
        ScenarioPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: ScenarioPhase) {
        let previous = self.phase.swap(phase as u8, Ordering::SeqCst);
        if previous != phase as u8 {
            info!(scenario = %self.name, phase = %phase, active = self.active_workers(), "scenario phase");
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn active_counter(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }
}

/// Run-wide cancellation shared by every pipeline.
///
/// `drain` ends admission and iteration starts (deadline or stop). `abort` marks an
/// operator stop: pipelines skip the grace period and in-flight work is cancelled.
#[derive(Debug, Default)]
pub struct RunControl {
    drain: CancellationToken,
    abort: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run deadline reached: drain with the configured grace period.
    pub fn expire(&self) {
        self.drain.cancel();
    }

    /// Operator stop: drain with no grace.
    pub fn stop(&self) {
        self.abort.cancel();
        self.drain.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn drain_token(&self) -> CancellationToken {
        self.drain.child_token()
    }

    /// Hard cancellation for one pipeline; fired by the operator stop or by the
    /// pipeline itself once its grace period is over.
    pub fn cancel_token(&self) -> CancellationToken {
        self.abort.child_token()
    }
}

//! One virtual user: a dedicated OS thread owning a private script runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bridge::{Bindings, RuntimeLimits, ScriptRuntime};
use crate::engine::executor::StepExecutor;
use crate::engine::session::Session;
use crate::error::IterationFailure;
use crate::stats::{IterationRecord, MetricsSink};

/// Headroom between the JS stack limit and the OS thread stack.
const THREAD_STACK_HEADROOM: usize = 1024 * 1024;

/// Sent by a worker when it retires, whatever the reason.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub user: u64,
    pub iterations: u64,
}

pub struct WorkerContext {
    pub scenario: Arc<str>,
    pub user: u64,
    pub source: Arc<str>,
    pub origin: String,
    pub args: serde_json::Value,
    pub iteration_duration: Option<Duration>,
    pub executor: Arc<StepExecutor>,
    pub sink: MetricsSink,
    pub handle: Handle,
    /// Stop starting iterations.
    pub drain: CancellationToken,
    /// Abort the iteration in flight.
    pub cancel: CancellationToken,
    /// No iteration starts at or after this instant.
    pub deadline: Option<Instant>,
    pub limits: RuntimeLimits,
    pub active: Arc<AtomicUsize>,
    pub exits: mpsc::UnboundedSender<WorkerExit>,
}

/// Decrements the active count and reports the exit, also when the worker unwinds.
struct Retirement {
    scenario: Arc<str>,
    user: u64,
    iterations: u64,
    active: Arc<AtomicUsize>,
    exits: mpsc::UnboundedSender<WorkerExit>,
}

impl Drop for Retirement {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(scenario = %self.scenario, user = self.user, iterations = self.iterations, "worker retired");
        let _ = self.exits.send(WorkerExit {
            user: self.user,
            iterations: self.iterations,
        });
    }
}

/// Start a worker thread. The caller must already have counted it as active.
pub fn spawn(ctx: WorkerContext) -> std::io::Result<std::thread::JoinHandle<()>> {
    let stack_size = ctx.limits.stack_size.saturating_add(THREAD_STACK_HEADROOM).max(2 * 1024 * 1024);
    std::thread::Builder::new()
        .name(format!("vu-{}-{}", ctx.scenario, ctx.user))
        .stack_size(stack_size)
        .spawn(move || run(ctx))
}

fn run(ctx: WorkerContext) {
    // Declared first so it drops after the script runtime.
    let mut retirement = Retirement {
        scenario: ctx.scenario.clone(),
        user: ctx.user,
        iterations: 0,
        active: ctx.active.clone(),
        exits: ctx.exits.clone(),
    };

    let bindings = Bindings {
        scenario: ctx.scenario.clone(),
        user: ctx.user,
        executor: ctx.executor.clone(),
        handle: ctx.handle.clone(),
        cancel: ctx.cancel.clone(),
    };
    let mut runtime = match ScriptRuntime::new(&ctx.source, &ctx.origin, &ctx.args, bindings, ctx.limits) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(scenario = %ctx.scenario, user = ctx.user, error = %e, "worker failed to start");
            ctx.sink.worker_failed(&ctx.scenario, e.to_string());
            return;
        }
    };
    ctx.sink.worker_started(&ctx.scenario);
    debug!(scenario = %ctx.scenario, user = ctx.user, "worker admitted");

    let mut session = Session::new();
    let mut iteration: u64 = 0;

    loop {
        if ctx.drain.is_cancelled() || ctx.cancel.is_cancelled() || past(ctx.deadline) {
            break;
        }

        let result = runtime.execute(&mut session, iteration);
        let cancelled = matches!(result.outcome, Err(IterationFailure::Cancelled));
        match &result.outcome {
            Ok(()) => {}
            Err(IterationFailure::Cancelled) => {
                debug!(scenario = %ctx.scenario, user = ctx.user, iteration, "iteration cancelled");
            }
            Err(failure) => {
                warn!(scenario = %ctx.scenario, user = ctx.user, iteration, error = %failure, "iteration failed");
            }
        }
        ctx.sink.record_iteration(IterationRecord {
            scenario: ctx.scenario.clone(),
            user: ctx.user,
            iteration,
            started_at: result.started_at,
            duration: result.duration,
            outcome: result.outcome,
        });

        iteration += 1;
        retirement.iterations = iteration;
        if cancelled {
            break;
        }

        if let Some(minimum) = ctx.iteration_duration {
            if result.duration < minimum && !pace(&ctx, minimum - result.duration) {
                break;
            }
        }
    }

    drop(runtime);
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Wait out the rest of a paced iteration. Returns false when the worker should retire.
fn pace(ctx: &WorkerContext, remaining: Duration) -> bool {
    if ctx.deadline.is_some_and(|d| Instant::now() + remaining >= d) {
        return false;
    }
    ctx.handle.block_on(async {
        tokio::select! {
            _ = tokio::time::sleep(remaining) => true,
            _ = ctx.drain.cancelled() => false,
            _ = ctx.cancel.cancelled() => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_client::{HttpRequest, HttpResponse, Transport};
    use crate::error::TransportError;
    use crate::stats::Metric;
    use async_trait::async_trait;

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                ..Default::default()
            })
        }
    }

    fn context(
        rt: &tokio::runtime::Runtime,
        source: &str,
        iteration_duration: Option<Duration>,
        deadline: Option<Instant>,
    ) -> (
        WorkerContext,
        crossbeam_channel::Receiver<Metric>,
        mpsc::UnboundedReceiver<WorkerExit>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let sink = MetricsSink::new(tx);
        let ctx = WorkerContext {
            scenario: Arc::from("s"),
            user: 4,
            source: Arc::from(source),
            origin: "worker.js".to_string(),
            args: serde_json::json!({}),
            iteration_duration,
            executor: Arc::new(StepExecutor::new(Arc::new(Ok200), sink.clone(), Duration::from_secs(1))),
            sink,
            handle: rt.handle().clone(),
            drain: CancellationToken::new(),
            cancel: CancellationToken::new(),
            deadline,
            limits: RuntimeLimits::default(),
            active: Arc::new(AtomicUsize::new(1)),
            exits: exit_tx,
        };
        (ctx, rx, exit_rx)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn iterations(rx: &crossbeam_channel::Receiver<Metric>) -> Vec<IterationRecord> {
        rx.try_iter()
            .filter_map(|m| match m {
                Metric::Iteration(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    const SRC: &str = "scenario('s', 'd', (args, session) => {
        session.n = (session.n || 0) + 1;
        http('ping', {url: 'http://localhost/'});
    });
    deluge('t', {s: {concurrent: 1}});";

    #[test]
    fn test_worker_stops_at_deadline() {
        let rt = runtime();
        let deadline = Instant::now() + Duration::from_millis(200);
        let (ctx, rx, mut exits) = context(&rt, SRC, Some(Duration::from_millis(20)), Some(deadline));
        let active = ctx.active.clone();

        spawn(ctx).unwrap().join().unwrap();
        assert!(Instant::now() >= deadline - Duration::from_millis(25));

        let records = iterations(&rx);
        assert!(!records.is_empty());
        assert!(records.len() <= 11, "paced worker ran {} iterations", records.len());
        assert!(records.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(active.load(Ordering::SeqCst), 0);

        let exit = exits.try_recv().unwrap();
        assert_eq!(exit.user, 4);
        assert_eq!(exit.iterations as usize, records.len());
    }

    #[test]
    fn test_worker_drains_after_current_iteration() {
        let rt = runtime();
        let (ctx, rx, mut exits) = context(&rt, SRC, Some(Duration::from_secs(60)), None);
        let drain = ctx.drain.clone();

        let handle = spawn(ctx).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        drain.cancel();
        handle.join().unwrap();

        // one iteration, then the pacing wait is cut short by the drain
        assert_eq!(iterations(&rx).len(), 1);
        assert_eq!(exits.try_recv().unwrap().iterations, 1);
    }

    #[test]
    fn test_worker_with_broken_script_still_retires() {
        let rt = runtime();
        let (ctx, rx, mut exits) = context(&rt, "scenario('other', 'd', () => {});", None, None);
        let active = ctx.active.clone();

        spawn(ctx).unwrap().join().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
        let metrics: Vec<Metric> = rx.try_iter().collect();
        assert!(metrics.iter().all(|m| !matches!(m, Metric::WorkerStarted { .. })));
        assert!(metrics.iter().any(|m| matches!(
            m,
            Metric::WorkerFailed { scenario, error } if scenario.as_ref() == "s" && error.contains("'s'")
        )));
        assert_eq!(exits.try_recv().unwrap().iterations, 0);
    }

    #[test]
    fn test_request_after_pause_starts_late_enough() {
        let rt = runtime();
        let src = "scenario('s', 'd', () => {
            pause('50ms');
            http('after-pause', {url: 'http://localhost/'});
        });
        deluge('t', {s: {concurrent: 1}});";
        let deadline = Instant::now() + Duration::from_millis(180);
        let (ctx, rx, _exits) = context(&rt, src, None, Some(deadline));

        spawn(ctx).unwrap().join().unwrap();

        let mut requests = Vec::new();
        let mut iterations = Vec::new();
        for metric in rx.try_iter() {
            match metric {
                Metric::Request(r) => requests.push(r),
                Metric::Iteration(r) => iterations.push(r),
                _ => {}
            }
        }
        assert!(iterations.len() >= 2);
        assert_eq!(requests.len(), iterations.len());
        for iteration in &iterations {
            let request = requests
                .iter()
                .find(|r| r.iteration == iteration.iteration)
                .unwrap();
            assert!(
                request.started_at >= iteration.started_at + Duration::from_millis(50),
                "request of iteration {} started {:?} after the iteration",
                iteration.iteration,
                request.started_at - iteration.started_at
            );
            assert!(iteration.duration >= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_past_deadline() {
        assert!(!past(None));
        assert!(past(Some(Instant::now())));
        assert!(!past(Some(Instant::now() + Duration::from_secs(60))));
    }
}

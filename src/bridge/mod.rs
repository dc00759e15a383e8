//! QuickJS host for deluge scripts.
//!
//! Every virtual user owns a [`ScriptRuntime`]: a private QuickJS runtime holding the
//! evaluated script, the body of the scenario it runs and its frozen arguments. The
//! loader ([`loader::load_plan`]) evaluates the same script once in a reduced context
//! to extract the deluge declaration.

pub mod check;
pub mod convert;
pub mod helpers;
pub mod http;
pub mod loader;
pub mod timers;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::function::Opt;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Persistent, Runtime, Value,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::engine::executor::StepExecutor;
use crate::engine::plan::DelugeDecl;
use crate::engine::session::Session;
use crate::error::{ConfigurationError, IterationFailure};

/// Per-iteration flags written by the bindings and read back once the body returns.
#[derive(Debug, Default)]
pub struct IterationState {
    pub iteration: u64,
    pub assertion: Option<String>,
    pub cancelled: bool,
}

pub type SharedState = Rc<RefCell<IterationState>>;

/// Host handles the stateful bindings need.
#[derive(Clone)]
pub struct Bindings {
    pub scenario: Arc<str>,
    pub user: u64,
    pub executor: Arc<StepExecutor>,
    pub handle: Handle,
    /// Hard cancellation for this virtual user.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub memory_limit: usize,
    pub stack_size: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            stack_size: 1024 * 1024,
        }
    }
}

/// Collects `scenario(...)` and `deluge(...)` calls during top-level evaluation.
#[derive(Default)]
pub(crate) struct Registry {
    /// `(id, description)` in definition order.
    pub defined: Vec<(String, String)>,
    pub bodies: HashMap<String, Persistent<Function<'static>>>,
    pub deluge: Option<DelugeDecl>,
    /// First registration error; it wins over the exception it caused.
    pub error: Option<ConfigurationError>,
    pub sealed: bool,
}

impl Registry {
    fn fail(&mut self, err: ConfigurationError) -> String {
        let message = err.to_string();
        self.error.get_or_insert(err);
        message
    }
}

pub(crate) type SharedRegistry = Rc<RefCell<Registry>>;

pub(crate) fn strict_source(source: &str) -> String {
    format!("\"use strict\";\n{}", source)
}

pub(crate) fn script_error(origin: &str, err: CaughtError<'_>) -> ConfigurationError {
    ConfigurationError::Script {
        origin: origin.to_string(),
        message: err.to_string(),
    }
}

/// Install `scenario` and `deluge`.
pub(crate) fn register_registry<'js>(ctx: &Ctx<'js>, registry: SharedRegistry) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let scenarios = registry.clone();
    globals.set(
        "scenario",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: String, description: String, body: Function<'js>| -> rquickjs::Result<()> {
                let mut registry = scenarios.borrow_mut();
                if registry.sealed {
                    return Err(Exception::throw_message(
                        &ctx,
                        "scenario() can only be called while the script is loading",
                    ));
                }
                if registry.bodies.contains_key(&id) {
                    let message = registry.fail(ConfigurationError::DuplicateScenario(id));
                    return Err(Exception::throw_message(&ctx, &message));
                }
                registry.defined.push((id.clone(), description));
                registry.bodies.insert(id, Persistent::save(&ctx, body));
                Ok(())
            },
        )?,
    )?;

    globals.set(
        "deluge",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, second: Value<'js>, third: Opt<Value<'js>>| -> rquickjs::Result<()> {
                let second = convert::to_json(&ctx, &second)?;
                let third = third.0.map(|v| convert::to_json(&ctx, &v)).transpose()?;

                let decl = match (second, third) {
                    (config, None) => DelugeDecl { name, duration: None, config },
                    (serde_json::Value::String(duration), Some(config)) => DelugeDecl {
                        name,
                        duration: Some(duration),
                        config,
                    },
                    (serde_json::Value::Null, Some(config)) => DelugeDecl { name, duration: None, config },
                    (other, Some(_)) => {
                        let message = registry.borrow_mut().fail(ConfigurationError::InvalidDeluge(format!(
                            "duration must be a string, got {}",
                            other
                        )));
                        return Err(Exception::throw_type(&ctx, &message));
                    }
                };

                let mut registry = registry.borrow_mut();
                if registry.sealed {
                    return Err(Exception::throw_message(
                        &ctx,
                        "deluge() can only be called while the script is loading",
                    ));
                }
                if let Some(previous) = &registry.deluge {
                    let err = ConfigurationError::DuplicateDeluge(decl.name, previous.name.clone());
                    let message = registry.fail(err);
                    return Err(Exception::throw_message(&ctx, &message));
                }
                registry.deluge = Some(decl);
                Ok(())
            },
        )?,
    )?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct IterationResult {
    pub iteration: u64,
    pub started_at: Instant,
    pub duration: Duration,
    pub outcome: Result<(), IterationFailure>,
}

impl IterationResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A virtual user's private script interpreter.
pub struct ScriptRuntime {
    scenario: Arc<str>,
    body: Option<Persistent<Function<'static>>>,
    args: Option<Persistent<Value<'static>>>,
    state: SharedState,
    cancel: CancellationToken,
    // Field order matters: the context must go before its runtime.
    context: Context,
    runtime: Runtime,
}

impl ScriptRuntime {
    /// Evaluate `source` and bind the body of `scenario`.
    ///
    /// Must be called from a thread that is not driving the Tokio runtime behind
    /// `bindings.handle`; the bindings block on it.
    pub fn new(
        source: &str,
        origin: &str,
        args: &serde_json::Value,
        bindings: Bindings,
        limits: RuntimeLimits,
    ) -> Result<Self, ConfigurationError> {
        let engine_err = |e: rquickjs::Error| ConfigurationError::Engine(e.to_string());

        let runtime = Runtime::new().map_err(engine_err)?;
        runtime.set_memory_limit(limits.memory_limit);
        runtime.set_max_stack_size(limits.stack_size);
        let interrupt = bindings.cancel.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.is_cancelled())));
        let context = Context::full(&runtime).map_err(engine_err)?;

        let scenario = bindings.scenario.clone();
        let cancel = bindings.cancel.clone();
        let state: SharedState = Rc::new(RefCell::new(IterationState::default()));
        let registry: SharedRegistry = Rc::new(RefCell::new(Registry::default()));

        let loaded = context.with(|ctx| {
            let install = helpers::register_sync(&ctx)
                .and_then(|_| check::register_sync(&ctx, state.clone()))
                .and_then(|_| timers::register_sync(&ctx, &bindings, state.clone()))
                .and_then(|_| http::register_sync(&ctx, &bindings, state.clone()))
                .and_then(|_| register_registry(&ctx, registry.clone()));
            install.catch(&ctx).map_err(|e| script_error(origin, e))?;

            ctx.eval::<(), _>(strict_source(source))
                .catch(&ctx)
                .map_err(|e| script_error(origin, e))?;

            let mut registry = registry.borrow_mut();
            registry.sealed = true;
            let body = registry
                .bodies
                .remove(scenario.as_ref())
                .ok_or_else(|| ConfigurationError::UnknownScenario(scenario.to_string()))?;

            let args = convert::from_json_frozen(&ctx, args)
                .catch(&ctx)
                .map_err(|e| script_error(origin, e))?;
            Ok::<_, ConfigurationError>((body, Persistent::save(&ctx, args)))
        });

        // Bodies of other scenarios must not outlive the runtime.
        registry.borrow_mut().bodies.clear();

        let (body, args) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                runtime.run_gc();
                return Err(err);
            }
        };

        Ok(Self {
            scenario,
            body: Some(body),
            args: Some(args),
            state,
            cancel,
            context,
            runtime,
        })
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Run the scenario body once. The session is handed to the body and whatever the
    /// body left in it is written back, even when the iteration failed.
    pub fn execute(&mut self, session: &mut Session, iteration: u64) -> IterationResult {
        {
            let mut state = self.state.borrow_mut();
            state.iteration = iteration;
            state.assertion = None;
            state.cancelled = false;
        }

        let started_at = Instant::now();
        let result = match (&self.body, &self.args) {
            (Some(body), Some(args)) => self
                .context
                .with(|ctx| run_body(&ctx, body.clone(), args.clone(), session)),
            _ => Err("scenario body is not loaded".to_string()),
        };
        let duration = started_at.elapsed();

        IterationResult {
            iteration,
            started_at,
            duration,
            outcome: self.classify(result),
        }
    }

    fn classify(&self, result: Result<(), String>) -> Result<(), IterationFailure> {
        let state = self.state.borrow();
        if state.cancelled || (result.is_err() && self.cancel.is_cancelled()) {
            return Err(IterationFailure::Cancelled);
        }
        if let Some(message) = &state.assertion {
            return Err(IterationFailure::AssertionFailure(message.clone()));
        }
        result.map_err(IterationFailure::ScriptError)
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.body.take();
        self.args.take();
        self.runtime.run_gc();
    }
}

fn run_body<'js>(
    ctx: &Ctx<'js>,
    body: Persistent<Function<'static>>,
    args: Persistent<Value<'static>>,
    session: &mut Session,
) -> Result<(), String> {
    let describe = |e: CaughtError<'js>| e.to_string();

    let body = body.restore(ctx).catch(ctx).map_err(describe)?;
    let args = args.restore(ctx).catch(ctx).map_err(describe)?;
    let session_value = serde_json::Value::Object(session.as_map().clone());
    let session_obj = convert::from_json(ctx, &session_value)
        .catch(ctx)
        .map_err(describe)?;

    let called = body
        .call::<_, Value>((args, session_obj.clone()))
        .and_then(settle)
        .catch(ctx)
        .map_err(describe);

    match convert::to_json(ctx, &session_obj).catch(ctx) {
        Ok(serde_json::Value::Object(values)) => session.replace(values),
        Ok(_) => {}
        Err(e) => return called.and(Err(format!("session is not serializable: {}", e))),
    }
    called
}

/// An `async` body returns a promise; drive the job queue until it settles.
fn settle(returned: Value<'_>) -> rquickjs::Result<()> {
    let Some(promise) = returned.into_promise() else {
        return Ok(());
    };
    match promise.finish::<Value>() {
        Ok(_) => Ok(()),
        Err(rquickjs::Error::WouldBlock) => Err(Exception::throw_message(
            promise.ctx(),
            "scenario body returned a promise that never settles",
        )),
        Err(e) => Err(e),
    }
}

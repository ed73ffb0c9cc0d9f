//! Session orchestrator: owns one script run end to end.
//!
//! Order of a run:
//!   1. fresh isolate, `console` and `module()` bound to this run's accountant
//!   2. host init hook, then the data binding, then module aliases
//!   3. start the timer governor, evaluate the script
//!   4. stop the governor (every exit path), collect value or error + stats

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use alertscript_core::{Abort, EvalContext, Interrupt};
use serde_json::Value;

use crate::accounting::{AccountingLimits, RunAccountant, RunState, RunStats};
use crate::cap_registry::CapRegistry;
use crate::config::RunConfig;
use crate::engine::{Bridge, Engine, V8Interrupter};
use crate::errors::RunError;
use crate::governor::TimerGovernor;

/// Result of one run: exactly one of value or error, plus its counters.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub result: Result<Value, RunError>,
    pub stats: RunStats,
}

impl RunReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Value, RunError> {
        self.result
    }
}

/// Runs scripts against a shared, read-only capability registry.
///
/// `Sandbox` is `Send + Sync`; each `run` builds its own isolate, state and
/// timers on the calling thread, so concurrent runs share nothing else.
#[derive(Clone)]
pub struct Sandbox {
    registry: Arc<CapRegistry>,
}

impl Sandbox {
    pub fn new(registry: Arc<CapRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapRegistry {
        &self.registry
    }

    pub fn run(&self, cf: RunConfig) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let logger = cf.logger.clone();

        tracing::info!(
            run_id = %run_id,
            trace = cf.trace.as_deref().unwrap_or("-"),
            dry_run = cf.dry_run,
            net_max = cf.limits.net_max,
            timeout_ms = cf.limits.timeout().as_millis() as u64,
            hard_timeout_ms = cf.limits.hard_timeout().as_millis() as u64,
            "sandbox.run.start"
        );

        let state = Rc::new(RefCell::new(RunState::default()));
        let result = self.execute(&run_id, cf, &state);

        let stats = {
            let mut st = state.borrow_mut();
            if let Some(gov) = st.governor.as_mut() {
                gov.stop();
            }
            let active = st.governor.as_ref().map(|g| g.active_time()).unwrap_or_default();
            st.stats.active_time = active;
            st.stats.elapsed = started.elapsed();
            st.stats.clone()
        };

        match &result {
            Ok(_) => tracing::info!(
                run_id = %run_id,
                heavy = stats.heavy_calls,
                light = stats.light_calls,
                io_errors = stats.io_errors,
                io_ms = stats.io_time.as_millis() as u64,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "sandbox.run.end"
            ),
            Err(e) => {
                if let Some(logger) = &logger {
                    logger.error(&e.to_string());
                }
                tracing::warn!(
                    run_id = %run_id,
                    code = %e.code(),
                    error = %e,
                    heavy = stats.heavy_calls,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "sandbox.run.end"
                );
            }
        }

        RunReport {
            run_id,
            result,
            stats,
        }
    }

    fn execute(
        &self,
        run_id: &str,
        cf: RunConfig,
        state: &Rc<RefCell<RunState>>,
    ) -> Result<Value, RunError> {
        if cf.script.trim().is_empty() {
            return Err(RunError::config("script is empty"));
        }
        if let Some((name, _)) = &cf.data {
            if !is_identifier(name) {
                return Err(RunError::config(format!(
                    "data binding name {name:?} is not a valid identifier"
                )));
            }
        }

        let mut engine = Engine::new();
        let interrupter = Arc::new(V8Interrupter::new(engine.isolate_handle(), run_id));
        let ctx = EvalContext::new(run_id, interrupter.clone());
        let accountant = Rc::new(RunAccountant::new(
            ctx.clone(),
            state.clone(),
            AccountingLimits {
                net_max: cf.limits.net_max,
                net_timeout: cf.limits.net_timeout(),
                dry_run: cf.dry_run,
            },
            cf.logger.clone(),
            cf.trace.clone(),
        ));

        engine
            .install(Bridge {
                registry: self.registry.clone(),
                accountant,
                ctx: ctx.clone(),
                logger: cf.logger.clone(),
                instances: Vec::new(),
            })
            .map_err(|e| RunError::bootstrap(format!("bootstrap: {e}")))?;

        if let Err(e) = self.prepare(&mut engine, &cf.aliases, cf.init, cf.data) {
            return Err(match ctx.interrupted() {
                Some(abort) => abort.into(),
                None => RunError::bootstrap(e.to_string()),
            });
        }

        let on_fire = {
            let interrupter = interrupter.clone();
            let run_id = run_id.to_string();
            move || {
                tracing::warn!(run_id = %run_id, "sandbox.alarm.fired");
                interrupter.interrupt(Abort::Timeout);
            }
        };
        let governor = TimerGovernor::start(cf.limits.timeout(), cf.limits.hard_timeout(), on_fire)
            .map_err(|e| RunError::Internal(format!("alarm: {e}")))?;
        state.borrow_mut().governor = Some(governor);

        let outcome = engine.execute("[alertscript:script]", cf.script);

        // The alarm must be quiet before the latch is read.
        if let Some(gov) = state.borrow_mut().governor.as_mut() {
            gov.stop();
        }
        settle(outcome, ctx.interrupted())
    }

    /// Init hook, data binding, aliases. Runs before any budget is armed.
    fn prepare(
        &self,
        engine: &mut Engine,
        aliases: &[(String, String)],
        init: Option<crate::config::InitHook>,
        data: Option<(String, Value)>,
    ) -> anyhow::Result<()> {
        if let Some(init) = init {
            init(&mut engine.scope())?;
        }
        if let Some((name, value)) = data {
            engine.scope().define(&name, &value)?;
        }
        for (global, module) in aliases {
            if !self.registry.contains(module) {
                tracing::debug!(alias = %global, module = %module, "sandbox.alias.skipped");
                continue;
            }
            let source = format!(
                "globalThis[{}] = module({}); void 0;",
                serde_json::to_string(global)?,
                serde_json::to_string(module)?
            );
            engine.scope().eval("[alertscript:alias]", source)?;
        }
        Ok(())
    }
}

/// Combine the script's outcome with the interrupt latch.
///
/// A latched abort wins over whatever the script returned, with one
/// exception: a timeout that fired after the script had already produced a
/// value lost the race and the value stands. Capability aborts are raised
/// by the script's own calls and always win.
fn settle(outcome: anyhow::Result<Value>, latched: Option<Abort>) -> Result<Value, RunError> {
    match (outcome, latched) {
        (Ok(value), Some(Abort::Timeout)) | (Ok(value), None) => Ok(value),
        (_, Some(abort)) => Err(abort.into()),
        (Err(e), None) => Err(RunError::Script(e.to_string())),
    }
}

/// ASCII JavaScript identifier: `[A-Za-z_$][A-Za-z0-9_$]*`.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

//! Capability contract for the alertscript sandbox.
//!
//! Defines everything a capability module sees of a script run: the
//! [`Accountant`] (budgets, timers, logging, dry-run), the [`EvalContext`] it
//! may interrupt, the [`IoGuard`] returned for every accounted I/O call, and
//! the [`Capability`] trait its instances implement.
//!
//! Capability crates depend on this crate only; the engine, timers and
//! registry live in `alertscript-runner`.

use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[cfg(feature = "testing")]
pub mod testing;

// ---------------------------------------------------------------------------
// Abort: conditions that pre-empt a running script
// ---------------------------------------------------------------------------

/// Reason an evaluation was interrupted.
///
/// Only these conditions pre-empt a script; everything else surfaces as an
/// ordinary exception inside the script.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Abort {
    #[error("timeout - maximum runtime exceeded")]
    Timeout,

    #[error("maximum number of network requests exceeded (limit {limit})")]
    NetLimit { limit: u32 },

    #[error("module not found: '{0}'")]
    ModuleNotFound(String),

    /// A capability decided its error is unrecoverable.
    #[error("{0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// Interrupt + EvalContext
// ---------------------------------------------------------------------------

/// Asynchronous interruption of an in-flight evaluation.
///
/// Implementations must be callable from any thread: the alarm fires from
/// its own thread while the script is running.
pub trait Interrupt: Send + Sync {
    /// Abort the evaluation at its next checkpoint. The first reason wins.
    fn interrupt(&self, reason: Abort);

    /// The reason recorded by the first `interrupt` call, if any.
    fn reason(&self) -> Option<Abort>;
}

/// Records the first interrupt reason and does nothing else.
///
/// Engines wrap it to add their own termination hook; on its own it is
/// enough for tests and for hosts that poll.
#[derive(Debug, Default)]
pub struct LatchInterrupt {
    reason: Mutex<Option<Abort>>,
}

impl LatchInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `reason` unless one is already latched. Returns true when this
    /// call latched.
    pub fn latch(&self, reason: Abort) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        true
    }
}

impl Interrupt for LatchInterrupt {
    fn interrupt(&self, reason: Abort) {
        self.latch(reason);
    }

    fn reason(&self) -> Option<Abort> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// The slice of the evaluation context a capability may touch while the
/// script is blocked inside one of its calls.
#[derive(Clone)]
pub struct EvalContext {
    run_id: Arc<str>,
    interrupt: Arc<dyn Interrupt>,
}

impl EvalContext {
    pub fn new(run_id: impl Into<Arc<str>>, interrupt: Arc<dyn Interrupt>) -> Self {
        Self {
            run_id: run_id.into(),
            interrupt,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn interrupt(&self, reason: Abort) {
        self.interrupt.interrupt(reason);
    }

    pub fn interrupted(&self) -> Option<Abort> {
        self.interrupt.reason()
    }
}

impl fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("run_id", &self.run_id)
            .field("interrupted", &self.interrupted())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// IoGuard: completion token for accounted I/O
// ---------------------------------------------------------------------------

/// Completion token for one heavy or light I/O call.
///
/// Completing it (explicitly with [`IoGuard::finish`] or by dropping it)
/// records the wait and resumes the script clock. It completes exactly once.
#[must_use = "dropping the guard immediately ends the I/O window"]
pub struct IoGuard {
    started: Instant,
    on_done: Option<Box<dyn FnOnce(Duration)>>,
}

impl IoGuard {
    pub fn new(on_done: impl FnOnce(Duration) + 'static) -> Self {
        Self {
            started: Instant::now(),
            on_done: Some(Box::new(on_done)),
        }
    }

    /// Ends the I/O window and returns how long it lasted.
    pub fn finish(mut self) -> Duration {
        self.complete()
    }

    fn complete(&mut self) -> Duration {
        let waited = self.started.elapsed();
        if let Some(done) = self.on_done.take() {
            done(waited);
        }
        waited
    }
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

impl fmt::Debug for IoGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoGuard")
            .field("elapsed", &self.started.elapsed())
            .field("pending", &self.on_done.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Accountant: the only surface capability code touches
// ---------------------------------------------------------------------------

/// Per-run accounting handle handed to every capability factory.
///
/// Thread-confined to the run it belongs to; shared by reference across all
/// capability instances created within that run.
pub trait Accountant {
    /// The evaluation context of the current run.
    fn context(&self) -> &EvalContext;

    /// Acquire a token for an outbound call crossing an external network
    /// boundary. Counts against the run's cap; once the cap is exhausted the
    /// run is interrupted and `Err` is returned.
    fn net_io_heavy(&self) -> Result<IoGuard, Abort>;

    /// Acquire a token for an intra-perimeter call. Counted, never capped.
    fn net_io_light(&self) -> IoGuard;

    /// Count an I/O-level failure without aborting.
    fn net_io_err(&self);

    /// Count and log a non-fatal error.
    fn error(&self, err: &dyn fmt::Display);

    /// Count and log an error, then interrupt the run.
    fn fatal(&self, err: &dyn fmt::Display);

    /// Advisory: skip real external effects and return synthetic results.
    fn is_dry_run(&self) -> bool;

    /// Timeout every network client must honor.
    fn net_timeout(&self) -> Duration;

    /// User-facing log line.
    fn verbose(&self, msg: &str);

    /// Troubleshooting detail.
    fn diag(&self, msg: &str);

    /// Correlation string for tagging outbound requests.
    fn trace_info(&self) -> Option<&str>;
}

// ---------------------------------------------------------------------------
// Capability: what `module(name, ...)` hands to the script
// ---------------------------------------------------------------------------

/// An instance produced by a capability factory.
///
/// Its methods are the capability's public surface. Dotted names
/// (`"std.encode"`) become nested objects on the script side.
pub trait Capability {
    fn methods(&self) -> &[&'static str];

    /// Invoke `method` with positional arguments exported from the script.
    /// Errors are thrown into the script as exceptions.
    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// Builds a capability instance for one run.
pub type Factory = dyn Fn(Rc<dyn Accountant>, &EvalContext, &[Value]) -> anyhow::Result<Box<dyn Capability>>
    + Send
    + Sync;

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Decode positional argument `index`; a missing argument decodes as `null`
/// so `Option<T>` parameters may be omitted.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<T> {
    let raw = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| anyhow::anyhow!("argument {}: {e}", index + 1))
}

/// Encode a result for the script.
pub fn to_value<T: Serialize>(value: &T) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn latch_keeps_first_reason() {
        let latch = LatchInterrupt::new();
        assert!(latch.latch(Abort::Timeout));
        assert!(!latch.latch(Abort::Fatal("later".into())));
        assert_eq!(latch.reason(), Some(Abort::Timeout));
    }

    #[test]
    fn eval_context_forwards_interrupts() {
        let ctx = EvalContext::new("run-1", Arc::new(LatchInterrupt::new()));
        assert_eq!(ctx.interrupted(), None);
        ctx.interrupt(Abort::ModuleNotFound("ext/nope".into()));
        assert_eq!(ctx.interrupted(), Some(Abort::ModuleNotFound("ext/nope".into())));
        assert_eq!(ctx.run_id(), "run-1");
    }

    #[test]
    fn io_guard_completes_exactly_once() {
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let guard = IoGuard::new(move |_| seen.set(seen.get() + 1));
        guard.finish();
        assert_eq!(calls.get(), 1);

        let seen = calls.clone();
        {
            let _guard = IoGuard::new(move |_| seen.set(seen.get() + 1));
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn arg_missing_is_null() {
        let args = vec![Value::String("a".into())];
        let first: String = arg(&args, 0).unwrap();
        let second: Option<String> = arg(&args, 1).unwrap();
        assert_eq!(first, "a");
        assert!(second.is_none());
        let err = arg::<u32>(&args, 0).unwrap_err();
        assert!(err.to_string().starts_with("argument 1"));
    }

    #[test]
    fn abort_messages() {
        assert_eq!(Abort::Timeout.to_string(), "timeout - maximum runtime exceeded");
        assert_eq!(
            Abort::NetLimit { limit: 2 }.to_string(),
            "maximum number of network requests exceeded (limit 2)"
        );
        assert_eq!(
            Abort::ModuleNotFound("x".into()).to_string(),
            "module not found: 'x'"
        );
    }
}

//! Per-run resource accounting: heavy/light I/O counters, the heavy cap,
//! I/O wait time, and the [`Accountant`] handed to capability factories.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use alertscript_core::{Abort, Accountant, EvalContext, IoGuard};
use serde::Serialize;

use crate::governor::TimerGovernor;
use crate::logger::Logger;

/// Counters reported with every run, successful or not.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub heavy_calls: u32,
    pub light_calls: u32,
    pub io_errors: u32,
    #[serde(rename = "io_time_ms", serialize_with = "as_millis")]
    pub io_time: Duration,
    #[serde(rename = "active_time_ms", serialize_with = "as_millis")]
    pub active_time: Duration,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Mutable state of one run. Owned by the orchestrator, never shared across
/// runs.
#[derive(Default)]
pub(crate) struct RunState {
    pub stats: RunStats,
    /// Armed just before the script body executes; absent during bootstrap.
    pub governor: Option<TimerGovernor>,
}

impl RunState {
    fn suspend(&mut self) {
        if let Some(gov) = self.governor.as_mut() {
            gov.suspend();
        }
    }

    fn resume(&mut self, waited: Duration) {
        self.stats.io_time += waited;
        if let Some(gov) = self.governor.as_mut() {
            gov.resume();
        }
    }
}

/// Limits the accountant enforces or advertises.
#[derive(Clone, Debug)]
pub(crate) struct AccountingLimits {
    pub net_max: u32,
    pub net_timeout: Duration,
    pub dry_run: bool,
}

pub(crate) struct RunAccountant {
    ctx: EvalContext,
    state: Rc<RefCell<RunState>>,
    limits: AccountingLimits,
    logger: Option<Arc<dyn Logger>>,
    trace: Option<String>,
}

impl RunAccountant {
    pub fn new(
        ctx: EvalContext,
        state: Rc<RefCell<RunState>>,
        limits: AccountingLimits,
        logger: Option<Arc<dyn Logger>>,
        trace: Option<String>,
    ) -> Self {
        Self {
            ctx,
            state,
            limits,
            logger,
            trace,
        }
    }

    fn window(&self) -> IoGuard {
        self.state.borrow_mut().suspend();
        let state = self.state.clone();
        IoGuard::new(move |waited| state.borrow_mut().resume(waited))
    }

    fn count_error(&self) {
        self.state.borrow_mut().stats.io_errors += 1;
    }

    fn log_error(&self, err: &dyn fmt::Display) {
        if let Some(logger) = &self.logger {
            logger.error(&err.to_string());
        }
    }
}

impl Accountant for RunAccountant {
    fn context(&self) -> &EvalContext {
        &self.ctx
    }

    fn net_io_heavy(&self) -> Result<IoGuard, Abort> {
        let calls = {
            let mut st = self.state.borrow_mut();
            st.stats.heavy_calls += 1;
            st.stats.heavy_calls
        };
        if calls > self.limits.net_max {
            let abort = Abort::NetLimit {
                limit: self.limits.net_max,
            };
            tracing::warn!(
                run_id = %self.ctx.run_id(),
                calls,
                limit = self.limits.net_max,
                "sandbox.io.refused"
            );
            self.ctx.interrupt(abort.clone());
            return Err(abort);
        }
        tracing::debug!(run_id = %self.ctx.run_id(), calls, "sandbox.io.heavy");
        Ok(self.window())
    }

    fn net_io_light(&self) -> IoGuard {
        let calls = {
            let mut st = self.state.borrow_mut();
            st.stats.light_calls += 1;
            st.stats.light_calls
        };
        tracing::trace!(run_id = %self.ctx.run_id(), calls, "sandbox.io.light");
        self.window()
    }

    fn net_io_err(&self) {
        self.count_error();
    }

    fn error(&self, err: &dyn fmt::Display) {
        self.count_error();
        self.log_error(err);
    }

    fn fatal(&self, err: &dyn fmt::Display) {
        self.count_error();
        self.log_error(err);
        tracing::warn!(run_id = %self.ctx.run_id(), error = %err, "sandbox.fatal");
        self.ctx.interrupt(Abort::Fatal(err.to_string()));
    }

    fn is_dry_run(&self) -> bool {
        self.limits.dry_run
    }

    fn net_timeout(&self) -> Duration {
        self.limits.net_timeout
    }

    fn verbose(&self, msg: &str) {
        if let Some(logger) = &self.logger {
            logger.verbose(msg);
        }
    }

    fn diag(&self, msg: &str) {
        if let Some(logger) = &self.logger {
            logger.debug(msg);
        }
    }

    fn trace_info(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::Phase;
    use alertscript_core::LatchInterrupt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl Logger for Lines {
        fn verbose(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("v {msg}"));
        }
        fn debug(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("d {msg}"));
        }
        fn error(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("e {msg}"));
        }
    }

    fn accountant(
        net_max: u32,
        logger: Option<Arc<dyn Logger>>,
    ) -> (RunAccountant, Rc<RefCell<RunState>>) {
        let state = Rc::new(RefCell::new(RunState::default()));
        let ctx = EvalContext::new("acct-test", Arc::new(LatchInterrupt::new()));
        let acct = RunAccountant::new(
            ctx,
            state.clone(),
            AccountingLimits {
                net_max,
                net_timeout: Duration::from_secs(1),
                dry_run: false,
            },
            logger,
            Some("trace-1".into()),
        );
        (acct, state)
    }

    #[test]
    fn heavy_cap_refuses_the_next_call_and_interrupts() {
        let (acct, state) = accountant(2, None);
        acct.net_io_heavy().unwrap().finish();
        acct.net_io_heavy().unwrap().finish();
        assert_eq!(acct.net_io_heavy().unwrap_err(), Abort::NetLimit { limit: 2 });
        assert_eq!(acct.context().interrupted(), Some(Abort::NetLimit { limit: 2 }));
        assert_eq!(state.borrow().stats.heavy_calls, 3);
    }

    #[test]
    fn zero_cap_refuses_first_call() {
        let (acct, _state) = accountant(0, None);
        assert!(acct.net_io_heavy().is_err());
    }

    #[test]
    fn light_calls_are_never_capped() {
        let (acct, state) = accountant(0, None);
        for _ in 0..5 {
            acct.net_io_light().finish();
        }
        assert_eq!(state.borrow().stats.light_calls, 5);
        assert!(acct.context().interrupted().is_none());
    }

    #[test]
    fn guard_suspends_governor_and_records_wait() {
        let (acct, state) = accountant(1, None);
        state.borrow_mut().governor = Some(
            TimerGovernor::start(Duration::from_secs(5), Duration::from_secs(10), || {}).unwrap(),
        );
        let guard = acct.net_io_heavy().unwrap();
        assert_eq!(
            state.borrow().governor.as_ref().unwrap().phase(),
            Phase::Suspended
        );
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        let st = state.borrow();
        assert_eq!(st.governor.as_ref().unwrap().phase(), Phase::Running);
        assert!(st.stats.io_time >= Duration::from_millis(20));
    }

    #[test]
    fn error_fatal_and_logging() {
        let lines = Arc::new(Lines::default());
        let (acct, state) = accountant(1, Some(lines.clone()));
        acct.net_io_err();
        acct.error(&"soft failure");
        assert!(acct.context().interrupted().is_none());
        acct.fatal(&"hard failure");
        assert_eq!(
            acct.context().interrupted(),
            Some(Abort::Fatal("hard failure".into()))
        );
        acct.verbose("hello");
        acct.diag("detail");
        assert_eq!(state.borrow().stats.io_errors, 3);
        assert_eq!(
            *lines.0.lock().unwrap(),
            vec!["e soft failure", "e hard failure", "v hello", "d detail"]
        );
        assert_eq!(acct.trace_info(), Some("trace-1"));
    }

    #[test]
    fn stats_serialize_in_millis() {
        let stats = RunStats {
            heavy_calls: 1,
            io_time: Duration::from_millis(1500),
            ..Default::default()
        };
        let j = serde_json::to_value(&stats).unwrap();
        assert_eq!(j["heavy_calls"], 1);
        assert_eq!(j["io_time_ms"], 1500);
        assert_eq!(j["elapsed_ms"], 0);
    }
}

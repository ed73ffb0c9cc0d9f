//! Recording `Accountant` double for capability tests (feature `testing`).
//!
//! No timers, no engine: heavy/light acquisitions are counted, logs are
//! captured, interrupts are latched.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::{Abort, Accountant, EvalContext, IoGuard, LatchInterrupt};

pub struct RecordingAccountant {
    ctx: EvalContext,
    dry_run: bool,
    net_max: u32,
    trace: Option<String>,
    pub heavy: Cell<u32>,
    pub light: Cell<u32>,
    pub io_errors: Cell<u32>,
    /// Completed I/O windows.
    pub completed: Rc<Cell<u32>>,
    pub lines: RefCell<Vec<String>>,
}

impl RecordingAccountant {
    pub fn new(dry_run: bool) -> Self {
        Self {
            ctx: EvalContext::new("test-run", Arc::new(LatchInterrupt::new())),
            dry_run,
            net_max: u32::MAX,
            trace: None,
            heavy: Cell::new(0),
            light: Cell::new(0),
            io_errors: Cell::new(0),
            completed: Rc::new(Cell::new(0)),
            lines: RefCell::new(vec![]),
        }
    }

    pub fn with_net_max(mut self, max: u32) -> Self {
        self.net_max = max;
        self
    }

    pub fn with_trace(mut self, trace: &str) -> Self {
        self.trace = Some(trace.to_string());
        self
    }

    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    pub fn interrupted(&self) -> Option<Abort> {
        self.ctx.interrupted()
    }

    fn guard(&self) -> IoGuard {
        let completed = self.completed.clone();
        IoGuard::new(move |_| completed.set(completed.get() + 1))
    }

    fn push(&self, line: String) {
        self.lines.borrow_mut().push(line);
    }
}

impl Accountant for RecordingAccountant {
    fn context(&self) -> &EvalContext {
        &self.ctx
    }

    fn net_io_heavy(&self) -> Result<IoGuard, Abort> {
        self.heavy.set(self.heavy.get() + 1);
        if self.heavy.get() > self.net_max {
            let abort = Abort::NetLimit { limit: self.net_max };
            self.ctx.interrupt(abort.clone());
            return Err(abort);
        }
        Ok(self.guard())
    }

    fn net_io_light(&self) -> IoGuard {
        self.light.set(self.light.get() + 1);
        self.guard()
    }

    fn net_io_err(&self) {
        self.io_errors.set(self.io_errors.get() + 1);
    }

    fn error(&self, err: &dyn fmt::Display) {
        self.net_io_err();
        self.push(format!("error: {err}"));
    }

    fn fatal(&self, err: &dyn fmt::Display) {
        self.net_io_err();
        self.push(format!("fatal: {err}"));
        self.ctx.interrupt(Abort::Fatal(err.to_string()));
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn net_timeout(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn verbose(&self, msg: &str) {
        self.push(format!("verbose: {msg}"));
    }

    fn diag(&self, msg: &str) {
        self.push(format!("diag: {msg}"));
    }

    fn trace_info(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

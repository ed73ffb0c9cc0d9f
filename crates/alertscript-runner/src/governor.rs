//! Timer governor: one alarm, repointed between the soft budget and the hard
//! ceiling as the script enters and leaves blocking I/O.
//!
//! ```text
//!            suspend (I/O starts)
//!   Running ───────────────────────▶ Suspended
//!   alarm = soft − active            alarm = start + hard − now
//!           ◀───────────────────────
//!            resume (I/O done)
//! ```
//!
//! The alarm lives on its own thread so it can fire while the script's thread
//! is blocked. Firing is one-shot; whatever happens after is the engine's
//! business.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Script code executing; soft clock active.
    Running,
    /// Script blocked in a capability's I/O; only the hard clock advances.
    Suspended,
}

// ---------------------------------------------------------------------------
// Alarm
// ---------------------------------------------------------------------------

struct AlarmState {
    deadline: Instant,
    stopped: bool,
    fired: bool,
}

struct AlarmShared {
    state: Mutex<AlarmState>,
    wake: Condvar,
}

impl AlarmShared {
    fn lock(&self) -> MutexGuard<'_, AlarmState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn watch(&self, on_fire: impl FnOnce()) {
        let mut st = self.lock();
        loop {
            if st.stopped {
                return;
            }
            let now = Instant::now();
            if now >= st.deadline {
                st.fired = true;
                drop(st);
                on_fire();
                return;
            }
            let wait = st.deadline - now;
            st = match self.wake.wait_timeout(st, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// A single schedulable alarm that can be re-armed any number of times
/// before it fires.
pub(crate) struct Alarm {
    shared: Arc<AlarmShared>,
    thread: Option<JoinHandle<()>>,
}

impl Alarm {
    pub(crate) fn arm(
        after: Duration,
        on_fire: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(AlarmShared {
            state: Mutex::new(AlarmState {
                deadline: deadline_after(after),
                stopped: false,
                fired: false,
            }),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("alertscript-alarm".into())
            .spawn(move || worker.watch(on_fire))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Repoint the alarm to fire `after` from now.
    pub(crate) fn reset(&self, after: Duration) {
        let mut st = self.shared.lock();
        st.deadline = deadline_after(after);
        self.shared.wake.notify_one();
    }

    pub(crate) fn fired(&self) -> bool {
        self.shared.lock().fired
    }

    /// Disarm and wait for the alarm thread to exit. Idempotent.
    pub(crate) fn stop(&mut self) {
        {
            let mut st = self.shared.lock();
            st.stopped = true;
            self.shared.wake.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("alarm thread panicked");
            }
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

// ---------------------------------------------------------------------------
// TimerGovernor
// ---------------------------------------------------------------------------

/// Soft budget left after `active` running time, floored at zero.
pub(crate) fn soft_remaining(soft: Duration, active: Duration) -> Duration {
    soft.saturating_sub(active)
}

/// Hard ceiling left at `now` for a run started at `started`, floored at zero.
pub(crate) fn hard_remaining(started: Instant, hard: Duration, now: Instant) -> Duration {
    match started.checked_add(hard) {
        Some(ceiling) => ceiling.saturating_duration_since(now),
        None => hard,
    }
}

pub struct TimerGovernor {
    soft: Duration,
    hard: Duration,
    started: Instant,
    resumed_at: Instant,
    /// Running time accumulated up to `resumed_at`.
    active: Duration,
    /// Nested suspensions; only the outermost pair moves the alarm.
    depth: u32,
    alarm: Alarm,
}

impl TimerGovernor {
    /// Start in `Running` with the alarm armed at the soft budget.
    pub fn start(
        soft: Duration,
        hard: Duration,
        on_fire: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<Self> {
        let alarm = Alarm::arm(soft, on_fire)?;
        let now = Instant::now();
        Ok(Self {
            soft,
            hard,
            started: now,
            resumed_at: now,
            active: Duration::ZERO,
            depth: 0,
            alarm,
        })
    }

    pub fn phase(&self) -> Phase {
        if self.depth == 0 {
            Phase::Running
        } else {
            Phase::Suspended
        }
    }

    /// `Running → Suspended`: bank the running time, point the alarm at the
    /// hard ceiling.
    pub fn suspend(&mut self) {
        self.depth += 1;
        if self.depth > 1 {
            return;
        }
        let now = Instant::now();
        self.active += now.saturating_duration_since(self.resumed_at);
        self.resumed_at = now;
        let left = hard_remaining(self.started, self.hard, now);
        self.alarm.reset(left);
        tracing::trace!(
            active_ms = self.active.as_millis() as u64,
            hard_left_ms = left.as_millis() as u64,
            "governor.suspend"
        );
    }

    /// `Suspended → Running`: point the alarm at what is left of the soft
    /// budget. An exhausted budget fires immediately.
    pub fn resume(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return;
        }
        self.resumed_at = Instant::now();
        let left = soft_remaining(self.soft, self.active);
        self.alarm.reset(left);
        tracing::trace!(
            active_ms = self.active.as_millis() as u64,
            soft_left_ms = left.as_millis() as u64,
            "governor.resume"
        );
    }

    /// Running time so far, excluding I/O waits.
    pub fn active_time(&self) -> Duration {
        match self.phase() {
            Phase::Running => self.active + self.resumed_at.elapsed(),
            Phase::Suspended => self.active,
        }
    }

    /// Wall-clock time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn fired(&self) -> bool {
        self.alarm.fired()
    }

    pub fn stop(&mut self) {
        self.alarm.stop();
    }
}

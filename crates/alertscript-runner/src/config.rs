//! Run configuration.
//!
//! [`Limits`] is the serializable budget part (milliseconds, zero means
//! default) so hosts can keep it in their own config files; [`RunConfig`]
//! adds the per-run inputs that only make sense in code.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ScriptScope;
use crate::logger::Logger;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_NET_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the alias installed for `std/web` when nothing else is configured.
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[("web", "std/web")];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Soft budget for active script time, excluding I/O waits.
    pub timeout_ms: u64,
    /// Absolute wall-clock ceiling from the start of the script.
    pub hard_timeout_ms: u64,
    /// Per-request timeout capabilities must honor.
    pub net_timeout_ms: u64,
    /// Heavy I/O calls allowed per run. Zero allows none.
    pub net_max: u32,
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        or_default(self.timeout_ms, DEFAULT_TIMEOUT)
    }

    pub fn hard_timeout(&self) -> Duration {
        or_default(self.hard_timeout_ms, DEFAULT_HARD_TIMEOUT)
    }

    pub fn net_timeout(&self) -> Duration {
        or_default(self.net_timeout_ms, DEFAULT_NET_TIMEOUT)
    }
}

fn or_default(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

/// Host hook run after the console and `module()` are installed and before
/// the data binding.
pub type InitHook = Box<dyn FnOnce(&mut ScriptScope<'_>) -> anyhow::Result<()> + Send>;

pub struct RunConfig {
    pub script: String,
    /// Global name and value of the data binding, e.g. `("event", {...})`.
    pub data: Option<(String, Value)>,
    pub limits: Limits,
    pub dry_run: bool,
    pub init: Option<InitHook>,
    pub logger: Option<Arc<dyn Logger>>,
    pub trace: Option<String>,
    /// `(global, module)` pairs evaluated as `var global = module('module')`
    /// before the script. Names not in the registry are skipped.
    pub aliases: Vec<(String, String)>,
}

impl RunConfig {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            data: None,
            limits: Limits::default(),
            dry_run: false,
            init: None,
            logger: None,
            trace: None,
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(g, m)| (g.to_string(), m.to_string()))
                .collect(),
        }
    }

    pub fn with_data(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data = Some((name.into(), value));
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, soft: Duration) -> Self {
        self.limits.timeout_ms = soft.as_millis() as u64;
        self
    }

    pub fn with_hard_timeout(mut self, hard: Duration) -> Self {
        self.limits.hard_timeout_ms = hard.as_millis() as u64;
        self
    }

    pub fn with_net_timeout(mut self, net: Duration) -> Self {
        self.limits.net_timeout_ms = net.as_millis() as u64;
        self
    }

    pub fn with_net_max(mut self, max: u32) -> Self {
        self.limits.net_max = max;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_init(
        mut self,
        hook: impl FnOnce(&mut ScriptScope<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.init = Some(Box::new(hook));
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_alias(mut self, global: impl Into<String>, module: impl Into<String>) -> Self {
        self.aliases.push((global.into(), module.into()));
        self
    }

    pub fn without_aliases(mut self) -> Self {
        self.aliases.clear();
        self
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("script_len", &self.script.len())
            .field("data", &self.data.as_ref().map(|(n, _)| n))
            .field("limits", &self.limits)
            .field("dry_run", &self.dry_run)
            .field("init", &self.init.is_some())
            .field("logger", &self.logger.is_some())
            .field("trace", &self.trace)
            .field("aliases", &self.aliases)
            .finish()
    }
}

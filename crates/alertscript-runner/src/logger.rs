//! Logger collaborator: where script-originated output goes.

/// Receives console output and capability diagnostics for one run.
///
/// Fire-and-forget; implementations must not block for long.
pub trait Logger: Send + Sync {
    /// User-facing output (`console.log`, `console.warn`).
    fn verbose(&self, msg: &str);
    /// Troubleshooting detail (`console.debug`, capability diagnostics).
    fn debug(&self, msg: &str);
    /// Errors from the script or its capabilities.
    fn error(&self, msg: &str);
}

/// Forwards script output into the host's `tracing` stream under the
/// `alertscript::script` target.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    tag: Option<String>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every event with `script = tag`, e.g. the script's file name.
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
        }
    }

    fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("-")
    }
}

impl Logger for TracingLogger {
    fn verbose(&self, msg: &str) {
        tracing::info!(target: "alertscript::script", script = %self.tag(), "{msg}");
    }

    fn debug(&self, msg: &str) {
        tracing::debug!(target: "alertscript::script", script = %self.tag(), "{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "alertscript::script", script = %self.tag(), "{msg}");
    }
}

//! Run error types.
//!
//! Every failed run maps to one `Err.<Category>.<Detail>` code with an
//! actionable hint, so hosts can surface failures without parsing messages.

use std::fmt;

use alertscript_core::Abort;

/// Structured error code following the `Err.<Category>.<Detail>` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // --- Config ---
    ConfigInvalid,
    ConfigBootstrap,

    // --- Budget ---
    BudgetTimeout,
    BudgetNetLimit,

    // --- Module / Capability ---
    ModuleNotFound,
    CapabilityFatal,

    // --- Script ---
    ScriptException,

    // --- Internal ---
    Internal,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Err.Config.Invalid",
            Self::ConfigBootstrap => "Err.Config.Bootstrap",
            Self::BudgetTimeout => "Err.Budget.Timeout",
            Self::BudgetNetLimit => "Err.Budget.NetLimit",
            Self::ModuleNotFound => "Err.Module.NotFound",
            Self::CapabilityFatal => "Err.Capability.Fatal",
            Self::ScriptException => "Err.Script.Exception",
            Self::Internal => "Err.Internal",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "The run configuration is invalid. Check that the script is non-empty and the data binding name is a plain identifier ([A-Za-z_$][A-Za-z0-9_$]*).",
            Self::ConfigBootstrap => "Setup before the script failed. Check the init hook, the data binding and the module aliases.",
            Self::BudgetTimeout => "The script ran past its time budget. Remove busy loops or raise timeout_ms; time blocked in network calls only counts against hard_timeout_ms.",
            Self::BudgetNetLimit => "The script made more outbound network calls than net_max allows. Batch requests or raise net_max.",
            Self::ModuleNotFound => "module() was called with a name nobody registered. Check the spelling or register the capability at start-up.",
            Self::CapabilityFatal => "A capability hit an unrecoverable error and stopped the run. See the logged error for the cause.",
            Self::ScriptException => "The script threw an uncaught exception or has a syntax error. Check the message for the line and cause.",
            Self::Internal => "The sandbox itself failed. Check host logs for details.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Why a run did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Bad input or a failure while preparing the context.
    #[error("config: {message}")]
    Config { code: ErrorCode, message: String },

    /// Pre-empted by a budget, an unknown module or a fatal capability error.
    #[error(transparent)]
    Aborted(#[from] Abort),

    /// The script threw, or its source failed to compile.
    #[error("{0}")]
    Script(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl RunError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: ErrorCode::ConfigInvalid,
            message: message.into(),
        }
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::Config {
            code: ErrorCode::ConfigBootstrap,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config { code, .. } => *code,
            Self::Aborted(Abort::Timeout) => ErrorCode::BudgetTimeout,
            Self::Aborted(Abort::NetLimit { .. }) => ErrorCode::BudgetNetLimit,
            Self::Aborted(Abort::ModuleNotFound(_)) => ErrorCode::ModuleNotFound,
            Self::Aborted(Abort::Fatal(_)) => ErrorCode::CapabilityFatal,
            Self::Script(_) => ErrorCode::ScriptException,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn hint(&self) -> &'static str {
        self.code().hint()
    }

    /// The budget/abort condition, if the run was pre-empted.
    pub fn abort(&self) -> Option<&Abort> {
        match self {
            Self::Aborted(a) => Some(a),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": {
                "code": self.code().code(),
                "message": self.to_string(),
                "hint": self.hint(),
            }
        })
    }
}

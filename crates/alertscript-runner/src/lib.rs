//! Execution governor for alert scripts.
//!
//! One [`Sandbox::run`] call owns one script run end to end: a fresh V8
//! isolate, the console bridge, the `module()` loader over a [`CapRegistry`],
//! the dual soft/hard timer and the heavy-I/O cap. Runs share nothing but the
//! registry.
//!
//! Capability crates only see `alertscript_core`; this crate is what a host
//! links to actually execute scripts.

pub mod accounting;
pub mod bindings;
pub mod cap_registry;
pub mod config;
pub mod console;
pub mod engine;
pub mod errors;
pub mod governor;
pub mod logger;
pub mod runner;

pub use accounting::RunStats;
pub use cap_registry::{CapRegistry, RegistryError};
pub use config::{InitHook, Limits, RunConfig};
pub use engine::ScriptScope;
pub use errors::RunError;
pub use logger::{Logger, TracingLogger};
pub use runner::{RunReport, Sandbox};

//! V8 glue: one `JsRuntime` per run, three ops, and the bootstrap script
//! that builds `console` and `module()` on top of them.
//!
//! Script values never reach `serde_v8` as live objects: console arguments
//! are formatted to strings in JS, module arguments travel as JSON text, and
//! the completion value is exported through `JSON.stringify`. A cyclic or
//! otherwise unexportable value surfaces as an exception instead of a
//! runaway recursion on the host stack.
//!
//! Capability instances live in the op state and are addressed from script
//! by an integer handle.

use std::rc::Rc;
use std::sync::Arc;

use alertscript_core::{Abort, Accountant, Capability, EvalContext, Interrupt, LatchInterrupt};
use deno_core::error::AnyError;
use deno_core::{op2, v8, JsRuntime, OpState, RuntimeOptions};
use serde::Serialize;
use serde_json::Value;

use crate::cap_registry::CapRegistry;
use crate::console::{self, Level};
use crate::logger::Logger;

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

/// Latches the first abort reason and terminates the isolate. Safe to call
/// from the alarm thread.
pub(crate) struct V8Interrupter {
    latch: LatchInterrupt,
    handle: v8::IsolateHandle,
    run_id: String,
}

impl V8Interrupter {
    pub fn new(handle: v8::IsolateHandle, run_id: &str) -> Self {
        Self {
            latch: LatchInterrupt::new(),
            handle,
            run_id: run_id.to_string(),
        }
    }
}

impl Interrupt for V8Interrupter {
    fn interrupt(&self, reason: Abort) {
        let msg = reason.to_string();
        if self.latch.latch(reason) {
            tracing::debug!(run_id = %self.run_id, reason = %msg, "sandbox.interrupt");
            self.handle.terminate_execution();
        }
    }

    fn reason(&self) -> Option<Abort> {
        self.latch.reason()
    }
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// Per-run state the ops reach through `OpState`.
pub(crate) struct Bridge {
    pub registry: Arc<CapRegistry>,
    pub accountant: Rc<dyn Accountant>,
    pub ctx: EvalContext,
    pub logger: Option<Arc<dyn Logger>>,
    pub instances: Vec<Box<dyn Capability>>,
}

#[derive(Serialize)]
struct Loaded {
    handle: u32,
    methods: Vec<&'static str>,
}

#[op2]
fn op_alert_console(state: &OpState, #[string] level: String, #[serde] parts: Vec<String>) {
    let bridge = state.borrow::<Bridge>();
    console::emit(bridge.logger.as_deref(), Level::from_method(&level), &parts);
}

fn parse_args(json: &str) -> Result<Vec<Value>, AnyError> {
    serde_json::from_str(json).map_err(|e| anyhow::anyhow!("module arguments: {e}"))
}

#[op2]
#[serde]
fn op_alert_module_load(
    state: &mut OpState,
    #[string] name: String,
    #[string] args: String,
) -> Result<Loaded, AnyError> {
    let args = parse_args(&args)?;
    let bridge = state.borrow_mut::<Bridge>();
    let factory = match bridge.registry.get(&name) {
        Some(entry) => entry.factory.clone(),
        None => {
            let abort = Abort::ModuleNotFound(name);
            bridge.ctx.interrupt(abort.clone());
            return Err(abort.into());
        }
    };
    let instance = factory(bridge.accountant.clone(), &bridge.ctx, &args)?;
    let methods = instance.methods().to_vec();
    bridge.instances.push(instance);
    tracing::trace!(run_id = %bridge.ctx.run_id(), module = %name, "sandbox.module.load");
    Ok(Loaded {
        handle: (bridge.instances.len() - 1) as u32,
        methods,
    })
}

#[op2]
#[serde]
fn op_alert_module_call(
    state: &mut OpState,
    handle: u32,
    #[string] method: String,
    #[string] args: String,
) -> Result<serde_json::Value, AnyError> {
    let args = parse_args(&args)?;
    let bridge = state.borrow_mut::<Bridge>();
    let instance = bridge
        .instances
        .get_mut(handle as usize)
        .ok_or_else(|| anyhow::anyhow!("invalid module handle {handle}"))?;
    instance.call(&method, args)
}

deno_core::extension!(
    alertscript_ext,
    ops = [op_alert_console, op_alert_module_load, op_alert_module_call],
);

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

const BOOTSTRAP: &str = r#"
((ops, preludes) => {
    const describe = (e) => `${e.name}: ${e.message}`;
    const format = (a) => {
        if (typeof a === 'string') return a;
        if (a instanceof Error) return describe(a);
        if (a === undefined || typeof a === 'function' || typeof a === 'symbol' || typeof a === 'bigint') {
            return String(a);
        }
        const seen = new WeakSet();
        try {
            return JSON.stringify(a, (_k, v) => {
                if (typeof v === 'bigint') return String(v);
                if (v instanceof Error) return describe(v);
                if (typeof v === 'object' && v !== null) {
                    if (seen.has(v)) return '[Circular]';
                    seen.add(v);
                }
                return v;
            });
        } catch (_) {
            try { return String(a); } catch (_) { return '[unprintable]'; }
        }
    };
    const emit = (level) => (...args) => ops.op_alert_console(level, args.map(format));
    globalThis.console = Object.freeze({
        log: emit('log'),
        info: emit('log'),
        warn: emit('warn'),
        debug: emit('debug'),
        error: emit('error'),
    });

    const bind = (handle, methods) => {
        const obj = {};
        for (const m of methods) {
            const path = m.split('.');
            let target = obj;
            for (const p of path.slice(0, -1)) {
                if (target[p] === undefined) target[p] = {};
                target = target[p];
            }
            target[path[path.length - 1]] = (...args) => ops.op_alert_module_call(handle, m, JSON.stringify(args));
        }
        return obj;
    };

    globalThis.module = (name, ...args) => {
        const { handle, methods } = ops.op_alert_module_load(String(name), JSON.stringify(args));
        const obj = bind(handle, methods);
        const prelude = preludes[name];
        return prelude ? prelude(obj) : obj;
    };

    delete globalThis.Deno;
})(Deno.core.ops, __PRELUDES__);
"#;

fn bootstrap_source(registry: &CapRegistry) -> Result<String, AnyError> {
    let mut preludes = String::from("{");
    for (name, src) in registry.preludes() {
        preludes.push_str(&serde_json::to_string(name)?);
        preludes.push_str(": (");
        preludes.push_str(src);
        preludes.push_str("),\n");
    }
    preludes.push('}');
    Ok(BOOTSTRAP.replace("__PRELUDES__", &preludes))
}

// ---------------------------------------------------------------------------
// Engine + ScriptScope
// ---------------------------------------------------------------------------

pub(crate) struct Engine {
    runtime: JsRuntime,
}

impl Engine {
    pub fn new() -> Self {
        let runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![alertscript_ext::init_ops()],
            ..Default::default()
        });
        Self { runtime }
    }

    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Hand the run's bridge to the ops and install `console` and `module()`.
    pub fn install(&mut self, bridge: Bridge) -> Result<(), AnyError> {
        let source = bootstrap_source(&bridge.registry)?;
        self.runtime.op_state().borrow_mut().put(bridge);
        self.runtime
            .execute_script("[alertscript:bootstrap]", source)?;
        Ok(())
    }

    pub fn scope(&mut self) -> ScriptScope<'_> {
        ScriptScope {
            runtime: &mut self.runtime,
        }
    }

    pub fn execute(&mut self, label: &'static str, source: String) -> Result<Value, AnyError> {
        self.scope().eval(label, source)
    }
}

/// Handle given to the init hook for shaping the script's global scope.
pub struct ScriptScope<'a> {
    runtime: &'a mut JsRuntime,
}

impl ScriptScope<'_> {
    /// Set `globalThis[name]` to `value`.
    pub fn define(&mut self, name: &str, value: &Value) -> anyhow::Result<()> {
        let source = format!(
            "globalThis[{}] = {};",
            serde_json::to_string(name)?,
            serde_json::to_string(value)?
        );
        self.runtime.execute_script("[alertscript:define]", source)?;
        Ok(())
    }

    /// Evaluate `source` as a classic script and return its completion value.
    ///
    /// The value is exported with JSON semantics: `undefined`, functions and
    /// symbols become `null`, `toJSON` is honored, and a cyclic value or a
    /// BigInt is an error.
    pub fn eval(&mut self, label: &'static str, source: impl Into<String>) -> anyhow::Result<Value> {
        let global = self.runtime.execute_script(label, source.into())?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        if local.is_undefined() || local.is_function() || local.is_symbol() {
            return Ok(Value::Null);
        }
        let tc = &mut v8::TryCatch::new(scope);
        let Some(text) = v8::json::stringify(tc, local) else {
            let reason = tc
                .exception()
                .map(|e| e.to_rust_string_lossy(tc))
                .unwrap_or_else(|| "execution terminated".to_string());
            anyhow::bail!("script value cannot be exported: {reason}");
        };
        let text = text.to_rust_string_lossy(tc);
        // a `toJSON` returning undefined stringifies to "undefined"
        if text == "undefined" {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

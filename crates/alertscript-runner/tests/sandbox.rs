//! End-to-end runs through a real isolate with small test capabilities.

use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alertscript_core::{arg, Abort, Accountant, Capability, EvalContext};
use alertscript_runner::errors::ErrorCode;
use alertscript_runner::{CapRegistry, Logger, RunConfig, RunError, Sandbox};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Test capabilities
// ---------------------------------------------------------------------------

/// `test/sleep`: one heavy call per `sleep(ms)`.
struct Sleep {
    acct: Rc<dyn Accountant>,
}

impl Capability for Sleep {
    fn methods(&self) -> &[&'static str] {
        &["sleep"]
    }

    fn call(&mut self, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let ms: u64 = arg(&args, 0)?;
        let guard = self.acct.net_io_heavy()?;
        std::thread::sleep(Duration::from_millis(ms));
        guard.finish();
        Ok(json!("ok"))
    }
}

/// `test/light`: one light call per `ping(ms)`.
struct Light {
    acct: Rc<dyn Accountant>,
}

impl Capability for Light {
    fn methods(&self) -> &[&'static str] {
        &["ping"]
    }

    fn call(&mut self, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let ms: u64 = arg(&args, 0)?;
        let _guard = self.acct.net_io_light();
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!("pong"))
    }
}

/// `test/fatal`: `boom()` is fatal, `soft()` is a logged non-fatal error.
struct Fatal {
    acct: Rc<dyn Accountant>,
}

impl Capability for Fatal {
    fn methods(&self) -> &[&'static str] {
        &["boom", "soft"]
    }

    fn call(&mut self, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "boom" => {
                self.acct.fatal(&"backend exploded");
                anyhow::bail!("backend exploded")
            }
            _ => {
                self.acct.error(&"backend hiccup");
                Ok(Value::Null)
            }
        }
    }
}

/// `test/echo`: hands back its construction args and what it can see of the run.
struct Echo {
    acct: Rc<dyn Accountant>,
    init: Vec<Value>,
}

impl Capability for Echo {
    fn methods(&self) -> &[&'static str] {
        &["args", "nested.info"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(match method {
            "args" => json!({"init": self.init, "call": args}),
            _ => json!({
                "dry_run": self.acct.is_dry_run(),
                "trace": self.acct.trace_info(),
                "net_timeout_ms": self.acct.net_timeout().as_millis() as u64,
                "run_id_len": self.acct.context().run_id().len(),
            }),
        })
    }
}

fn registry() -> CapRegistry {
    let mut reg = CapRegistry::new();
    reg.register("test/sleep", |acct: Rc<dyn Accountant>, _: &EvalContext, _: &[Value]| {
        Ok(Box::new(Sleep { acct }) as Box<dyn Capability>)
    })
    .unwrap();
    reg.register("test/light", |acct: Rc<dyn Accountant>, _: &EvalContext, _: &[Value]| {
        Ok(Box::new(Light { acct }) as Box<dyn Capability>)
    })
    .unwrap();
    reg.register("test/fatal", |acct: Rc<dyn Accountant>, _: &EvalContext, _: &[Value]| {
        Ok(Box::new(Fatal { acct }) as Box<dyn Capability>)
    })
    .unwrap();
    reg.register_with_prelude(
        "test/echo",
        |acct: Rc<dyn Accountant>, _: &EvalContext, args: &[Value]| {
            Ok(Box::new(Echo {
                acct,
                init: args.to_vec(),
            }) as Box<dyn Capability>)
        },
        "(m) => { m.twice = (x) => [x, x]; return m; }",
    )
    .unwrap();
    reg
}

fn sandbox() -> Sandbox {
    Sandbox::new(Arc::new(registry()))
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Logger for Recorder {
    fn verbose(&self, msg: &str) {
        self.0.lock().unwrap().push(format!("verbose: {msg}"));
    }
    fn debug(&self, msg: &str) {
        self.0.lock().unwrap().push(format!("debug: {msg}"));
    }
    fn error(&self, msg: &str) {
        self.0.lock().unwrap().push(format!("error: {msg}"));
    }
}

// ---------------------------------------------------------------------------
// Results and timeouts
// ---------------------------------------------------------------------------

#[test]
fn quick_script_returns_its_value_unmodified() {
    let report = sandbox().run(RunConfig::new("({ sum: 1 + 2, list: [1, 'x', null] })"));
    assert_eq!(report.result.unwrap(), json!({"sum": 3, "list": [1, "x", null]}));
    assert_eq!(report.stats.heavy_calls, 0);
    assert!(!report.run_id.is_empty());
}

#[test]
fn busy_loop_past_soft_budget_times_out() {
    let t0 = Instant::now();
    let report = sandbox().run(
        RunConfig::new("while (true) {}").with_timeout(Duration::from_millis(100)),
    );
    let err = report.into_result().unwrap_err();
    assert_eq!(err, RunError::Aborted(Abort::Timeout));
    assert_eq!(err.code(), ErrorCode::BudgetTimeout);
    assert!(t0.elapsed() < Duration::from_secs(5));
}

#[test]
fn caught_termination_still_aborts() {
    let script = "try { while (true) {} } catch (e) {} 'escaped'";
    let report = sandbox().run(RunConfig::new(script).with_timeout(Duration::from_millis(50)));
    assert_eq!(report.result.unwrap_err(), RunError::Aborted(Abort::Timeout));
}

#[test]
fn blocked_io_does_not_count_against_soft_budget() {
    // soft 100ms, hard 5s, max 1, one heavy call blocking 2s.
    let cf = RunConfig::new("module('test/sleep').sleep(2000)")
        .with_timeout(Duration::from_millis(100))
        .with_hard_timeout(Duration::from_secs(5))
        .with_net_max(1);
    let report = sandbox().run(cf);
    assert_eq!(report.result.unwrap(), json!("ok"));
    assert_eq!(report.stats.heavy_calls, 1);
    assert!(report.stats.io_time >= Duration::from_millis(2000));
    assert!(report.stats.active_time < Duration::from_millis(100));
}

#[test]
fn repeated_io_within_hard_ceiling_completes() {
    let script = "var s = module('test/sleep'); for (var i = 0; i < 3; i++) s.sleep(150); 'done'";
    let cf = RunConfig::new(script)
        .with_timeout(Duration::from_millis(100))
        .with_hard_timeout(Duration::from_secs(3))
        .with_net_max(3);
    assert_eq!(sandbox().run(cf).result.unwrap(), json!("done"));
}

#[test]
fn io_past_hard_ceiling_times_out() {
    let script = "var s = module('test/sleep'); for (var i = 0; i < 4; i++) s.sleep(200); 'done'";
    let cf = RunConfig::new(script)
        .with_timeout(Duration::from_secs(2))
        .with_hard_timeout(Duration::from_millis(300))
        .with_net_max(10);
    let report = sandbox().run(cf);
    assert_eq!(report.result.unwrap_err(), RunError::Aborted(Abort::Timeout));
    assert!(report.stats.heavy_calls <= 3);
}

// ---------------------------------------------------------------------------
// Heavy / light accounting
// ---------------------------------------------------------------------------

#[test]
fn exactly_net_max_heavy_calls_succeed() {
    let ok = "var s = module('test/sleep'); s.sleep(0); s.sleep(0); 'two'";
    let report = sandbox().run(RunConfig::new(ok).with_net_max(2));
    assert_eq!(report.result.unwrap(), json!("two"));

    let over = "var s = module('test/sleep'); s.sleep(0); s.sleep(0); s.sleep(0); 'three'";
    let report = sandbox().run(RunConfig::new(over).with_net_max(2));
    assert_eq!(
        report.result.unwrap_err(),
        RunError::Aborted(Abort::NetLimit { limit: 2 })
    );
    assert_eq!(report.stats.heavy_calls, 3);
}

#[test]
fn zero_net_max_refuses_without_io() {
    let cf = RunConfig::new("module('test/sleep').sleep(2000)")
        .with_timeout(Duration::from_millis(100))
        .with_hard_timeout(Duration::from_secs(5))
        .with_net_max(0);
    let t0 = Instant::now();
    let report = sandbox().run(cf);
    let err = report.result.unwrap_err();
    assert_eq!(err, RunError::Aborted(Abort::NetLimit { limit: 0 }));
    assert_eq!(err.code(), ErrorCode::BudgetNetLimit);
    assert_eq!(report.stats.io_time, Duration::ZERO);
    assert!(t0.elapsed() < Duration::from_millis(1500));
}

#[test]
fn refusal_cannot_be_caught_by_the_script() {
    let script = "try { module('test/sleep').sleep(0) } catch (e) {} for (;;) {}";
    let report = sandbox().run(RunConfig::new(script).with_net_max(0));
    assert_eq!(
        report.result.unwrap_err(),
        RunError::Aborted(Abort::NetLimit { limit: 0 })
    );
}

#[test]
fn light_calls_are_uncapped() {
    let script = "var l = module('test/light'); [l.ping(1), l.ping(1), l.ping(1)]";
    let report = sandbox().run(RunConfig::new(script).with_net_max(0));
    assert_eq!(report.result.unwrap(), json!(["pong", "pong", "pong"]));
    assert_eq!(report.stats.light_calls, 3);
    assert_eq!(report.stats.heavy_calls, 0);
}

// ---------------------------------------------------------------------------
// Modules, errors, logging
// ---------------------------------------------------------------------------

#[test]
fn unknown_module_aborts_the_run() {
    let report = sandbox().run(RunConfig::new("module('ext/nope'); 1"));
    let err = report.result.unwrap_err();
    assert_eq!(err, RunError::Aborted(Abort::ModuleNotFound("ext/nope".into())));
    assert_eq!(err.code().code(), "Err.Module.NotFound");

    let caught = "try { module('ext/nope') } catch (e) {} 'after'";
    assert!(sandbox().run(RunConfig::new(caught)).result.is_err());
}

#[test]
fn fatal_capability_error_aborts_and_logs() {
    let logger = Arc::new(Recorder::default());
    let cf = RunConfig::new("module('test/fatal').boom(); 'unreachable'").with_logger(logger.clone());
    let report = sandbox().run(cf);
    assert_eq!(
        report.result.unwrap_err(),
        RunError::Aborted(Abort::Fatal("backend exploded".into()))
    );
    assert_eq!(report.stats.io_errors, 1);
    assert!(logger.lines().contains(&"error: backend exploded".to_string()));
}

#[test]
fn non_fatal_error_is_counted_and_run_continues() {
    let logger = Arc::new(Recorder::default());
    let cf = RunConfig::new("module('test/fatal').soft(); 'kept going'").with_logger(logger.clone());
    let report = sandbox().run(cf);
    assert_eq!(report.result.unwrap(), json!("kept going"));
    assert_eq!(report.stats.io_errors, 1);
    assert_eq!(logger.lines(), vec!["error: backend hiccup"]);
}

#[test]
fn script_exception_is_a_script_error() {
    let logger = Arc::new(Recorder::default());
    let report = sandbox().run(RunConfig::new("throw new Error('bad input')").with_logger(logger.clone()));
    let err = report.result.unwrap_err();
    assert!(matches!(&err, RunError::Script(msg) if msg.contains("bad input")));
    assert_eq!(logger.lines().len(), 1);
    assert!(logger.lines()[0].starts_with("error: "));
}

#[test]
fn console_routes_by_level() {
    let logger = Arc::new(Recorder::default());
    let script = r#"
        console.log("count", 3, {b: [1, true]});
        console.warn("careful");
        console.debug("detail");
        console.error("broken");
        null
    "#;
    let report = sandbox().run(RunConfig::new(script).with_logger(logger.clone()));
    assert!(report.is_ok());
    assert_eq!(
        logger.lines(),
        vec![
            r#"verbose: count 3 {"b":[1,true]}"#,
            "verbose: careful",
            "debug: detail",
            "error: broken",
        ]
    );
}

#[test]
fn console_formats_errors_bigints_and_cycles() {
    let logger = Arc::new(Recorder::default());
    let script = r#"
        var a = { name: 'a' };
        a.self = a;
        console.log(a);
        console.log({ n: 1n, big: [2n] }, 3n);
        console.error(new Error('x'), { cause: new TypeError('y') });
        console.log(undefined, Symbol('s'), null);
        'logged'
    "#;
    let report = sandbox().run(RunConfig::new(script).with_logger(logger.clone()));
    assert_eq!(report.result.unwrap(), json!("logged"));
    assert_eq!(
        logger.lines(),
        vec![
            r#"verbose: {"name":"a","self":"[Circular]"}"#,
            r#"verbose: {"n":"1","big":["2"]} 3"#,
            r#"error: Error: x {"cause":"TypeError: y"}"#,
            "verbose: undefined Symbol(s) null",
        ]
    );
}

#[test]
fn cyclic_return_value_is_a_script_error() {
    let report = sandbox().run(RunConfig::new("var a = []; a.push(a); a"));
    let err = report.result.unwrap_err();
    assert!(matches!(&err, RunError::Script(msg) if msg.contains("cannot be exported")), "{err}");
    assert_eq!(err.code(), ErrorCode::ScriptException);

    let report = sandbox().run(RunConfig::new("({ total: 10n })"));
    assert!(matches!(report.result, Err(RunError::Script(_))));
}

#[test]
fn cyclic_module_argument_throws_into_the_script() {
    let script = r#"
        var a = {}; a.a = a;
        var e = module('test/echo');
        try { e.args(a); 'passed' } catch (err) { 'refused: ' + err.name }
    "#;
    let report = sandbox().run(RunConfig::new(script));
    assert_eq!(report.result.unwrap(), json!("refused: TypeError"));
}

#[test]
fn console_without_logger_is_silent() {
    let report = sandbox().run(RunConfig::new("console.log('dropped'); 7"));
    assert_eq!(report.result.unwrap(), json!(7));
}

// ---------------------------------------------------------------------------
// Context shaping
// ---------------------------------------------------------------------------

#[test]
fn data_binding_and_init_hook_are_visible() {
    let cf = RunConfig::new("event.type + ':' + answer")
        .with_data("event", json!({"type": "disk_full"}))
        .with_init(|scope| {
            scope.define("answer", &json!(42))?;
            Ok(())
        });
    assert_eq!(sandbox().run(cf).result.unwrap(), json!("disk_full:42"));
}

#[test]
fn data_binding_name_must_be_an_identifier() {
    for name in ["", "my-event", "1st", "a b"] {
        let cf = RunConfig::new("1").with_data(name, json!({}));
        let err = sandbox().run(cf).result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigInvalid, "{name:?}");
    }
    let cf = RunConfig::new("$ev._n").with_data("$ev", json!({"_n": 1}));
    assert_eq!(sandbox().run(cf).result.unwrap(), json!(1));
}

#[test]
fn failing_init_hook_is_a_config_error() {
    let cf = RunConfig::new("1").with_init(|scope| {
        scope.eval("[init]", "throw new Error('no')")?;
        Ok(())
    });
    let err = sandbox().run(cf).result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigBootstrap);
}

#[test]
fn deno_global_is_removed() {
    let report = sandbox().run(RunConfig::new("typeof Deno"));
    assert_eq!(report.result.unwrap(), json!("undefined"));
}

#[test]
fn aliases_only_bind_registered_modules() {
    // The default `web` alias points at std/web, which this registry lacks.
    let cf = RunConfig::new("[typeof web, typeof echo.args]").with_alias("echo", "test/echo");
    assert_eq!(sandbox().run(cf).result.unwrap(), json!(["undefined", "function"]));
}

#[test]
fn module_args_dotted_methods_and_prelude() {
    let script = r#"
        var e = module('test/echo', 'a', 2);
        [e.args(true), e.nested.info(), e.twice(1)]
    "#;
    let cf = RunConfig::new(script)
        .with_dry_run(true)
        .with_trace("trace-42")
        .with_net_timeout(Duration::from_millis(250));
    let out = sandbox().run(cf).result.unwrap();
    assert_eq!(out[0], json!({"init": ["a", 2], "call": [true]}));
    assert_eq!(out[1]["dry_run"], true);
    assert_eq!(out[1]["trace"], "trace-42");
    assert_eq!(out[1]["net_timeout_ms"], 250);
    assert_eq!(out[1]["run_id_len"], 36);
    assert_eq!(out[2], json!([1, 1]));
}

#[test]
fn concurrent_runs_share_nothing() {
    let sandbox = Arc::new(sandbox());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let sandbox = sandbox.clone();
            std::thread::spawn(move || {
                let cf = RunConfig::new("module('test/sleep').sleep(50); n * 10")
                    .with_data("n", json!(i))
                    .with_net_max(1);
                sandbox.run(cf).result.unwrap()
            })
        })
        .collect();
    let mut results: Vec<Value> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|v| v.as_i64());
    assert_eq!(results, vec![json!(0), json!(10), json!(20), json!(30)]);
}

//! `std/store`: in-memory key/value store, one per `module()` call.
//! Intended for tests and examples; nothing survives the run.

use std::collections::HashMap;
use std::rc::Rc;

use alertscript_core::{arg, Accountant, Capability, EvalContext};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct Lookup {
    value: Value,
    found: bool,
}

#[derive(Default)]
pub struct Store {
    kvs: HashMap<String, Value>,
}

impl Capability for Store {
    fn methods(&self) -> &[&'static str] {
        &["put", "get"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let key: String = arg(&args, 0)?;
        match method {
            "put" => {
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                self.kvs.insert(key, value);
                Ok(Value::Null)
            }
            "get" => {
                let lookup = match self.kvs.get(&key) {
                    Some(v) => Lookup {
                        value: v.clone(),
                        found: true,
                    },
                    None => Lookup {
                        value: Value::Null,
                        found: false,
                    },
                };
                alertscript_core::to_value(&lookup)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}

pub fn factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Store::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_then_get() {
        let mut s = Store::default();
        assert_eq!(
            s.call("get", vec![json!("k")]).unwrap(),
            json!({"value": null, "found": false})
        );
        s.call("put", vec![json!("k"), json!({"n": [1, 2]})]).unwrap();
        assert_eq!(
            s.call("get", vec![json!("k")]).unwrap(),
            json!({"value": {"n": [1, 2]}, "found": true})
        );
        assert!(s.call("get", vec![json!(5)]).is_err());
    }
}

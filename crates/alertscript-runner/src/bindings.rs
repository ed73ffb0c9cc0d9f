//! Binding resolver: replaces `env:VAR` strings in a data binding with the
//! environment variable's value before it is injected into a run.
//! Never logs resolved values.

use serde_json::Value;

/// Resolve every `"env:VAR"` string in `data`, at any depth.
/// Other strings and all non-string values are returned unchanged.
pub fn resolve_env(data: &Value) -> anyhow::Result<Value> {
    resolve_at(data, "$")
}

fn resolve_at(data: &Value, path: &str) -> anyhow::Result<Value> {
    Ok(match data {
        Value::String(raw) => match raw.strip_prefix("env:") {
            Some(var_name) => Value::String(std::env::var(var_name).map_err(|_| {
                anyhow::anyhow!("env var not set: {} (binding: {})", var_name, path)
            })?),
            None => data.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| resolve_at(v, &format!("{path}[{i}]")))
                .collect::<anyhow::Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), resolve_at(v, &format!("{path}.{k}"))?)))
                .collect::<anyhow::Result<_>>()?,
        ),
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_literal() {
        let data = json!({"webhook": {"url": "https://example.com"}, "n": 3});
        assert_eq!(resolve_env(&data).unwrap(), data);
    }

    #[test]
    fn resolve_env_var_nested() {
        std::env::set_var("__TEST_BINDING_VAR", "secret123");
        let data = json!({"slack": {"token": "env:__TEST_BINDING_VAR"}, "list": ["a", "env:__TEST_BINDING_VAR"]});
        let out = resolve_env(&data).unwrap();
        assert_eq!(out["slack"]["token"], "secret123");
        assert_eq!(out["list"][1], "secret123");
        std::env::remove_var("__TEST_BINDING_VAR");
    }

    #[test]
    fn resolve_env_var_missing() {
        let data = json!({"key": "env:__NONEXISTENT_VAR_12345"});
        let err = resolve_env(&data).unwrap_err().to_string();
        assert!(err.contains("__NONEXISTENT_VAR_12345"));
        assert!(err.contains("$.key"));
    }
}

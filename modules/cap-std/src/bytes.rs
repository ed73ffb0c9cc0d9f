//! Byte arguments and results as they cross the script boundary.

use serde::Deserialize;
use serde_json::Value;

/// A byte argument: a string (UTF-8) or an array of numbers 0..=255.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Bytes {
    Text(String),
    Raw(Vec<u8>),
}

impl Bytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Text(s) => s.as_bytes(),
            Bytes::Raw(b) => b,
        }
    }
}

impl Default for Bytes {
    fn default() -> Self {
        Bytes::Raw(Vec::new())
    }
}

/// Decode positional byte argument `index`; missing means empty.
pub fn bytes_arg(args: &[Value], index: usize) -> anyhow::Result<Bytes> {
    let arg: Option<Bytes> = alertscript_core::arg(args, index)?;
    Ok(arg.unwrap_or_default())
}

/// Bytes as a script value (array of numbers).
pub fn to_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

//! Capability registry: register and look up capability factories by name.
//!
//! Built once at process start, then shared read-only (`Arc`) by every run.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use alertscript_core::{Accountant, Capability, EvalContext, Factory};
use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate module name: '{0}'")]
    Duplicate(String),
}

/// One registration: the factory plus an optional script-side prelude.
#[derive(Clone)]
pub struct Entry {
    pub factory: Arc<Factory>,
    /// JS function expression `(mod) => mod` applied to the instance object
    /// before the script sees it.
    pub prelude: Option<&'static str>,
}

pub struct CapRegistry {
    inner: BTreeMap<String, Entry>,
}

impl CapRegistry {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(Rc<dyn Accountant>, &EvalContext, &[Value]) -> anyhow::Result<Box<dyn Capability>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Arc::new(factory), None)
    }

    pub fn register_with_prelude<F>(
        &mut self,
        name: &str,
        factory: F,
        prelude: &'static str,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Rc<dyn Accountant>, &EvalContext, &[Value]) -> anyhow::Result<Box<dyn Capability>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Arc::new(factory), Some(prelude))
    }

    fn insert(
        &mut self,
        name: &str,
        factory: Arc<Factory>,
        prelude: Option<&'static str>,
    ) -> Result<(), RegistryError> {
        if self.inner.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        tracing::debug!(module = %name, prelude = prelude.is_some(), "registry.register");
        self.inner
            .insert(name.to_string(), Entry { factory, prelude });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.inner.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// `(name, prelude)` for every registration that carries one.
    pub fn preludes(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.inner
            .iter()
            .filter_map(|(name, e)| e.prelude.map(|p| (name.as_str(), p)))
    }
}

impl Default for CapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Capability table injected into every script's scope.
//!
//! A [`CapabilitySet`] is built once by the embedding application (the
//! domain objects themselves are its concern) and shared read-only by the
//! host and every job through an `Arc`. Jobs cannot modify it: constants are
//! pushed as read-only scope entries and modules are registered on a fresh,
//! per-job engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::{Dynamic, Engine, Module, Scope, Shared};

/// A single named entry in the table.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A value visible to scripts as a read-only variable.
    Constant(Dynamic),
    /// A function namespace, called from scripts as `name::function(..)`.
    Module(Shared<Module>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability '{0}' is registered more than once")]
    Duplicate(String),

    #[error("Capability name must not be empty")]
    EmptyName,
}

/// Immutable name -> binding table.
#[derive(Debug, Default)]
pub struct CapabilitySet {
    bindings: BTreeMap<String, Binding>,
}

impl CapabilitySet {
    pub fn builder() -> CapabilitySetBuilder {
        CapabilitySetBuilder::default()
    }

    /// A table with no bindings.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    /// Binding names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bind every entry into a job's engine and scope.
    ///
    /// The engine and scope are job-local, so dropping them releases the
    /// job's references to the table.
    pub fn bind(&self, engine: &mut Engine, scope: &mut Scope<'_>) {
        for (name, binding) in &self.bindings {
            match binding {
                Binding::Constant(value) => {
                    scope.push_constant_dynamic(name.clone(), value.clone());
                }
                Binding::Module(module) => {
                    engine.register_static_module(name.as_str(), module.clone());
                }
            }
        }
    }
}

/// Collects bindings and freezes them into a [`CapabilitySet`].
#[derive(Debug, Default)]
pub struct CapabilitySetBuilder {
    bindings: Vec<(String, Binding)>,
}

impl CapabilitySetBuilder {
    /// Add a read-only value.
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Dynamic>) -> Self {
        self.bindings
            .push((name.into(), Binding::Constant(value.into())));
        self
    }

    /// Add a function namespace.
    pub fn module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.bindings
            .push((name.into(), Binding::Module(module.into())));
        self
    }

    /// Freeze the table. Names must be non-empty and unique.
    pub fn build(self) -> Result<Arc<CapabilitySet>, CapabilityError> {
        let mut bindings = BTreeMap::new();
        for (name, binding) in self.bindings {
            if name.is_empty() {
                return Err(CapabilityError::EmptyName);
            }
            if bindings.contains_key(&name) {
                return Err(CapabilityError::Duplicate(name));
            }
            bindings.insert(name, binding);
        }
        Ok(Arc::new(CapabilitySet { bindings }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Name-to-value mappings: globals, builtins and dynamic-execution dicts.
//!
//! A namespace is an insertion-ordered map behind an `Rc<RefCell<..>>` handle,
//! so a module's globals, a function's captured globals and a dict injected
//! into a dynamic-execution call can all be the same object. Lookup order
//! across namespaces (locals, then globals, then builtins) is implemented by
//! the interpreter, not here.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::value::{Builtin, Value};

/// Shared handle to a namespace.
pub type NsRef = Rc<RefCell<Namespace>>;

/// An insertion-ordered string-keyed mapping.
///
/// Iteration order is insertion order, which keeps serialized continuations
/// and rendered namespace dumps deterministic.
#[derive(Debug, Default)]
pub struct Namespace {
    entries: IndexMap<Arc<str>, Value, ahash::RandomState>,
}

impl Namespace {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps this namespace in a shared handle.
    #[must_use]
    pub fn into_ref(self) -> NsRef {
        Rc::new(RefCell::new(self))
    }

    /// Looks up `name`, cloning the value (handles inside stay shared).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.get(name).cloned()
    }

    /// Binds `name` to `value`, replacing any previous binding.
    pub fn set(&mut self, name: impl Into<Arc<str>>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    /// Whether `name` is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Removes a binding, returning its value if it existed. Preserves the
    /// order of the remaining entries.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.shift_remove(name)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no names are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Value)> {
        self.entries.iter()
    }
}

/// Stable address of a namespace handle, for identity-keyed dedup during
/// serialization.
#[must_use]
pub(crate) fn ns_addr(ns: &NsRef) -> usize {
    Rc::as_ptr(ns) as usize
}

/// Builds the default builtins namespace exposed to interpreted code.
#[must_use]
pub fn builtins_namespace() -> NsRef {
    let mut ns = Namespace::new();
    ns.set("next", Value::Builtin(Builtin::Next));
    ns.set("len", Value::Builtin(Builtin::Len));
    ns.into_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_survives_removal() {
        let mut ns = Namespace::new();
        ns.set("a", Value::Int(1));
        ns.set("b", Value::Int(2));
        ns.set("c", Value::Int(3));
        ns.remove("b");
        let names: Vec<&str> = ns.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn shared_handle_mutation_is_visible() {
        let ns = Namespace::new().into_ref();
        let alias = Rc::clone(&ns);
        alias.borrow_mut().set("x", Value::Int(7));
        assert_eq!(ns.borrow().get("x"), Some(Value::Int(7)));
    }
}

//! Namespace resolution for dynamic execution.
//!
//! A dynamically executed snippet resolves names through runtime dicts chosen
//! by its caller. The rules are decided here, before any instruction of the
//! snippet runs, so a bad namespace argument can never leave a half-executed
//! snippet behind.

use std::rc::Rc;

use crate::error::NamespaceTypeError;
use crate::namespace::NsRef;
use crate::value::Value;

/// The namespaces a dynamic snippet will execute under.
#[derive(Debug)]
pub struct ResolvedNamespaces {
    /// Globals for `LoadGlobal`/`StoreGlobal` and the name-lookup fallback.
    pub globals: NsRef,
    /// The locals mapping driving `LoadName`/`StoreName`.
    pub names: NsRef,
}

/// Applies the namespace-argument rules for a dynamic-execution call.
///
/// - Neither argument given: the snippet shares the invoker's globals and
///   locals mapping.
/// - Only globals given: the same dict serves as both globals and locals, and
///   a `__builtins__` binding is injected if absent so lookups in the new
///   environment can still reach the builtins.
/// - Both given: they are used as-is (and may be the same dict).
/// - Only locals given: the invoker's globals with the given locals.
///
/// # Errors
///
/// A namespace argument that is not a mapping fails with
/// [`NamespaceTypeError`] before execution starts.
pub fn resolve_exec_namespaces(
    invoker_globals: &NsRef,
    invoker_names: &NsRef,
    builtins: &NsRef,
    globals_arg: Option<Value>,
    locals_arg: Option<Value>,
) -> Result<ResolvedNamespaces, NamespaceTypeError> {
    let globals_arg = globals_arg.map(as_namespace).transpose()?;
    let locals_arg = locals_arg.map(as_namespace).transpose()?;

    let resolved = match (globals_arg, locals_arg) {
        (None, None) => ResolvedNamespaces {
            globals: Rc::clone(invoker_globals),
            names: Rc::clone(invoker_names),
        },
        (None, Some(locals)) => ResolvedNamespaces {
            globals: Rc::clone(invoker_globals),
            names: locals,
        },
        (Some(globals), locals) => {
            if !globals.borrow().contains("__builtins__") {
                globals
                    .borrow_mut()
                    .set("__builtins__", Value::Namespace(Rc::clone(builtins)));
            }
            let names = locals.unwrap_or_else(|| Rc::clone(&globals));
            ResolvedNamespaces { globals, names }
        }
    };
    Ok(resolved)
}

fn as_namespace(value: Value) -> Result<NsRef, NamespaceTypeError> {
    match value {
        Value::Namespace(ns) => Ok(ns),
        other => Err(NamespaceTypeError {
            found: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{builtins_namespace, Namespace};

    #[test]
    fn default_is_invoker_environment() {
        let globals = Namespace::new().into_ref();
        let names = Namespace::new().into_ref();
        let builtins = builtins_namespace();
        let resolved = resolve_exec_namespaces(&globals, &names, &builtins, None, None).unwrap();
        assert!(Rc::ptr_eq(&resolved.globals, &globals));
        assert!(Rc::ptr_eq(&resolved.names, &names));
    }

    #[test]
    fn lone_globals_doubles_as_locals_and_gains_builtins() {
        let globals = Namespace::new().into_ref();
        let names = Namespace::new().into_ref();
        let builtins = builtins_namespace();
        let supplied = Namespace::new().into_ref();
        let resolved = resolve_exec_namespaces(
            &globals,
            &names,
            &builtins,
            Some(Value::Namespace(Rc::clone(&supplied))),
            None,
        )
        .unwrap();
        assert!(Rc::ptr_eq(&resolved.globals, &supplied));
        assert!(Rc::ptr_eq(&resolved.names, &supplied));
        assert!(supplied.borrow().contains("__builtins__"));
    }

    #[test]
    fn existing_builtins_binding_is_kept() {
        let globals = Namespace::new().into_ref();
        let builtins = builtins_namespace();
        let supplied = Namespace::new().into_ref();
        supplied.borrow_mut().set("__builtins__", Value::None);
        resolve_exec_namespaces(
            &globals,
            &globals,
            &builtins,
            Some(Value::Namespace(Rc::clone(&supplied))),
            None,
        )
        .unwrap();
        assert_eq!(supplied.borrow().get("__builtins__"), Some(Value::None));
    }

    #[test]
    fn non_mapping_argument_is_rejected_before_execution() {
        let globals = Namespace::new().into_ref();
        let builtins = builtins_namespace();
        let err =
            resolve_exec_namespaces(&globals, &globals, &builtins, Some(Value::Int(3)), None).unwrap_err();
        assert_eq!(err.found, "int");
    }
}

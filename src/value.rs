//! Runtime value representation.
//!
//! Small immediate values (ints, bools, floats) are stored inline; shared
//! mutable state (cells, namespaces, lists, generators) lives behind
//! `Rc<RefCell<..>>` handles. Cross-object sharing is therefore cheap to clone
//! and jointly owned - a cell is destroyed when its last holder releases it,
//! matching the closure-capture lifecycle. Nothing here is `Send`: a frame and
//! everything hanging off it is driven by one thread at a time.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::code::Code;
use crate::exc::{ExcKind, ExceptionState};
use crate::frame::PendingAction;
use crate::generator::Generator;
use crate::namespace::NsRef;

/// A shared mutable box for a captured (closed-over) variable.
///
/// The defining frame and every closure capturing the variable hold the same
/// cell; reads and writes through any holder are visible to all of them.
#[derive(Clone)]
pub struct Cell(Rc<RefCell<Value>>);

impl Cell {
    /// Creates an unbound cell.
    #[must_use]
    pub fn unbound() -> Self {
        Self(Rc::new(RefCell::new(Value::Undefined)))
    }

    /// Creates a cell holding `value`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Reads the current value (cloned; handles inside are shared).
    #[must_use]
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    /// Replaces the stored value.
    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    /// Identity comparison - two handles to the same box.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address for identity-keyed dedup during serialization.
    #[must_use]
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Avoid following the contents: cells frequently sit in cycles with
        // the closures that capture them.
        write!(f, "<cell>")
    }
}

/// Shared list storage.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// Iterator state over a shared list.
#[derive(Debug, Clone)]
pub struct ListIter {
    /// The list being iterated (shared with the originating value).
    pub list: ListRef,
    /// Next index to produce.
    pub index: usize,
}

impl ListIter {
    /// Produces the next element, or `None` when exhausted.
    pub fn next(&mut self) -> Option<Value> {
        let item = self.list.borrow().get(self.index).cloned();
        if item.is_some() {
            self.index += 1;
        }
        item
    }
}

/// A function defined by interpreted code.
///
/// Carries the namespaces it was defined under, so functions created inside a
/// dynamically executed snippet resolve global names through the snippet's
/// injected namespace, never through the definer's fast locals.
pub struct FunctionObj {
    /// Function name, for tracebacks and repr.
    pub name: Arc<str>,
    /// The compiled unit executed on call.
    pub code: Arc<Code>,
    /// Globals namespace captured at definition time.
    pub globals: NsRef,
    /// Builtins namespace captured at definition time.
    pub builtins: NsRef,
    /// Captured cells, in `code.freevars` order.
    pub closure: Vec<Cell>,
}

impl std::fmt::Debug for FunctionObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Namespaces are omitted: they commonly contain this function.
        write!(f, "<function {} code={:?}>", self.name, self.code.id())
    }
}

/// Host-provided callables exposed to interpreted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum Builtin {
    /// `next(gen)` - resume a generator, raising `StopIteration` on exhaustion.
    Next,
    /// `len(x)` - length of a list or string.
    Len,
}

/// Primary runtime value.
///
/// `Clone` is cheap: handles are reference-counted, immediates are `Copy`-like.
#[derive(Debug, Clone)]
pub enum Value {
    /// Unbound fast-local slot sentinel; never visible to interpreted code.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Shared mutable list.
    List(ListRef),
    /// List iterator produced by `GetIter`.
    Iter(Rc<RefCell<ListIter>>),
    /// A cell object, on the stack only during closure construction.
    Cell(Cell),
    /// Interpreted function.
    Function(Rc<FunctionObj>),
    /// Suspended or running coroutine.
    Generator(Rc<RefCell<Generator>>),
    /// A namespace mapping (globals, builtins, or a dynamic-execution dict).
    Namespace(NsRef),
    /// A caught exception triple on the operand stack.
    Exc(Rc<ExceptionState>),
    /// Host builtin.
    Builtin(Builtin),
    /// Deferred control transfer parked on the stack while a FINALLY block
    /// runs; never visible to interpreted code.
    Pending(Box<PendingAction>),
}

impl Value {
    /// String value helper.
    #[must_use]
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    /// List value helper.
    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    /// Short type name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Iter(_) => "iterator",
            Self::Cell(_) => "cell",
            Self::Function(_) => "function",
            Self::Generator(_) => "generator",
            Self::Namespace(_) => "namespace",
            Self::Exc(_) => "exception",
            Self::Builtin(_) => "builtin",
            Self::Pending(_) => "pending",
        }
    }

    /// Truthiness, following the usual dynamic-language rules.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::None | Self::Undefined => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(l) => !l.borrow().is_empty(),
            _ => true,
        }
    }

    fn type_error(op: &str, a: &Value, b: &Value) -> ExceptionState {
        ExceptionState::msg(
            ExcKind::TypeError,
            format!(
                "unsupported operand type(s) for {op}: '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ),
        )
    }

    /// `a + b`.
    pub fn add(&self, other: &Value) -> Result<Value, ExceptionState> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_add(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a + b)),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 + b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a + *b as f64)),
            (Self::Str(a), Self::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Self::str(s))
            }
            (Self::List(a), Self::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Self::list(items))
            }
            (a, b) => Err(Self::type_error("+", a, b)),
        }
    }

    /// `a - b`.
    pub fn sub(&self, other: &Value) -> Result<Value, ExceptionState> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_sub(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a - b)),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 - b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a - *b as f64)),
            (a, b) => Err(Self::type_error("-", a, b)),
        }
    }

    /// `a * b`.
    pub fn mul(&self, other: &Value) -> Result<Value, ExceptionState> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_mul(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a * b)),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 * b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a * *b as f64)),
            (a, b) => Err(Self::type_error("*", a, b)),
        }
    }

    /// `a / b` (true division, always float for numeric operands).
    pub fn div(&self, other: &Value) -> Result<Value, ExceptionState> {
        let (a, b) = match (self, other) {
            (Self::Int(a), Self::Int(b)) => (*a as f64, *b as f64),
            (Self::Float(a), Self::Float(b)) => (*a, *b),
            (Self::Int(a), Self::Float(b)) => (*a as f64, *b),
            (Self::Float(a), Self::Int(b)) => (*a, *b as f64),
            (a, b) => return Err(Self::type_error("/", a, b)),
        };
        if b == 0.0 {
            return Err(ExceptionState::msg(ExcKind::ZeroDivisionError, "division by zero"));
        }
        Ok(Self::Float(a / b))
    }

    /// `a // b` (floor division).
    pub fn floor_div(&self, other: &Value) -> Result<Value, ExceptionState> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(ExceptionState::msg(
                        ExcKind::ZeroDivisionError,
                        "integer division by zero",
                    ))
                } else {
                    Ok(Self::Int(a.div_euclid(*b)))
                }
            }
            (a, b) => Err(Self::type_error("//", a, b)),
        }
    }

    /// `a % b`.
    pub fn modulo(&self, other: &Value) -> Result<Value, ExceptionState> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(ExceptionState::msg(ExcKind::ZeroDivisionError, "integer modulo by zero"))
                } else {
                    Ok(Self::Int(a.rem_euclid(*b)))
                }
            }
            (a, b) => Err(Self::type_error("%", a, b)),
        }
    }

    /// Arithmetic negation.
    pub fn neg(&self) -> Result<Value, ExceptionState> {
        match self {
            Self::Int(n) => Ok(Self::Int(n.wrapping_neg())),
            Self::Float(f) => Ok(Self::Float(-f)),
            Self::Bool(b) => Ok(Self::Int(-i64::from(*b))),
            v => Err(ExceptionState::msg(
                ExcKind::TypeError,
                format!("bad operand type for unary -: '{}'", v.type_name()),
            )),
        }
    }

    /// Ordering comparison; errors on incomparable operand types.
    pub fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, ExceptionState> {
        let ord = match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(std::cmp::Ordering::Equal),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (a, b) => {
                return Err(ExceptionState::msg(
                    ExcKind::TypeError,
                    format!("'{}' not comparable with '{}'", a.type_name(), b.type_name()),
                ))
            }
        };
        Ok(ord)
    }
}

impl PartialEq for Value {
    /// Structural equality for immediates, strings and lists; identity for
    /// everything that can participate in reference cycles.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Namespace(a), Self::Namespace(b)) => Rc::ptr_eq(a, b),
            (Self::Exc(a), Self::Exc(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_sharing() {
        let cell = Cell::new(Value::Int(1));
        let alias = cell.clone();
        alias.set(Value::Int(2));
        assert_eq!(cell.get(), Value::Int(2));
        assert!(cell.ptr_eq(&alias));
    }

    #[test]
    fn arithmetic_type_errors_are_catchable_conditions() {
        let err = Value::None.add(&Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ExcKind::TypeError);
        let err = Value::Int(1).div(&Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, ExcKind::ZeroDivisionError);
    }

    #[test]
    fn mixed_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Str("2".into()));
    }
}

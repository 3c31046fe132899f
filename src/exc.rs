//! Interpreted exception conditions and tracebacks.
//!
//! Everything here is catchable by interpreted handler blocks: user raises and
//! runtime conditions (name errors, arithmetic errors, generator exhaustion,
//! the injected close signal) all flow through the same block-stack unwinding
//! mechanism, so handlers distinguish them only by [`ExcKind`], never by origin.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

use crate::code::{CodeId, CodeRegistry};
use crate::value::Value;

/// Exception kinds known to the core.
///
/// Uses strum derives for `Display`/`FromStr`/`Into<&'static str>`; the string
/// representation matches the variant name exactly. `FromRepr` supports the
/// one-byte kind operand of `RaiseNew`/`ExcMatch`.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr, Serialize, Deserialize,
)]
pub enum ExcKind {
    /// Root of the hierarchy - matches every exception.
    BaseException,
    /// Matches everything except the control-flow signals below.
    Exception,
    TypeError,
    ValueError,
    NameError,
    /// Subclass of NameError - fast-local read before assignment.
    UnboundLocalError,
    ZeroDivisionError,
    RuntimeError,
    /// Subclass of RuntimeError - call-chain depth limit hit. Catchable: it is
    /// a resource condition, not an internal invariant violation.
    RecursionError,
    KeyError,
    IndexError,
    /// Exhaustion sentinel raised to interpreted callers of `next()`.
    StopIteration,
    /// The injected close signal. Deliberately outside `Exception` so that
    /// bare `except Exception` handlers do not swallow cancellation.
    GeneratorExit,
}

impl ExcKind {
    /// Whether an exception of kind `self` is caught by a handler declared for
    /// `handler`. Implements the subset hierarchy this core supports.
    #[must_use]
    pub fn matches(self, handler: Self) -> bool {
        if self == handler {
            return true;
        }
        match handler {
            Self::BaseException => true,
            // Exception catches everything except the out-of-band signals
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::RuntimeError => matches!(self, Self::RecursionError),
            _ => false,
        }
    }
}

/// One traceback entry: where an exception passed through a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    /// Identity of the compiled unit.
    pub code: CodeId,
    /// Instruction offset within the unit.
    pub offset: u32,
    /// Source line for that offset, 0 when the unit carries no line table.
    pub line: u32,
}

/// Ordered chain of traceback nodes, oldest call first.
///
/// Built incrementally during unwinding: each frame the exception propagates
/// through prepends its node, so the outermost caller ends up first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traceback {
    nodes: Vec<TraceNode>,
}

impl Traceback {
    /// Creates an empty traceback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a traceback from already-ordered nodes (deserialization).
    #[must_use]
    pub fn from_nodes(nodes: Vec<TraceNode>) -> Self {
        Self { nodes }
    }

    /// Prepends a node for a frame the exception is leaving. Keeps the
    /// oldest-call-first ordering as unwinding proceeds outward.
    pub fn push_outer(&mut self, node: TraceNode) {
        self.nodes.insert(0, node);
    }

    /// Nodes, oldest call first.
    #[must_use]
    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    /// True when no frame has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// An exception in flight: kind, payload and the traceback accumulated so far.
///
/// While propagating it is attached to the unwinding machinery; once caught it
/// is pushed onto the operand stack as a [`Value::Exc`] triple. `context`
/// preserves an exception that was displaced when a FINALLY block's own
/// control transfer replaced it - both conditions stay visible to the
/// error-handling layer, which decides chaining policy.
#[derive(Debug, Clone)]
pub struct ExceptionState {
    /// Declared kind; the only thing interpreted handlers can match on.
    pub kind: ExcKind,
    /// Payload value, usually a message string or `None`.
    pub payload: Value,
    /// Frames unwound so far, oldest call first.
    pub traceback: Traceback,
    /// Exception displaced by a competing control transfer in a FINALLY block.
    pub context: Option<Box<ExceptionState>>,
}

impl ExceptionState {
    /// Creates a condition with an arbitrary payload and an empty traceback.
    #[must_use]
    pub fn new(kind: ExcKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            traceback: Traceback::new(),
            context: None,
        }
    }

    /// Creates a condition with a string message payload.
    #[must_use]
    pub fn msg(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::new(kind, Value::str(message.into()))
    }

    /// Creates a condition with no payload.
    #[must_use]
    pub fn bare(kind: ExcKind) -> Self {
        Self::new(kind, Value::None)
    }

    /// Renders the exception with its full traceback, oldest call first,
    /// resolving compiled-unit names through the registry.
    #[must_use]
    pub fn render(&self, registry: &CodeRegistry) -> String {
        let mut out = String::new();
        if let Some(context) = &self.context {
            out.push_str(&context.render(registry));
            out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
        }
        if !self.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for node in self.traceback.nodes() {
                let name = registry.get(node.code).map_or("<unknown>", |c| c.name());
                let _ = writeln!(out, "  Unit \"{name}\", line {}, offset {}", node.line, node.offset);
            }
        }
        let _ = write!(out, "{self}");
        out
    }
}

impl fmt::Display for ExceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Value::None => write!(f, "{}", self.kind),
            Value::Str(s) => write!(f, "{}: {s}", self.kind),
            other => write!(f, "{}: {other:?}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_hierarchy() {
        assert!(ExcKind::ZeroDivisionError.matches(ExcKind::Exception));
        assert!(ExcKind::UnboundLocalError.matches(ExcKind::NameError));
        assert!(ExcKind::RecursionError.matches(ExcKind::RuntimeError));
        assert!(!ExcKind::GeneratorExit.matches(ExcKind::Exception));
        assert!(ExcKind::GeneratorExit.matches(ExcKind::BaseException));
        assert!(!ExcKind::TypeError.matches(ExcKind::ValueError));
    }

    #[test]
    fn traceback_orders_oldest_first() {
        let mut tb = Traceback::new();
        tb.push_outer(TraceNode {
            code: CodeId(2),
            offset: 10,
            line: 3,
        });
        tb.push_outer(TraceNode {
            code: CodeId(1),
            offset: 4,
            line: 1,
        });
        let codes: Vec<u32> = tb.nodes().iter().map(|n| n.code.0).collect();
        assert_eq!(codes, vec![1, 2]);
    }
}

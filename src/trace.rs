//! Execution anchors for profiling and tracing hooks.
//!
//! The dispatch loop reports control-flow anchors (loop back edges, call
//! boundaries, suspension points) to a [`TraceSink`] chosen at compile time
//! via a generic parameter. Every anchor names the unit, the instruction
//! offset it fired at, and the unit's profiling hint; an acceleration layer
//! may act on these or not, execution semantics are unaffected either way.
//! The default [`NullTrace`] compiles to nothing, so the hooks are free when
//! unused.

use crate::code::CodeId;

/// One notification from the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceAnchor {
    /// Unit the anchor fired in (for calls, the unit being entered).
    pub code: CodeId,
    /// Bytecode offset of the firing instruction.
    pub offset: u32,
    /// The unit's profiling hint, copied from its flags.
    pub profiled: bool,
    /// What kind of control-flow point fired.
    pub edge: TraceEdge,
}

/// The control-flow points the dispatch loop reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEdge {
    /// A backward jump: the end of one loop iteration.
    LoopBackEdge,
    /// A new frame was entered; the offset is the callee's entry point.
    Call,
    /// A frame returned to its caller.
    Return,
    /// A generator frame suspended at a yield.
    Yield,
    /// An exception was delivered to a handler block.
    Catch,
}

/// Receiver for execution anchors.
pub trait TraceSink {
    fn anchor(&mut self, anchor: TraceAnchor);
}

/// The default sink: ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrace;

impl TraceSink for NullTrace {
    #[inline(always)]
    fn anchor(&mut self, _anchor: TraceAnchor) {}
}

/// Records every anchor in order; used by tests and simple profilers.
#[derive(Debug, Default)]
pub struct RecordingTrace {
    pub anchors: Vec<TraceAnchor>,
}

impl TraceSink for RecordingTrace {
    fn anchor(&mut self, anchor: TraceAnchor) {
        self.anchors.push(anchor);
    }
}

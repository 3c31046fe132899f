//! A resumable bytecode execution core with serializable continuations.
//!
//! `grail` executes a small stack-based bytecode for a dynamic language:
//! activation frames with per-frame operand and block stacks, closures over
//! shared cells, generators that suspend and resume, dynamic execution of
//! snippets under caller-supplied namespaces, and portable serialization of
//! suspended frames and generators so a computation can be captured on one
//! host and resumed on another (against an identically populated registry).
//!
//! The [`Machine`] type is the embedding surface; [`CodeBuilder`] assembles
//! compiled units and registers them with the machine's [`CodeRegistry`].

mod code;
mod error;
mod exc;
mod frame;
mod generator;
mod interp;
mod machine;
mod namespace;
mod op;
mod portable;
mod resolver;
mod trace;
mod value;

pub use crate::{
    code::{Code, CodeBuilder, CodeFlags, CodeId, CodeRegistry, Const, Label},
    error::{CodeError, GeneratorStateError, NamespaceTypeError, SerializationError, VmError},
    exc::{ExcKind, ExceptionState, TraceNode, Traceback},
    frame::{Block, BlockKind, Frame, PendingAction},
    generator::{GenState, Generator},
    interp::{Interp, Outcome, ResumeOutcome},
    machine::Machine,
    namespace::{builtins_namespace, Namespace, NsRef},
    op::Opcode,
    portable::{
        deserialize_frame, deserialize_generator, deserialize_traceback, serialize_frame, serialize_generator,
        serialize_traceback, FORMAT_VERSION,
    },
    resolver::{resolve_exec_namespaces, ResolvedNamespaces},
    trace::{NullTrace, RecordingTrace, TraceAnchor, TraceEdge, TraceSink},
    value::{Builtin, Cell, FunctionObj, ListIter, ListRef, Value},
};

//! Host-level error taxonomy.
//!
//! These errors are reported to the embedding host as Rust `Result`s. They are
//! distinct from interpreted exception conditions (`exc::ExceptionState`), which
//! flow through block-stack unwinding and can be caught by interpreted handlers.
//! Internal invariant violations (stack faults, malformed block stacks) abort
//! the current frame without ever being offered to handler blocks.

use thiserror::Error;

use crate::code::CodeId;
use crate::exc::ExceptionState;

/// Errors surfaced to the host by the interpreter, generators, the namespace
/// resolver and the continuation serializer.
#[derive(Debug, Error)]
pub enum VmError {
    /// Operand stack popped below its frame base. Fatal invariant violation.
    #[error("operand stack underflow")]
    StackUnderflow,

    /// Operand stack grew past the compiled unit's declared maximum depth.
    /// Fatal invariant violation.
    #[error("operand stack overflow (declared max {max})")]
    StackOverflow {
        /// Declared maximum depth of the offending compiled unit.
        max: u16,
    },

    /// Block stack manipulation broke LIFO nesting or found an unexpected
    /// sentinel. Fatal invariant violation.
    #[error("malformed block stack: {0}")]
    MalformedBlockStack(&'static str),

    /// The byte at the instruction pointer is not a valid opcode.
    #[error("invalid opcode byte {0:#04x}")]
    InvalidOpcode(u8),

    /// An instruction executed in a context where it is never legal
    /// (e.g. yield below an active call).
    #[error("illegal instruction: {0}")]
    IllegalInstruction(&'static str),

    /// Generator lifecycle misuse.
    #[error(transparent)]
    Generator(#[from] GeneratorStateError),

    /// A supplied dynamic-execution namespace is not a mapping. Raised before
    /// any instruction executes.
    #[error(transparent)]
    NamespaceType(#[from] NamespaceTypeError),

    /// Continuation capture or restore failed.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// An exception propagated out of the outermost frame uncaught. The
    /// traceback enumerates every unwound frame, oldest call first.
    #[error("uncaught {0}")]
    Uncaught(ExceptionState),
}

/// Generator lifecycle misuse, detected by the state machine (a reentrancy
/// guard, not a lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeneratorStateError {
    /// `resume(value)` on a CREATED generator with a non-empty value.
    #[error("cannot send a value into a just-started generator")]
    SendToFresh,

    /// The generator's frame is already being driven by another logical caller.
    #[error("generator already executing")]
    AlreadyRunning,

    /// The generator has completed or been closed; it cannot be resumed.
    #[error("generator exhausted")]
    Exhausted,

    /// `close()` was injected but the generator caught the signal and yielded
    /// again instead of terminating.
    #[error("generator ignored close request")]
    CloseIgnored,
}

/// A dynamic-execution namespace argument that does not support mapping
/// operations (get/set/contains).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("namespace argument must be a mapping, not {found}")]
pub struct NamespaceTypeError {
    /// Type name of the offending value.
    pub found: &'static str,
}

/// Continuation serializer failures.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Something reachable from the captured state cannot be represented in
    /// the portable form (e.g. a RUNNING generator frame).
    #[error("cannot serialize {0}")]
    Unsupported(&'static str),

    /// The stream does not start with the expected magic bytes.
    #[error("not a continuation stream (bad magic)")]
    BadMagic,

    /// The stream was produced by an incompatible format version. Checked
    /// before any record is interpreted.
    #[error("continuation format version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version tag found in the stream.
        found: u16,
        /// Version this build reads and writes.
        expected: u16,
    },

    /// A CODE-REF names a compiled unit that is not present in the registry.
    #[error("unknown compiled unit {0:?} in continuation stream")]
    UnknownCode(CodeId),

    /// The stream decoded but its records are inconsistent (dangling table
    /// references, stack or locals shapes that do not fit the compiled unit).
    #[error("malformed continuation stream: {0}")]
    Corrupt(&'static str),

    /// Underlying codec failure.
    #[error("continuation codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Errors detected while assembling or analyzing a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodeError {
    /// Two control-flow paths reach the same instruction with different
    /// operand-stack depths.
    #[error("inconsistent stack depth at offset {offset}: {first} vs {second}")]
    DepthMismatch {
        /// Offset of the join point.
        offset: u32,
        /// Depth recorded first.
        first: u16,
        /// Conflicting depth.
        second: u16,
    },

    /// The simulated stack depth went negative.
    #[error("stack underflow at offset {offset} during depth analysis")]
    DepthUnderflow {
        /// Offset of the offending instruction.
        offset: u32,
    },

    /// A jump lands outside the bytecode or inside an operand.
    #[error("jump to invalid target {target} at offset {offset}")]
    InvalidJump {
        /// Offset of the jump instruction.
        offset: u32,
        /// Computed target.
        target: i64,
    },

    /// The byte stream contains a byte that is not an opcode.
    #[error("invalid opcode byte {byte:#04x} at offset {offset}")]
    InvalidOpcode {
        /// Offset of the bad byte.
        offset: u32,
        /// The byte.
        byte: u8,
    },

    /// Bytecode ends in the middle of an operand.
    #[error("truncated operand at offset {offset}")]
    TruncatedOperand {
        /// Offset of the instruction whose operand is cut short.
        offset: u32,
    },
}

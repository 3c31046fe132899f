//! Activation frames and the block stack.
//!
//! Each frame owns its operand stack, fast-local slots, cells and block stack.
//! Nothing is shared between frames except what the values themselves share
//! (cells, namespaces, lists). A frame is therefore a self-contained resume
//! point: the continuation serializer captures frames directly, and a
//! suspended generator is just a frame parked off to the side.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::code::Code;
use crate::error::VmError;
use crate::exc::ExceptionState;
use crate::namespace::NsRef;
use crate::value::{Cell, FunctionObj, Value};

/// What kind of protected region a block guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// A loop body; `Break`/`Continue` target the innermost one.
    Loop,
    /// An exception handler; entered with the caught exception pushed.
    Except,
    /// A finally clause; entered with a pending-action sentinel pushed, runs
    /// on every exit path.
    Finally,
    /// A context-manager exit handler; unwinds like a finally clause.
    ContextExit,
}

/// One entry on a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Absolute bytecode offset control transfers to when the block is
    /// triggered (loop exit, handler entry).
    pub target: u16,
    /// Operand-stack depth when the block was pushed. Unwinding trims the
    /// stack back to this depth before transferring control.
    pub depth: u16,
}

/// A control transfer deferred while finally clauses run.
///
/// Parked on the operand stack as [`Value::Pending`] when unwinding enters a
/// `Finally`/`ContextExit` handler; `EndFinally` pops it and re-delivers.
#[derive(Debug, Clone)]
pub enum PendingAction {
    /// A `ReturnValue` is still on its way out of the frame.
    Return(Value),
    /// A `Break` is still on its way to the innermost loop's exit.
    Break,
    /// A `Continue` is still on its way to the loop head at this offset.
    Continue(u32),
    /// An exception is still propagating.
    Raise(ExceptionState),
}

/// An activation of a compiled unit.
pub struct Frame {
    /// The unit being executed; shared with the registry and other frames.
    pub code: Arc<Code>,
    /// Offset of the next instruction to fetch.
    pub ip: u32,
    /// Operand stack, bounded by `code.max_stack()`.
    pub stack: Vec<Value>,
    /// Active protected regions, innermost last.
    pub blocks: Vec<Block>,
    /// Fast-local slots; `Value::Undefined` marks an unbound slot.
    pub locals: Vec<Value>,
    /// Cells, in cellvars-then-freevars order.
    pub cells: Vec<Cell>,
    /// Globals namespace for `LoadGlobal`/`StoreGlobal` and name fallback.
    pub globals: NsRef,
    /// Builtins namespace, the last resolution step.
    pub builtins: NsRef,
    /// Runtime dict for `LoadName`/`StoreName`; `Some` only for units compiled
    /// with the dynamic-namespace flag.
    pub names: Option<NsRef>,
    /// The most recently caught exception, for `Reraise`/`PopExcept`.
    pub last_exception: Option<ExceptionState>,
    /// Calling frame, owned by this frame while suspended. Detached by the
    /// host before serializing a frame in isolation.
    pub back: Option<Box<Frame>>,
}

impl Frame {
    /// Creates a frame over `code` with empty locals and fresh cells for the
    /// unit's cellvars. Freevar cells are appended by the caller when
    /// activating a closure.
    #[must_use]
    pub fn new(code: Arc<Code>, globals: NsRef, builtins: NsRef, names: Option<NsRef>) -> Self {
        let locals = vec![Value::Undefined; code.varnames().len()];
        let cells = code.cellvars().iter().map(|_| Cell::unbound()).collect();
        Self {
            stack: Vec::with_capacity(code.max_stack() as usize),
            blocks: Vec::new(),
            locals,
            cells,
            code,
            ip: 0,
            globals,
            builtins,
            names,
            last_exception: None,
            back: None,
        }
    }

    /// Creates the activation for calling `func` with `args` already checked
    /// against the unit's arity. Parameters that are also cellvars are
    /// mirrored into their cells at entry.
    #[must_use]
    pub fn activate(func: &FunctionObj, args: Vec<Value>) -> Self {
        let mut frame = Self::new(
            Arc::clone(&func.code),
            NsRef::clone(&func.globals),
            NsRef::clone(&func.builtins),
            None,
        );
        for (slot, arg) in args.into_iter().enumerate() {
            frame.locals[slot] = arg;
        }
        for (cell_slot, name) in frame.code.cellvars().iter().enumerate() {
            if let Some(var_slot) = frame.code.varnames().iter().position(|v| v == name) {
                if var_slot < frame.code.arg_count() as usize {
                    frame.cells[cell_slot].set(frame.locals[var_slot].clone());
                }
            }
        }
        frame.cells.extend(func.closure.iter().cloned());
        frame
    }

    /// Pushes a value, enforcing the unit's declared maximum depth.
    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= self.code.max_stack() as usize {
            return Err(VmError::StackOverflow {
                max: self.code.max_stack(),
            });
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops the top value.
    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Borrows the top value without popping.
    pub fn peek(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    /// Pushes a block recording the current stack depth.
    pub fn push_block(&mut self, kind: BlockKind, target: u16) {
        self.blocks.push(Block {
            kind,
            target,
            depth: self.stack.len() as u16,
        });
    }

    /// Pops the innermost block.
    pub fn pop_block(&mut self) -> Result<Block, VmError> {
        self.blocks
            .pop()
            .ok_or(VmError::MalformedBlockStack("pop from empty block stack"))
    }

    /// Trims the operand stack down to `depth`, returning the removed values
    /// top-first so the unwinder can inspect parked pending actions.
    pub fn drain_to_depth(&mut self, depth: u16) -> Vec<Value> {
        let keep = (depth as usize).min(self.stack.len());
        let mut removed = self.stack.split_off(keep);
        removed.reverse();
        removed
    }

    /// Detaches and returns the calling-frame chain, leaving this frame
    /// standalone.
    pub fn detach_back(&mut self) -> Option<Box<Frame>> {
        self.back.take()
    }

    /// Reattaches a calling-frame chain.
    pub fn attach_back(&mut self, back: Option<Box<Frame>>) {
        self.back = back;
    }

    /// Length of the back chain, this frame included.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.back.as_deref();
        while let Some(f) = cur {
            n += 1;
            cur = f.back.as_deref();
        }
        n
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Namespaces are omitted: globals commonly reach back to this frame
        // through functions defined in it.
        f.debug_struct("Frame")
            .field("code", &self.code.id())
            .field("ip", &self.ip)
            .field("stack_len", &self.stack.len())
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Frame {
    /// Resume-point equality: same unit, same instruction pointer, same
    /// local bindings. Transient execution state (operand stack, blocks)
    /// and namespace identity are not compared.
    fn eq(&self, other: &Self) -> bool {
        self.code.id() == other.code.id() && self.ip == other.ip && self.locals == other.locals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeBuilder, CodeRegistry};
    use crate::namespace::{builtins_namespace, Namespace};
    use crate::op::Opcode;

    fn tiny_frame() -> Frame {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("tiny");
        b.op(Opcode::LoadNone).op(Opcode::Dup).op(Opcode::Pop).op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        Frame::new(code, Namespace::new().into_ref(), builtins_namespace(), None)
    }

    #[test]
    fn push_respects_declared_max() {
        let mut frame = tiny_frame();
        assert_eq!(frame.code.max_stack(), 2);
        frame.push(Value::Int(1)).unwrap();
        frame.push(Value::Int(2)).unwrap();
        assert!(matches!(
            frame.push(Value::Int(3)),
            Err(VmError::StackOverflow { max: 2 })
        ));
    }

    #[test]
    fn pop_on_empty_is_underflow() {
        let mut frame = tiny_frame();
        assert!(matches!(frame.pop(), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn drain_returns_top_first() {
        let mut frame = tiny_frame();
        frame.push(Value::Int(1)).unwrap();
        frame.push(Value::Int(2)).unwrap();
        let removed = frame.drain_to_depth(0);
        assert_eq!(removed, vec![Value::Int(2), Value::Int(1)]);
        assert!(frame.stack.is_empty());
    }

    #[test]
    fn equality_is_unit_ip_and_locals() {
        let a = tiny_frame();
        let mut b = tiny_frame();
        b.push(Value::Int(1)).unwrap();
        b.push_block(BlockKind::Loop, 4);
        assert_eq!(a, b);
        b.ip = 2;
        assert_ne!(a, b);
    }

    #[test]
    fn block_records_depth_at_push() {
        let mut frame = tiny_frame();
        frame.push(Value::Int(1)).unwrap();
        frame.push_block(BlockKind::Loop, 9);
        let block = frame.pop_block().unwrap();
        assert_eq!(block.depth, 1);
        assert_eq!(block.target, 9);
    }
}

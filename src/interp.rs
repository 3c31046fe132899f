//! The bytecode dispatch loop.
//!
//! Execution drives a flat `Vec<Frame>` call stack: calls push a frame,
//! returns pop one. Control transfers that cross protected regions (break,
//! continue, return, exceptions) are funneled through a single unwinding
//! routine that walks the block stack, so finally clauses run on every exit
//! path and the replacement rules between competing transfers live in one
//! place.
//!
//! Generators re-enter the loop through [`Interp::resume`] with a fresh
//! single-frame stack; `YieldValue` is only legal at depth one, which keeps
//! the flat call stack honest (a yield can never have to slice frames out of
//! the middle of the vector).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::code::{Const, CodeRegistry};
use crate::error::{GeneratorStateError, VmError};
use crate::exc::{ExcKind, ExceptionState, TraceNode};
use crate::frame::{BlockKind, Frame, PendingAction};
use crate::generator::{GenState, Generator};
use crate::op::Opcode;
use crate::trace::{TraceAnchor, TraceEdge, TraceSink};
use crate::value::{Builtin, FunctionObj, ListIter, Value};

/// Fetches the opcode byte at the instruction pointer, advancing it.
macro_rules! fetch_byte {
    ($frame:expr) => {{
        let byte = $frame.code.bytecode()[$frame.ip as usize];
        $frame.ip += 1;
        byte
    }};
}

/// Fetches a u8 operand.
macro_rules! fetch_u8 {
    ($frame:expr) => {
        fetch_byte!($frame)
    };
}

/// Fetches an i8 operand.
macro_rules! fetch_i8 {
    ($frame:expr) => {
        i8::from_ne_bytes([fetch_byte!($frame)])
    };
}

/// Fetches a u16 operand (little-endian).
macro_rules! fetch_u16 {
    ($frame:expr) => {{
        let lo = $frame.code.bytecode()[$frame.ip as usize];
        let hi = $frame.code.bytecode()[$frame.ip as usize + 1];
        $frame.ip += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

/// Fetches an i16 operand (little-endian).
macro_rules! fetch_i16 {
    ($frame:expr) => {{
        let lo = $frame.code.bytecode()[$frame.ip as usize];
        let hi = $frame.code.bytecode()[$frame.ip as usize + 1];
        $frame.ip += 2;
        i16::from_le_bytes([lo, hi])
    }};
}

/// Raises a catchable exception condition and resumes dispatch at whatever
/// handler (or unwound state) the block stacks produce.
macro_rules! raise {
    ($self:expr, $frames:expr, $ip:expr, $exc:expr) => {{
        $self.begin_raise($frames, $ip, $exc)?;
        continue;
    }};
}

/// Pops two operands, applies a fallible binary method and pushes the result.
macro_rules! binary_op {
    ($self:expr, $frames:expr, $frame:expr, $ip:expr, $method:ident) => {{
        let b = $frame.pop()?;
        let a = $frame.pop()?;
        match a.$method(&b) {
            Ok(v) => $frame.push(v)?,
            Err(e) => raise!($self, $frames, $ip, e),
        }
    }};
}

/// Pops two operands, compares them and pushes the boolean result.
macro_rules! compare_op {
    ($self:expr, $frames:expr, $frame:expr, $ip:expr, $pred:ident) => {{
        let b = $frame.pop()?;
        let a = $frame.pop()?;
        match a.compare(&b) {
            Ok(ord) => $frame.push(Value::Bool(ord.$pred()))?,
            Err(e) => raise!($self, $frames, $ip, e),
        }
    }};
}

/// Why the dispatch loop handed control back to its caller.
#[derive(Debug)]
pub enum Outcome {
    /// The outermost frame returned.
    Returned(Value),
    /// The (single) generator frame suspended at a yield; it is still the
    /// last entry of the frame vector.
    Yielded(Value),
}

/// Result of resuming a generator.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The body reached a yield.
    Yielded(Value),
    /// The body returned; the generator is now exhausted.
    Completed(Value),
}

/// The interpreter: registry access, trace hooks and recursion accounting.
///
/// One `Interp` drives one logical thread of execution. Generator resumes
/// nest native activations; `depth_base` carries the caller's frame count
/// into the nested run so the recursion limit bounds the combined depth.
pub struct Interp<'a, T: TraceSink> {
    registry: &'a CodeRegistry,
    trace: &'a mut T,
    recursion_limit: usize,
    depth_base: usize,
}

impl<'a, T: TraceSink> Interp<'a, T> {
    /// Creates an interpreter over `registry` reporting anchors to `trace`.
    pub fn new(registry: &'a CodeRegistry, trace: &'a mut T, recursion_limit: usize) -> Self {
        Self {
            registry,
            trace,
            recursion_limit,
            depth_base: 0,
        }
    }

    /// The registry this interpreter resolves compiled units against.
    #[must_use]
    pub fn registry(&self) -> &'a CodeRegistry {
        self.registry
    }

    /// Runs the frame stack until the outermost frame returns or the top
    /// frame yields.
    ///
    /// # Errors
    ///
    /// Fatal invariant violations ([`VmError::StackUnderflow`] and friends)
    /// abort immediately. An exception no handler catches surfaces as
    /// [`VmError::Uncaught`] with its full traceback.
    pub fn run(&mut self, frames: &mut Vec<Frame>) -> Result<Outcome, VmError> {
        loop {
            let call_depth = frames.len();
            let frame = frames.last_mut().expect("frame stack never empty while running");
            let instr_ip = frame.ip;

            if instr_ip as usize >= frame.code.bytecode().len() {
                return Err(VmError::IllegalInstruction("instruction pointer ran off the end"));
            }
            let byte = fetch_byte!(frame);
            let Some(op) = Opcode::from_repr(byte) else {
                return Err(VmError::InvalidOpcode(byte));
            };

            match op {
                // ============================================================
                // Stack manipulation
                // ============================================================
                Opcode::Nop => {}
                Opcode::Pop => {
                    frame.pop()?;
                }
                Opcode::Dup => {
                    let value = frame.peek()?.clone();
                    frame.push(value)?;
                }
                Opcode::Rot2 => {
                    let len = frame.stack.len();
                    if len < 2 {
                        return Err(VmError::StackUnderflow);
                    }
                    frame.stack.swap(len - 1, len - 2);
                }
                Opcode::Rot3 => {
                    let len = frame.stack.len();
                    if len < 3 {
                        return Err(VmError::StackUnderflow);
                    }
                    frame.stack[len - 3..].rotate_right(1);
                }

                // ============================================================
                // Constants and literals
                // ============================================================
                Opcode::LoadConst => {
                    let idx = fetch_u16!(frame);
                    let value = match frame.code.consts().get(idx as usize) {
                        Some(Const::None) => Value::None,
                        Some(Const::Bool(b)) => Value::Bool(*b),
                        Some(Const::Int(n)) => Value::Int(*n),
                        Some(Const::Float(f)) => Value::Float(*f),
                        Some(Const::Str(s)) => Value::Str(Arc::clone(s)),
                        // Code constants are consumed by MakeFunction directly.
                        Some(Const::Code(_)) | None => {
                            return Err(VmError::IllegalInstruction("bad constant index"))
                        }
                    };
                    frame.push(value)?;
                }
                Opcode::LoadNone => frame.push(Value::None)?,
                Opcode::LoadTrue => frame.push(Value::Bool(true))?,
                Opcode::LoadFalse => frame.push(Value::Bool(false))?,
                Opcode::LoadSmallInt => {
                    let n = fetch_i8!(frame);
                    frame.push(Value::Int(i64::from(n)))?;
                }

                // ============================================================
                // Fast locals
                // ============================================================
                Opcode::LoadFast => {
                    let slot = fetch_u8!(frame) as usize;
                    match frame.locals.get(slot) {
                        Some(Value::Undefined) | None => {
                            let name = local_name(frame, slot);
                            raise!(
                                self,
                                frames,
                                instr_ip,
                                ExceptionState::msg(
                                    ExcKind::UnboundLocalError,
                                    format!("local variable '{name}' referenced before assignment"),
                                )
                            );
                        }
                        Some(value) => {
                            let value = value.clone();
                            frame.push(value)?;
                        }
                    }
                }
                Opcode::StoreFast => {
                    let slot = fetch_u8!(frame) as usize;
                    let value = frame.pop()?;
                    match frame.locals.get_mut(slot) {
                        Some(place) => *place = value,
                        None => return Err(VmError::IllegalInstruction("fast-local slot out of range")),
                    }
                }
                Opcode::DeleteFast => {
                    let slot = fetch_u8!(frame) as usize;
                    match frame.locals.get_mut(slot) {
                        Some(place) if !matches!(place, Value::Undefined) => *place = Value::Undefined,
                        Some(_) => {
                            let name = local_name(frame, slot);
                            raise!(
                                self,
                                frames,
                                instr_ip,
                                ExceptionState::msg(
                                    ExcKind::UnboundLocalError,
                                    format!("local variable '{name}' referenced before assignment"),
                                )
                            );
                        }
                        None => return Err(VmError::IllegalInstruction("fast-local slot out of range")),
                    }
                }

                // ============================================================
                // Named variables
                // ============================================================
                Opcode::LoadGlobal => {
                    let idx = fetch_u16!(frame);
                    let name = name_at(frame, idx)?;
                    let found = frame
                        .globals
                        .borrow()
                        .get(&name)
                        .or_else(|| frame.builtins.borrow().get(&name));
                    match found {
                        Some(value) => frame.push(value)?,
                        None => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(ExcKind::NameError, format!("name '{name}' is not defined"))
                        ),
                    }
                }
                Opcode::StoreGlobal => {
                    let idx = fetch_u16!(frame);
                    let name = name_at(frame, idx)?;
                    let value = frame.pop()?;
                    frame.globals.borrow_mut().set(name, value);
                }
                Opcode::LoadName => {
                    let idx = fetch_u16!(frame);
                    let name = name_at(frame, idx)?;
                    let found = frame
                        .names
                        .as_ref()
                        .and_then(|ns| ns.borrow().get(&name))
                        .or_else(|| frame.globals.borrow().get(&name))
                        .or_else(|| frame.builtins.borrow().get(&name));
                    match found {
                        Some(value) => frame.push(value)?,
                        None => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(ExcKind::NameError, format!("name '{name}' is not defined"))
                        ),
                    }
                }
                Opcode::StoreName => {
                    let idx = fetch_u16!(frame);
                    let name = name_at(frame, idx)?;
                    let value = frame.pop()?;
                    match &frame.names {
                        Some(ns) => ns.borrow_mut().set(name, value),
                        None => frame.globals.borrow_mut().set(name, value),
                    }
                }
                Opcode::DeleteName => {
                    let idx = fetch_u16!(frame);
                    let name = name_at(frame, idx)?;
                    let removed = match &frame.names {
                        Some(ns) => ns.borrow_mut().remove(&name),
                        None => frame.globals.borrow_mut().remove(&name),
                    };
                    if removed.is_none() {
                        raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(ExcKind::NameError, format!("name '{name}' is not defined"))
                        );
                    }
                }

                // ============================================================
                // Cells
                // ============================================================
                Opcode::LoadCell => {
                    let slot = fetch_u8!(frame) as usize;
                    let value = cell_at(frame, slot)?.get();
                    if matches!(value, Value::Undefined) {
                        let name = cell_name(frame, slot);
                        raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(
                                ExcKind::NameError,
                                format!("free variable '{name}' referenced before assignment"),
                            )
                        );
                    }
                    frame.push(value)?;
                }
                Opcode::StoreCell => {
                    let slot = fetch_u8!(frame) as usize;
                    let value = frame.pop()?;
                    cell_at(frame, slot)?.set(value);
                }
                Opcode::LoadClosure => {
                    let slot = fetch_u8!(frame) as usize;
                    let cell = cell_at(frame, slot)?.clone();
                    frame.push(Value::Cell(cell))?;
                }

                // ============================================================
                // Arithmetic and comparison
                // ============================================================
                Opcode::BinaryAdd => binary_op!(self, frames, frame, instr_ip, add),
                Opcode::BinarySub => binary_op!(self, frames, frame, instr_ip, sub),
                Opcode::BinaryMul => binary_op!(self, frames, frame, instr_ip, mul),
                Opcode::BinaryDiv => binary_op!(self, frames, frame, instr_ip, div),
                Opcode::BinaryFloorDiv => binary_op!(self, frames, frame, instr_ip, floor_div),
                Opcode::BinaryMod => binary_op!(self, frames, frame, instr_ip, modulo),
                Opcode::CompareEq => {
                    let b = frame.pop()?;
                    let a = frame.pop()?;
                    frame.push(Value::Bool(a == b))?;
                }
                Opcode::CompareNe => {
                    let b = frame.pop()?;
                    let a = frame.pop()?;
                    frame.push(Value::Bool(a != b))?;
                }
                Opcode::CompareLt => compare_op!(self, frames, frame, instr_ip, is_lt),
                Opcode::CompareLe => compare_op!(self, frames, frame, instr_ip, is_le),
                Opcode::CompareGt => compare_op!(self, frames, frame, instr_ip, is_gt),
                Opcode::CompareGe => compare_op!(self, frames, frame, instr_ip, is_ge),
                Opcode::UnaryNot => {
                    let value = frame.pop()?;
                    frame.push(Value::Bool(!value.truthy()))?;
                }
                Opcode::UnaryNeg => {
                    let value = frame.pop()?;
                    match value.neg() {
                        Ok(v) => frame.push(v)?,
                        Err(e) => raise!(self, frames, instr_ip, e),
                    }
                }

                // ============================================================
                // Jumps
                // ============================================================
                Opcode::Jump => {
                    let rel = fetch_i16!(frame);
                    if rel < 0 {
                        self.trace.anchor(TraceAnchor {
                            code: frame.code.id(),
                            offset: instr_ip,
                            profiled: frame.code.flags().profiled,
                            edge: TraceEdge::LoopBackEdge,
                        });
                    }
                    jump_relative(frame, rel)?;
                }
                Opcode::JumpIfTrue => {
                    let rel = fetch_i16!(frame);
                    if frame.pop()?.truthy() {
                        if rel < 0 {
                            self.trace.anchor(TraceAnchor {
                                code: frame.code.id(),
                                offset: instr_ip,
                                profiled: frame.code.flags().profiled,
                                edge: TraceEdge::LoopBackEdge,
                            });
                        }
                        jump_relative(frame, rel)?;
                    }
                }
                Opcode::JumpIfFalse => {
                    let rel = fetch_i16!(frame);
                    if !frame.pop()?.truthy() {
                        if rel < 0 {
                            self.trace.anchor(TraceAnchor {
                                code: frame.code.id(),
                                offset: instr_ip,
                                profiled: frame.code.flags().profiled,
                                edge: TraceEdge::LoopBackEdge,
                            });
                        }
                        jump_relative(frame, rel)?;
                    }
                }

                // ============================================================
                // Iteration
                // ============================================================
                Opcode::GetIter => {
                    let value = frame.pop()?;
                    match value {
                        Value::List(list) => {
                            frame.push(Value::Iter(Rc::new(RefCell::new(ListIter { list, index: 0 }))))?;
                        }
                        v @ (Value::Iter(_) | Value::Generator(_)) => frame.push(v)?,
                        other => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(
                                ExcKind::TypeError,
                                format!("'{}' object is not iterable", other.type_name()),
                            )
                        ),
                    }
                }
                Opcode::ForIter => {
                    let rel = fetch_i16!(frame);
                    match frame.peek()?.clone() {
                        Value::Iter(iter) => {
                            let item = iter.borrow_mut().next();
                            match item {
                                Some(v) => frame.push(v)?,
                                None => {
                                    frame.pop()?;
                                    jump_relative(frame, rel)?;
                                }
                            }
                        }
                        Value::Generator(gen) => {
                            if call_depth + self.depth_base >= self.recursion_limit {
                                raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(ExcKind::RecursionError, "maximum recursion depth exceeded")
                                );
                            }
                            let base = self.depth_base;
                            self.depth_base = base + call_depth;
                            let result = self.resume(&gen, Value::None);
                            self.depth_base = base;
                            let frame = frames.last_mut().expect("frame stack never empty while running");
                            match result {
                                Ok(ResumeOutcome::Yielded(v)) => frame.push(v)?,
                                Ok(ResumeOutcome::Completed(_))
                                | Err(VmError::Generator(GeneratorStateError::Exhausted)) => {
                                    frame.pop()?;
                                    jump_relative(frame, rel)?;
                                }
                                Err(VmError::Uncaught(exc)) => raise!(self, frames, instr_ip, exc),
                                Err(VmError::Generator(GeneratorStateError::AlreadyRunning)) => raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(ExcKind::ValueError, "generator already executing")
                                ),
                                Err(other) => return Err(other),
                            }
                        }
                        other => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(
                                ExcKind::TypeError,
                                format!("'{}' object is not an iterator", other.type_name()),
                            )
                        ),
                    }
                }

                // ============================================================
                // Block stack
                // ============================================================
                Opcode::SetupLoop => {
                    let target = fetch_u16!(frame);
                    frame.push_block(BlockKind::Loop, target);
                }
                Opcode::SetupExcept => {
                    let target = fetch_u16!(frame);
                    frame.push_block(BlockKind::Except, target);
                }
                Opcode::SetupFinally => {
                    let target = fetch_u16!(frame);
                    frame.push_block(BlockKind::Finally, target);
                }
                Opcode::SetupContext => {
                    let target = fetch_u16!(frame);
                    frame.push_block(BlockKind::ContextExit, target);
                }
                Opcode::PopBlock => {
                    frame.pop_block()?;
                }
                Opcode::EndFinally => {
                    let sentinel = frame.pop()?;
                    match sentinel {
                        // Normal entry into the finally body: fall through.
                        Value::None => {}
                        Value::Pending(action) => {
                            if let Some(outcome) = self.run_action(frames, *action)? {
                                return Ok(outcome);
                            }
                        }
                        _ => return Err(VmError::MalformedBlockStack("unexpected value at end of finally")),
                    }
                }
                Opcode::Break => {
                    if let Some(outcome) = self.run_action(frames, PendingAction::Break)? {
                        return Ok(outcome);
                    }
                }
                Opcode::Continue => {
                    let target = fetch_u16!(frame);
                    if let Some(outcome) =
                        self.run_action(frames, PendingAction::Continue(u32::from(target)))?
                    {
                        return Ok(outcome);
                    }
                }

                // ============================================================
                // Exceptions
                // ============================================================
                Opcode::RaiseNew => {
                    let kind_byte = fetch_u8!(frame);
                    let Some(kind) = ExcKind::from_repr(kind_byte) else {
                        return Err(VmError::IllegalInstruction("unknown exception kind operand"));
                    };
                    let payload = frame.pop()?;
                    raise!(self, frames, instr_ip, ExceptionState::new(kind, payload));
                }
                Opcode::Raise => {
                    let value = frame.pop()?;
                    match value {
                        Value::Exc(exc) => raise!(self, frames, instr_ip, (*exc).clone()),
                        other => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(
                                ExcKind::TypeError,
                                format!("exceptions must be exception values, not '{}'", other.type_name()),
                            )
                        ),
                    }
                }
                Opcode::Reraise => match frame.last_exception.clone() {
                    Some(exc) => raise!(self, frames, instr_ip, exc),
                    None => raise!(
                        self,
                        frames,
                        instr_ip,
                        ExceptionState::msg(ExcKind::RuntimeError, "no active exception to reraise")
                    ),
                },
                Opcode::PopExcept => {
                    frame.last_exception = None;
                }
                Opcode::ExcMatch => {
                    let kind_byte = fetch_u8!(frame);
                    let Some(handler) = ExcKind::from_repr(kind_byte) else {
                        return Err(VmError::IllegalInstruction("unknown exception kind operand"));
                    };
                    let matched = match frame.peek()? {
                        Value::Exc(exc) => exc.kind.matches(handler),
                        _ => return Err(VmError::IllegalInstruction("exception match on non-exception")),
                    };
                    frame.push(Value::Bool(matched))?;
                }
                Opcode::ExcPayload => {
                    let payload = match frame.peek()? {
                        Value::Exc(exc) => exc.payload.clone(),
                        _ => return Err(VmError::IllegalInstruction("payload of non-exception")),
                    };
                    frame.push(payload)?;
                }

                // ============================================================
                // Functions and calls
                // ============================================================
                Opcode::MakeFunction => {
                    let idx = fetch_u16!(frame);
                    let function = make_function(frame, idx, Vec::new())?;
                    frame.push(function)?;
                }
                Opcode::MakeClosure => {
                    let idx = fetch_u16!(frame);
                    let cell_count = fetch_u8!(frame) as usize;
                    let mut cells = Vec::with_capacity(cell_count);
                    for _ in 0..cell_count {
                        match frame.pop()? {
                            Value::Cell(cell) => cells.push(cell),
                            _ => return Err(VmError::IllegalInstruction("closure capture is not a cell")),
                        }
                    }
                    cells.reverse();
                    let function = make_function(frame, idx, cells)?;
                    frame.push(function)?;
                }
                Opcode::CallFunction => {
                    let argc = fetch_u8!(frame) as usize;
                    if frame.stack.len() < argc + 1 {
                        return Err(VmError::StackUnderflow);
                    }
                    let mut args = frame.stack.split_off(frame.stack.len() - argc);
                    let callee = frame.pop()?;
                    match callee {
                        Value::Function(func) => {
                            if args.len() != func.code.arg_count() as usize {
                                raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(
                                        ExcKind::TypeError,
                                        format!(
                                            "{}() takes {} arguments ({} given)",
                                            func.name,
                                            func.code.arg_count(),
                                            args.len()
                                        ),
                                    )
                                );
                            }
                            if func.code.flags().generator {
                                let gen_frame = Frame::activate(&func, args);
                                let gen = Generator::new(Arc::clone(&func.name), gen_frame);
                                frame.push(Value::Generator(Rc::new(RefCell::new(gen))))?;
                            } else {
                                if call_depth + self.depth_base >= self.recursion_limit {
                                    raise!(
                                        self,
                                        frames,
                                        instr_ip,
                                        ExceptionState::msg(
                                            ExcKind::RecursionError,
                                            "maximum recursion depth exceeded",
                                        )
                                    );
                                }
                                self.trace.anchor(TraceAnchor {
                                    code: func.code.id(),
                                    offset: 0,
                                    profiled: func.code.flags().profiled,
                                    edge: TraceEdge::Call,
                                });
                                frames.push(Frame::activate(&func, args));
                            }
                        }
                        Value::Builtin(Builtin::Next) => {
                            if args.len() != 1 {
                                raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(
                                        ExcKind::TypeError,
                                        format!("next() takes 1 argument ({} given)", args.len()),
                                    )
                                );
                            }
                            let arg = args.pop().expect("length checked above");
                            match self.builtin_next(frames, call_depth, instr_ip, arg)? {
                                Some(outcome) => return Ok(outcome),
                                None => continue,
                            }
                        }
                        Value::Builtin(Builtin::Len) => {
                            if args.len() != 1 {
                                raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(
                                        ExcKind::TypeError,
                                        format!("len() takes 1 argument ({} given)", args.len()),
                                    )
                                );
                            }
                            let arg = args.pop().expect("length checked above");
                            match arg {
                                Value::List(list) => {
                                    let n = list.borrow().len();
                                    frame.push(Value::Int(n as i64))?;
                                }
                                Value::Str(s) => frame.push(Value::Int(s.chars().count() as i64))?,
                                other => raise!(
                                    self,
                                    frames,
                                    instr_ip,
                                    ExceptionState::msg(
                                        ExcKind::TypeError,
                                        format!("object of type '{}' has no len()", other.type_name()),
                                    )
                                ),
                            }
                        }
                        other => raise!(
                            self,
                            frames,
                            instr_ip,
                            ExceptionState::msg(
                                ExcKind::TypeError,
                                format!("'{}' object is not callable", other.type_name()),
                            )
                        ),
                    }
                }
                Opcode::ReturnValue => {
                    let value = frame.pop()?;
                    if let Some(outcome) = self.run_action(frames, PendingAction::Return(value))? {
                        return Ok(outcome);
                    }
                }
                Opcode::YieldValue => {
                    if call_depth != 1 || !frame.code.flags().generator {
                        return Err(VmError::IllegalInstruction("yield outside a generator activation"));
                    }
                    let value = frame.pop()?;
                    self.trace.anchor(TraceAnchor {
                        code: frame.code.id(),
                        offset: instr_ip,
                        profiled: frame.code.flags().profiled,
                        edge: TraceEdge::Yield,
                    });
                    return Ok(Outcome::Yielded(value));
                }

                // ============================================================
                // Collections
                // ============================================================
                Opcode::BuildList => {
                    let count = fetch_u16!(frame) as usize;
                    if frame.stack.len() < count {
                        return Err(VmError::StackUnderflow);
                    }
                    let items = frame.stack.split_off(frame.stack.len() - count);
                    frame.push(Value::list(items))?;
                }
            }
        }
    }

    // ========================================================================
    // Generator entry points
    // ========================================================================

    /// Resumes a generator, sending `sent` to the waiting yield expression.
    ///
    /// # Errors
    ///
    /// Lifecycle misuse surfaces as [`VmError::Generator`]; an exception the
    /// body does not catch surfaces as [`VmError::Uncaught`] and exhausts the
    /// generator.
    pub fn resume(&mut self, gen: &Rc<RefCell<Generator>>, sent: Value) -> Result<ResumeOutcome, VmError> {
        let started = gen.borrow().state() == GenState::Suspended;
        let mut frame = gen.borrow_mut().check_out(&sent).map_err(VmError::Generator)?;
        if started {
            // The yield that suspended us popped its value; the sent value
            // takes its place as the result of the yield expression.
            if let Err(e) = frame.push(sent) {
                gen.borrow_mut().park(frame);
                return Err(e);
            }
        }
        let mut frames = vec![frame];
        match self.run(&mut frames) {
            Ok(Outcome::Yielded(value)) => {
                let frame = frames.pop().ok_or(VmError::IllegalInstruction("yield lost its frame"))?;
                gen.borrow_mut().park(frame);
                Ok(ResumeOutcome::Yielded(value))
            }
            Ok(Outcome::Returned(value)) => {
                gen.borrow_mut().finish(value.clone());
                Ok(ResumeOutcome::Completed(value))
            }
            Err(e) => {
                gen.borrow_mut().finish(Value::None);
                Err(e)
            }
        }
    }

    /// Throws an exception into a generator: at its yield point when
    /// suspended, at the top of the body when it has never been resumed.
    ///
    /// # Errors
    ///
    /// As for [`resume`](Self::resume); an exhausted generator fails with
    /// the matching lifecycle error.
    pub fn throw_into(
        &mut self,
        gen: &Rc<RefCell<Generator>>,
        mut exc: ExceptionState,
    ) -> Result<ResumeOutcome, VmError> {
        let frame = gen.borrow_mut().check_out(&Value::None).map_err(VmError::Generator)?;
        // The injection point counts as a raising frame: record its node so
        // an unhandled throw carries the generator in its traceback.
        exc.traceback.push_outer(TraceNode {
            code: frame.code.id(),
            offset: frame.ip,
            line: frame.code.line_for(frame.ip),
        });
        let mut frames = vec![frame];
        match self.run_action(&mut frames, PendingAction::Raise(exc)) {
            Ok(Some(Outcome::Returned(value))) => {
                gen.borrow_mut().finish(value.clone());
                return Ok(ResumeOutcome::Completed(value));
            }
            Ok(Some(Outcome::Yielded(_))) | Ok(None) => {}
            Err(e) => {
                gen.borrow_mut().finish(Value::None);
                return Err(e);
            }
        }
        match self.run(&mut frames) {
            Ok(Outcome::Yielded(value)) => {
                let frame = frames.pop().ok_or(VmError::IllegalInstruction("yield lost its frame"))?;
                gen.borrow_mut().park(frame);
                Ok(ResumeOutcome::Yielded(value))
            }
            Ok(Outcome::Returned(value)) => {
                gen.borrow_mut().finish(value.clone());
                Ok(ResumeOutcome::Completed(value))
            }
            Err(e) => {
                gen.borrow_mut().finish(Value::None);
                Err(e)
            }
        }
    }

    /// Closes a generator by injecting the close signal at its suspension
    /// point. Idempotent on exhausted generators.
    ///
    /// # Errors
    ///
    /// [`GeneratorStateError::CloseIgnored`] when the body catches the signal
    /// and yields again; any other exception the body raises propagates.
    pub fn close(&mut self, gen: &Rc<RefCell<Generator>>) -> Result<(), VmError> {
        let state = gen.borrow().state();
        match state {
            GenState::Created => {
                // Never started: nothing to unwind.
                gen.borrow_mut().mark_closed();
                return Ok(());
            }
            GenState::Completed | GenState::Closed => return Ok(()),
            GenState::Running => return Err(GeneratorStateError::AlreadyRunning.into()),
            GenState::Suspended => {}
        }
        match self.throw_into(gen, ExceptionState::bare(ExcKind::GeneratorExit)) {
            Ok(ResumeOutcome::Completed(_)) => {
                gen.borrow_mut().mark_closed();
                Ok(())
            }
            Ok(ResumeOutcome::Yielded(_)) => Err(GeneratorStateError::CloseIgnored.into()),
            Err(VmError::Uncaught(exc)) if exc.kind == ExcKind::GeneratorExit => {
                gen.borrow_mut().mark_closed();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Unwinding
    // ========================================================================

    /// Attaches the traceback node for the raising frame and starts
    /// unwinding. `Ok(())` means a handler or finally clause took over;
    /// dispatch resumes at the updated instruction pointer.
    fn begin_raise(&mut self, frames: &mut Vec<Frame>, instr_ip: u32, mut exc: ExceptionState) -> Result<(), VmError> {
        if let Some(frame) = frames.last() {
            exc.traceback.push_outer(TraceNode {
                code: frame.code.id(),
                offset: instr_ip,
                line: frame.code.line_for(instr_ip),
            });
        }
        match self.run_action(frames, PendingAction::Raise(exc))? {
            None => Ok(()),
            // A raise never resolves into a return.
            Some(_) => Err(VmError::MalformedBlockStack("raise resolved to a return")),
        }
    }

    /// Delivers a control transfer through the block stacks.
    ///
    /// Walks the top frame's blocks innermost first; finally clauses park the
    /// action on the stack and take control, handlers catch exceptions, loops
    /// absorb break/continue. A return or exception that exhausts a frame's
    /// blocks pops the frame and continues in the caller. `Ok(None)` means
    /// control is transferred and dispatch should continue; `Ok(Some(..))`
    /// means the outermost frame resolved a return.
    fn run_action(&mut self, frames: &mut Vec<Frame>, mut action: PendingAction) -> Result<Option<Outcome>, VmError> {
        loop {
            let frame = frames.last_mut().expect("frame stack never empty while unwinding");
            while let Some(block) = frame.blocks.last().copied() {
                match block.kind {
                    BlockKind::Finally | BlockKind::ContextExit => {
                        frame.blocks.pop();
                        trim_absorbing(frame, block.depth, &mut action);
                        frame.push(Value::Pending(Box::new(action)))?;
                        frame.ip = u32::from(block.target);
                        return Ok(None);
                    }
                    BlockKind::Except => {
                        if let PendingAction::Raise(exc) = action {
                            frame.blocks.pop();
                            let mut raise = PendingAction::Raise(exc);
                            trim_absorbing(frame, block.depth, &mut raise);
                            let PendingAction::Raise(exc) = raise else {
                                return Err(VmError::MalformedBlockStack("exception lost during unwind"));
                            };
                            frame.last_exception = Some(exc.clone());
                            frame.ip = u32::from(block.target);
                            self.trace.anchor(TraceAnchor {
                                code: frame.code.id(),
                                offset: u32::from(block.target),
                                profiled: frame.code.flags().profiled,
                                edge: TraceEdge::Catch,
                            });
                            frame.push(Value::Exc(Rc::new(exc)))?;
                            return Ok(None);
                        }
                        frame.blocks.pop();
                        trim_absorbing(frame, block.depth, &mut action);
                    }
                    BlockKind::Loop => match action {
                        PendingAction::Break => {
                            frame.blocks.pop();
                            trim_absorbing(frame, block.depth, &mut action);
                            frame.ip = u32::from(block.target);
                            return Ok(None);
                        }
                        PendingAction::Continue(target) => {
                            // The loop block survives a continue; the head's
                            // statically known depth says what to keep.
                            let depth = frame
                                .code
                                .declared_depth_at(target)
                                .ok_or(VmError::MalformedBlockStack("continue target has no stack depth"))?;
                            trim_absorbing(frame, depth, &mut action);
                            frame.ip = target;
                            return Ok(None);
                        }
                        _ => {
                            frame.blocks.pop();
                            trim_absorbing(frame, block.depth, &mut action);
                        }
                    },
                }
            }

            // Block stack exhausted: the action leaves this frame.
            match action {
                PendingAction::Return(value) => {
                    self.trace.anchor(TraceAnchor {
                        code: frame.code.id(),
                        offset: frame.ip,
                        profiled: frame.code.flags().profiled,
                        edge: TraceEdge::Return,
                    });
                    if frames.len() == 1 {
                        return Ok(Some(Outcome::Returned(value)));
                    }
                    frames.pop();
                    let caller = frames.last_mut().expect("caller frame present");
                    caller.push(value)?;
                    return Ok(None);
                }
                PendingAction::Raise(exc) => {
                    // Exceptions still parked on the dying frame's stack were
                    // displaced by this one; keep them visible as context.
                    let mut action_out = PendingAction::Raise(exc);
                    trim_absorbing(frame, 0, &mut action_out);
                    let PendingAction::Raise(exc) = action_out else {
                        return Err(VmError::MalformedBlockStack("exception lost during unwind"));
                    };
                    frames.pop();
                    let Some(caller) = frames.last() else {
                        return Err(VmError::Uncaught(exc));
                    };
                    let mut exc = exc;
                    exc.traceback.push_outer(TraceNode {
                        code: caller.code.id(),
                        offset: caller.ip,
                        line: caller.code.line_for(caller.ip),
                    });
                    action = PendingAction::Raise(exc);
                }
                PendingAction::Break | PendingAction::Continue(_) => {
                    return Err(VmError::MalformedBlockStack("break or continue outside a loop"));
                }
            }
        }
    }

    /// Implements the interpreted `next()` builtin. Returns `Ok(Some(..))`
    /// only if unwinding resolved the whole activation.
    fn builtin_next(
        &mut self,
        frames: &mut Vec<Frame>,
        call_depth: usize,
        instr_ip: u32,
        arg: Value,
    ) -> Result<Option<Outcome>, VmError> {
        let raise = |this: &mut Self, frames: &mut Vec<Frame>, exc: ExceptionState| {
            this.begin_raise(frames, instr_ip, exc).map(|()| None)
        };
        match arg {
            Value::Iter(iter) => {
                let item = iter.borrow_mut().next();
                match item {
                    Some(v) => {
                        let frame = frames.last_mut().expect("frame stack never empty while running");
                        frame.push(v)?;
                        Ok(None)
                    }
                    None => raise(self, frames, ExceptionState::bare(ExcKind::StopIteration)),
                }
            }
            Value::Generator(gen) => {
                if call_depth + self.depth_base >= self.recursion_limit {
                    return raise(
                        self,
                        frames,
                        ExceptionState::msg(ExcKind::RecursionError, "maximum recursion depth exceeded"),
                    );
                }
                let base = self.depth_base;
                self.depth_base = base + call_depth;
                let result = self.resume(&gen, Value::None);
                self.depth_base = base;
                match result {
                    Ok(ResumeOutcome::Yielded(v)) => {
                        let frame = frames.last_mut().expect("frame stack never empty while running");
                        frame.push(v)?;
                        Ok(None)
                    }
                    Ok(ResumeOutcome::Completed(value)) => {
                        raise(self, frames, ExceptionState::new(ExcKind::StopIteration, value))
                    }
                    Err(VmError::Generator(GeneratorStateError::Exhausted)) => {
                        raise(self, frames, ExceptionState::bare(ExcKind::StopIteration))
                    }
                    Err(VmError::Generator(GeneratorStateError::AlreadyRunning)) => raise(
                        self,
                        frames,
                        ExceptionState::msg(ExcKind::ValueError, "generator already executing"),
                    ),
                    // The body raised: propagate into the calling frame as a
                    // catchable condition carrying the body's traceback.
                    Err(VmError::Uncaught(exc)) => {
                        match self.run_action(frames, PendingAction::Raise(exc))? {
                            None => Ok(None),
                            Some(_) => Err(VmError::MalformedBlockStack("raise resolved to a return")),
                        }
                    }
                    Err(other) => Err(other),
                }
            }
            other => raise(
                self,
                frames,
                ExceptionState::msg(
                    ExcKind::TypeError,
                    format!("'{}' object is not an iterator", other.type_name()),
                ),
            ),
        }
    }
}

/// Pops values down to `depth`, folding any parked exception into the context
/// chain of a raise that is replacing it. Non-raise replacements drop the
/// parked exception.
fn trim_absorbing(frame: &mut Frame, depth: u16, action: &mut PendingAction) {
    for value in frame.drain_to_depth(depth) {
        if let Value::Pending(parked) = value {
            if let PendingAction::Raise(orig) = *parked {
                if let PendingAction::Raise(current) = action {
                    attach_context(current, orig);
                }
            }
        }
    }
}

/// Appends `orig` to the end of `current`'s context chain.
fn attach_context(current: &mut ExceptionState, orig: ExceptionState) {
    match &mut current.context {
        Some(next) => attach_context(next, orig),
        None => current.context = Some(Box::new(orig)),
    }
}

fn jump_relative(frame: &mut Frame, rel: i16) -> Result<(), VmError> {
    let target = i64::from(frame.ip) + i64::from(rel);
    frame.ip = u32::try_from(target).map_err(|_| VmError::IllegalInstruction("jump to negative offset"))?;
    Ok(())
}

fn name_at(frame: &Frame, idx: u16) -> Result<Arc<str>, VmError> {
    frame
        .code
        .names()
        .get(idx as usize)
        .cloned()
        .ok_or(VmError::IllegalInstruction("name index out of range"))
}

fn local_name(frame: &Frame, slot: usize) -> String {
    frame
        .code
        .varnames()
        .get(slot)
        .map_or_else(|| format!("<slot {slot}>"), |n| n.to_string())
}

fn cell_name(frame: &Frame, slot: usize) -> String {
    let cellvars = frame.code.cellvars();
    let name = if slot < cellvars.len() {
        cellvars.get(slot)
    } else {
        frame.code.freevars().get(slot - cellvars.len())
    };
    name.map_or_else(|| format!("<cell {slot}>"), |n| n.to_string())
}

fn cell_at(frame: &Frame, slot: usize) -> Result<&crate::value::Cell, VmError> {
    frame
        .cells
        .get(slot)
        .ok_or(VmError::IllegalInstruction("cell slot out of range"))
}

fn make_function(frame: &Frame, const_idx: u16, closure: Vec<crate::value::Cell>) -> Result<Value, VmError> {
    let Some(Const::Code(code)) = frame.code.consts().get(const_idx as usize) else {
        return Err(VmError::IllegalInstruction("function constant is not a compiled unit"));
    };
    Ok(Value::Function(Rc::new(FunctionObj {
        name: code.name().into(),
        code: Arc::clone(code),
        globals: Rc::clone(&frame.globals),
        builtins: Rc::clone(&frame.builtins),
        closure,
    })))
}


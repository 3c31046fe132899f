//! Compiled units: immutable bytecode plus its pools and static analysis.
//!
//! A [`Code`] is the unit of execution for a module body, a function body or a
//! dynamically executed snippet. It is immutable after construction and shared
//! by `Arc`, so many frames (and suspended generators) can execute the same
//! unit concurrently with no copying. Identity for serialized continuations is
//! the registry-assigned [`CodeId`], never the bytecode bytes.
//!
//! [`CodeBuilder`] assembles bytecode with forward-reference labels and runs a
//! worklist dataflow pass over the control-flow graph that computes the exact
//! operand-stack depth at every instruction start. The interpreter and the
//! continuation serializer both rely on that table: the depth at any offset is
//! a static property of the unit, so a captured frame's stack length can be
//! validated on restore.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CodeError;
use crate::op::Opcode;

/// Registry-assigned identity of a compiled unit.
///
/// Continuation streams reference units by this id; both sides of a
/// serialize/deserialize round trip must register the same units in the same
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeId(pub u32);

/// A constant-pool entry.
#[derive(Debug, Clone)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A nested compiled unit (function or generator body), consumed by
    /// `MakeFunction`/`MakeClosure`.
    Code(Arc<Code>),
}

/// Static properties of a compiled unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeFlags {
    /// The unit contains `YieldValue`; calling it creates a generator instead
    /// of running the body.
    pub generator: bool,
    /// The unit resolves names through a dict at runtime (`LoadName`/
    /// `StoreName`) instead of fast-local slots. Set for module bodies and
    /// dynamically executed snippets.
    pub dynamic_namespace: bool,
    /// Advisory hint for an acceleration layer, carried on every trace
    /// anchor this unit emits. Execution semantics never depend on it.
    pub profiled: bool,
}

/// An immutable compiled unit.
#[derive(Debug)]
pub struct Code {
    id: CodeId,
    name: Arc<str>,
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<Arc<str>>,
    varnames: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    arg_count: u8,
    flags: CodeFlags,
    max_stack: u16,
    /// Entry depth per bytecode offset; `UNREACHABLE` for operand bytes and
    /// dead offsets.
    depths: Vec<u16>,
    /// (offset, line) pairs sorted by offset.
    lines: Vec<(u32, u32)>,
}

const UNREACHABLE: u16 = u16::MAX;

impl Code {
    /// Registry-assigned identity.
    #[must_use]
    pub fn id(&self) -> CodeId {
        self.id
    }

    /// Unit name, for tracebacks.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw bytecode.
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Constant pool.
    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.consts
    }

    /// Names referenced by `LoadGlobal`/`LoadName` and friends.
    #[must_use]
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    /// Fast-local slot names; the first `arg_count` are parameters.
    #[must_use]
    pub fn varnames(&self) -> &[Arc<str>] {
        &self.varnames
    }

    /// Variables this unit defines and closes over (cells created at entry).
    #[must_use]
    pub fn cellvars(&self) -> &[Arc<str>] {
        &self.cellvars
    }

    /// Variables this unit captures from an enclosing unit.
    #[must_use]
    pub fn freevars(&self) -> &[Arc<str>] {
        &self.freevars
    }

    /// Number of positional parameters.
    #[must_use]
    pub fn arg_count(&self) -> u8 {
        self.arg_count
    }

    /// Static flags.
    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Maximum operand-stack depth any execution of this unit can reach.
    #[must_use]
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// Statically computed operand-stack depth at an instruction start, or
    /// `None` for operand bytes and unreachable offsets.
    #[must_use]
    pub fn declared_depth_at(&self, offset: u32) -> Option<u16> {
        match self.depths.get(offset as usize) {
            Some(&d) if d != UNREACHABLE => Some(d),
            _ => None,
        }
    }

    /// Source line for an offset, 0 when no line has been recorded.
    #[must_use]
    pub fn line_for(&self, offset: u32) -> u32 {
        match self.lines.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(i) => self.lines[i].1,
            Err(0) => 0,
            Err(i) => self.lines[i - 1].1,
        }
    }
}

/// Owns every compiled unit and hands out [`CodeId`]s.
///
/// Deserializing a continuation resolves CODE-REF records against this
/// registry; a stream produced against a differently populated registry fails
/// with `SerializationError::UnknownCode` rather than executing the wrong
/// bytecode.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    units: Vec<Arc<Code>>,
}

impl CodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a unit by id.
    #[must_use]
    pub fn get(&self, id: CodeId) -> Option<&Arc<Code>> {
        self.units.get(id.0 as usize)
    }

    /// Number of registered units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True when no unit has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn next_id(&self) -> CodeId {
        CodeId(self.units.len() as u32)
    }
}

/// A forward-referenceable bytecode position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum PatchKind {
    /// i16 offset relative to the end of the operand.
    Relative,
    /// u16 absolute bytecode offset.
    Absolute,
}

#[derive(Debug, Clone, Copy)]
struct Patch {
    site: usize,
    label: Label,
    kind: PatchKind,
}

/// Assembles a [`Code`] unit: emits instructions, resolves labels, runs the
/// depth analysis and registers the finished unit.
#[derive(Debug)]
pub struct CodeBuilder {
    name: Arc<str>,
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<Arc<str>>,
    varnames: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    arg_count: u8,
    flags: CodeFlags,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
    lines: Vec<(u32, u32)>,
}

impl CodeBuilder {
    /// Starts a new unit with the given name.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            bytecode: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            arg_count: 0,
            flags: CodeFlags::default(),
            labels: Vec::new(),
            patches: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Sets the number of positional parameters (the first `n` varnames).
    pub fn arg_count(&mut self, n: u8) -> &mut Self {
        self.arg_count = n;
        self
    }

    /// Marks the unit as a generator body.
    pub fn generator(&mut self) -> &mut Self {
        self.flags.generator = true;
        self
    }

    /// Marks the unit as resolving names through a runtime dict.
    pub fn dynamic_namespace(&mut self) -> &mut Self {
        self.flags.dynamic_namespace = true;
        self
    }

    /// Marks the unit as interesting to an acceleration layer.
    pub fn profiled(&mut self) -> &mut Self {
        self.flags.profiled = true;
        self
    }

    /// Adds a constant, returning its pool index.
    pub fn add_const(&mut self, c: Const) -> u16 {
        self.consts.push(c);
        (self.consts.len() - 1) as u16
    }

    /// Interns a name, returning its index. Reuses an existing entry.
    pub fn add_name(&mut self, name: &str) -> u16 {
        Self::intern(&mut self.names, name)
    }

    /// Interns a fast-local slot name, returning its slot.
    pub fn add_varname(&mut self, name: &str) -> u8 {
        Self::intern(&mut self.varnames, name) as u8
    }

    /// Interns a cell variable defined by this unit, returning its cell slot.
    /// Cell slots number cellvars first, then freevars.
    pub fn add_cellvar(&mut self, name: &str) -> u8 {
        Self::intern(&mut self.cellvars, name) as u8
    }

    /// Interns a captured variable, returning its cell slot (offset past the
    /// cellvars).
    pub fn add_freevar(&mut self, name: &str) -> u8 {
        let idx = Self::intern(&mut self.freevars, name);
        (self.cellvars.len() + idx as usize) as u8
    }

    fn intern(pool: &mut Vec<Arc<str>>, name: &str) -> u16 {
        if let Some(i) = pool.iter().position(|n| n.as_ref() == name) {
            return i as u16;
        }
        pool.push(name.into());
        (pool.len() - 1) as u16
    }

    /// Records the source line for instructions emitted from here on.
    pub fn mark_line(&mut self, line: u32) -> &mut Self {
        let offset = self.bytecode.len() as u32;
        if self.lines.last().map(|&(o, _)| o) == Some(offset) {
            self.lines.pop();
        }
        self.lines.push((offset, line));
        self
    }

    /// Current bytecode offset.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.bytecode.len() as u32
    }

    /// Creates an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.bytecode.len());
    }

    /// Emits an operand-less instruction.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        debug_assert_eq!(op.operand_width(), 0);
        self.bytecode.push(op as u8);
        self
    }

    /// Emits an instruction with a one-byte operand.
    pub fn op_u8(&mut self, op: Opcode, operand: u8) -> &mut Self {
        debug_assert_eq!(op.operand_width(), 1);
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        self
    }

    /// Emits an instruction with a one-byte signed operand (`LoadSmallInt`).
    pub fn op_i8(&mut self, op: Opcode, operand: i8) -> &mut Self {
        self.op_u8(op, operand as u8)
    }

    /// Emits an instruction with a two-byte operand.
    pub fn op_u16(&mut self, op: Opcode, operand: u16) -> &mut Self {
        debug_assert_eq!(op.operand_width(), 2);
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        self
    }

    /// Emits `MakeClosure` with its compound operand.
    pub fn make_closure(&mut self, const_idx: u16, cell_count: u8) -> &mut Self {
        self.bytecode.push(Opcode::MakeClosure as u8);
        self.bytecode.extend_from_slice(&const_idx.to_le_bytes());
        self.bytecode.push(cell_count);
        self
    }

    /// Emits a relative-jump instruction targeting `label`.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        debug_assert!(matches!(
            op,
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::ForIter
        ));
        self.bytecode.push(op as u8);
        self.patches.push(Patch {
            site: self.bytecode.len(),
            label,
            kind: PatchKind::Relative,
        });
        self.bytecode.extend_from_slice(&[0, 0]);
        self
    }

    /// Emits a block-setup or `Continue` instruction with an absolute target.
    pub fn setup(&mut self, op: Opcode, label: Label) -> &mut Self {
        debug_assert!(matches!(
            op,
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally | Opcode::SetupContext | Opcode::Continue
        ));
        self.bytecode.push(op as u8);
        self.patches.push(Patch {
            site: self.bytecode.len(),
            label,
            kind: PatchKind::Absolute,
        });
        self.bytecode.extend_from_slice(&[0, 0]);
        self
    }

    /// Resolves labels, runs the depth analysis and registers the unit.
    ///
    /// # Errors
    ///
    /// Returns a [`CodeError`] when a jump is out of range, the byte stream is
    /// malformed, or two control-flow paths disagree on the stack depth at a
    /// join point.
    pub fn finish(mut self, registry: &mut CodeRegistry) -> Result<Arc<Code>, CodeError> {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].expect("unbound label at finish");
            let bytes = match patch.kind {
                PatchKind::Relative => {
                    let rel = target as i64 - (patch.site as i64 + 2);
                    i16::try_from(rel)
                        .map_err(|_| CodeError::InvalidJump {
                            offset: patch.site as u32 - 1,
                            target: target as i64,
                        })?
                        .to_le_bytes()
                }
                PatchKind::Absolute => u16::try_from(target)
                    .map_err(|_| CodeError::InvalidJump {
                        offset: patch.site as u32 - 1,
                        target: target as i64,
                    })?
                    .to_le_bytes(),
            };
            self.bytecode[patch.site..patch.site + 2].copy_from_slice(&bytes);
        }

        let (depths, max_stack) = analyze(&self.bytecode)?;
        let code = Arc::new(Code {
            id: registry.next_id(),
            name: self.name,
            bytecode: self.bytecode,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            arg_count: self.arg_count,
            flags: self.flags,
            max_stack,
            depths,
            lines: self.lines,
        });
        registry.units.push(Arc::clone(&code));
        Ok(code)
    }
}

// ============================================================================
// Stack depth analysis
// ============================================================================

fn read_u8(bytecode: &[u8], offset: usize) -> Result<u8, CodeError> {
    bytecode
        .get(offset)
        .copied()
        .ok_or(CodeError::TruncatedOperand { offset: offset as u32 - 1 })
}

fn read_u16(bytecode: &[u8], offset: usize) -> Result<u16, CodeError> {
    match bytecode.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(CodeError::TruncatedOperand { offset: offset as u32 - 1 }),
    }
}

fn read_i16(bytecode: &[u8], offset: usize) -> Result<i16, CodeError> {
    read_u16(bytecode, offset).map(|v| v as i16)
}

/// Worklist dataflow over the control-flow graph. Every reachable instruction
/// start gets the single operand-stack depth all paths agree on; disagreement
/// or simulated underflow is a malformed-unit error.
fn analyze(bytecode: &[u8]) -> Result<(Vec<u16>, u16), CodeError> {
    let mut depths = vec![UNREACHABLE; bytecode.len()];
    let mut max_stack: u16 = 0;
    if bytecode.is_empty() {
        return Ok((depths, 0));
    }

    let mut work: Vec<(usize, u16)> = vec![(0, 0)];
    while let Some((offset, depth)) = work.pop() {
        if offset >= bytecode.len() {
            continue;
        }
        match depths[offset] {
            UNREACHABLE => depths[offset] = depth,
            seen if seen == depth => continue,
            seen => {
                return Err(CodeError::DepthMismatch {
                    offset: offset as u32,
                    first: seen,
                    second: depth,
                })
            }
        }
        max_stack = max_stack.max(depth);

        let byte = bytecode[offset];
        let op = Opcode::from_repr(byte).ok_or(CodeError::InvalidOpcode {
            offset: offset as u32,
            byte,
        })?;
        let next = offset + 1 + op.operand_width();

        let apply = |depth: u16, effect: i32| -> Result<u16, CodeError> {
            let d = i32::from(depth) + effect;
            u16::try_from(d).map_err(|_| CodeError::DepthUnderflow { offset: offset as u32 })
        };
        let check_target = |target: i64| -> Result<usize, CodeError> {
            if target < 0 || target as usize >= bytecode.len() {
                return Err(CodeError::InvalidJump {
                    offset: offset as u32,
                    target,
                });
            }
            Ok(target as usize)
        };

        match op {
            Opcode::Jump => {
                let rel = read_i16(bytecode, offset + 1)?;
                work.push((check_target(next as i64 + i64::from(rel))?, depth));
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let rel = read_i16(bytecode, offset + 1)?;
                let after = apply(depth, -1)?;
                work.push((check_target(next as i64 + i64::from(rel))?, after));
                work.push((next, after));
            }
            Opcode::ForIter => {
                let rel = read_i16(bytecode, offset + 1)?;
                // Fallthrough keeps the iterator and pushes the element; the
                // exhaustion path pops the iterator.
                let exhausted = apply(depth, -1)?;
                work.push((check_target(next as i64 + i64::from(rel))?, exhausted));
                let produced = apply(depth, 1)?;
                max_stack = max_stack.max(produced);
                work.push((next, produced));
            }
            Opcode::SetupLoop => {
                let target = read_u16(bytecode, offset + 1)?;
                // Break delivers to the exit target with the stack trimmed
                // back to the setup depth.
                work.push((check_target(i64::from(target))?, depth));
                work.push((next, depth));
            }
            Opcode::SetupExcept | Opcode::SetupFinally | Opcode::SetupContext => {
                let target = read_u16(bytecode, offset + 1)?;
                // The handler is entered with one extra value: the caught
                // exception, or the parked pending-action sentinel.
                let handler = apply(depth, 1)?;
                max_stack = max_stack.max(handler);
                work.push((check_target(i64::from(target))?, handler));
                work.push((next, depth));
            }
            Opcode::Continue => {
                let _ = read_u16(bytecode, offset + 1)?;
                // Control reaches the loop head via the unwinder; the head's
                // depth is established by its other predecessors.
            }
            Opcode::ReturnValue | Opcode::Raise => {
                apply(depth, -1)?;
            }
            Opcode::Reraise | Opcode::Break => {}
            Opcode::RaiseNew => {
                let _ = read_u8(bytecode, offset + 1)?;
                apply(depth, -1)?;
            }
            Opcode::CallFunction => {
                let argc = read_u8(bytecode, offset + 1)?;
                // Pops the args and the callable, pushes the result.
                let after = apply(depth, -i32::from(argc))?;
                work.push((next, after));
            }
            Opcode::BuildList => {
                let count = read_u16(bytecode, offset + 1)?;
                let after = apply(depth, 1 - i32::from(count))?;
                max_stack = max_stack.max(after);
                work.push((next, after));
            }
            Opcode::MakeClosure => {
                let _ = read_u16(bytecode, offset + 1)?;
                let cells = read_u8(bytecode, offset + 3)?;
                let after = apply(depth, 1 - i32::from(cells))?;
                max_stack = max_stack.max(after);
                work.push((next, after));
            }
            _ => {
                let effect = op
                    .fixed_stack_effect()
                    .expect("variable-effect opcodes handled above");
                // Validate the operand is present even for effect-only ops.
                match op.operand_width() {
                    1 => {
                        read_u8(bytecode, offset + 1)?;
                    }
                    2 => {
                        read_u16(bytecode, offset + 1)?;
                    }
                    _ => {}
                }
                let after = apply(depth, effect)?;
                max_stack = max_stack.max(after);
                work.push((next, after));
            }
        }
    }

    Ok((depths, max_stack))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_depths() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("straight");
        b.op_i8(Opcode::LoadSmallInt, 1)
            .op_i8(Opcode::LoadSmallInt, 2)
            .op(Opcode::BinaryAdd)
            .op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        assert_eq!(code.declared_depth_at(0), Some(0));
        assert_eq!(code.declared_depth_at(2), Some(1));
        assert_eq!(code.declared_depth_at(4), Some(2));
        assert_eq!(code.declared_depth_at(5), Some(1));
        assert_eq!(code.max_stack(), 2);
        // Operand bytes carry no depth.
        assert_eq!(code.declared_depth_at(1), None);
    }

    #[test]
    fn join_point_depths_must_agree() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("branch");
        let else_ = b.new_label();
        let out = b.new_label();
        b.op(Opcode::LoadTrue);
        b.jump(Opcode::JumpIfFalse, else_);
        b.op_i8(Opcode::LoadSmallInt, 1);
        b.jump(Opcode::Jump, out);
        b.bind(else_);
        b.op_i8(Opcode::LoadSmallInt, 2);
        b.bind(out);
        b.op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        assert_eq!(code.max_stack(), 1);
    }

    #[test]
    fn inconsistent_join_is_rejected() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("bad");
        let merge = b.new_label();
        let skip = b.new_label();
        b.op(Opcode::LoadTrue);
        b.jump(Opcode::JumpIfFalse, skip);
        // One path pushes an extra value before the merge.
        b.op(Opcode::LoadNone);
        b.bind(skip);
        b.bind(merge);
        b.op(Opcode::LoadNone);
        b.op(Opcode::ReturnValue);
        let err = b.finish(&mut registry).unwrap_err();
        assert!(matches!(err, CodeError::DepthMismatch { .. }));
    }

    #[test]
    fn underflow_is_rejected() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("underflow");
        b.op(Opcode::Pop).op(Opcode::LoadNone).op(Opcode::ReturnValue);
        let err = b.finish(&mut registry).unwrap_err();
        assert!(matches!(err, CodeError::DepthUnderflow { offset: 0 }));
    }

    #[test]
    fn except_handler_enters_one_deeper() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("handler");
        let handler = b.new_label();
        let out = b.new_label();
        b.setup(Opcode::SetupExcept, handler);
        b.op(Opcode::PopBlock);
        b.jump(Opcode::Jump, out);
        b.bind(handler);
        // The caught exception sits on the stack here.
        b.op(Opcode::Pop);
        b.op(Opcode::PopExcept);
        b.bind(out);
        b.op(Opcode::LoadNone);
        b.op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        // setup is 3 bytes, PopBlock 1, Jump 3: handler binds at offset 7.
        assert_eq!(code.declared_depth_at(7), Some(1));
    }

    #[test]
    fn freevar_slots_are_offset_past_the_cellvars() {
        let mut b = CodeBuilder::new("closure");
        assert_eq!(b.add_cellvar("a"), 0);
        assert_eq!(b.add_cellvar("b"), 1);
        assert_eq!(b.add_freevar("outer"), 2);
        assert_eq!(b.add_freevar("other"), 3);
        // Re-interning returns the existing slot.
        assert_eq!(b.add_freevar("outer"), 2);
    }

    #[test]
    fn line_table_lookup() {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("lines");
        b.mark_line(10);
        b.op(Opcode::LoadNone);
        b.mark_line(11);
        b.op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        assert_eq!(code.line_for(0), 10);
        assert_eq!(code.line_for(1), 11);
    }

    #[test]
    fn registry_assigns_sequential_ids() {
        let mut registry = CodeRegistry::new();
        let mut a = CodeBuilder::new("a");
        a.op(Opcode::LoadNone).op(Opcode::ReturnValue);
        let a = a.finish(&mut registry).unwrap();
        let mut b = CodeBuilder::new("b");
        b.op(Opcode::LoadNone).op(Opcode::ReturnValue);
        let b = b.finish(&mut registry).unwrap();
        assert_eq!(a.id(), CodeId(0));
        assert_eq!(b.id(), CodeId(1));
        assert_eq!(registry.get(CodeId(1)).unwrap().name(), "b");
    }
}

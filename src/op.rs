//! Opcode definitions for the execution core.
//!
//! Bytecode is stored as raw `Vec<u8>` for cache efficiency. The `Opcode` enum is a pure
//! discriminant with no data - operands are fetched separately from the byte stream.
//!
//! # Operand Encoding
//!
//! - No suffix, 0 bytes: `BinaryAdd`, `Pop`, `LoadNone`
//! - 1 byte (u8/i8): `LoadFast`, `StoreFast`, `LoadSmallInt`, `CallFunction`
//! - 2 bytes (u16, little-endian): `LoadConst`, `LoadName`, `SetupExcept` (absolute target)
//! - 2 bytes (i16, little-endian): `Jump`, `JumpIfFalse`, `ForIter` (relative offset)
//! - Compound: `MakeClosure` (u16 const + u8 cell count)

use strum::FromRepr;

/// Opcode discriminant - just identifies the instruction type.
///
/// Operands (if any) follow in the bytecode stream and are fetched separately.
/// With `#[repr(u8)]`, each opcode is exactly 1 byte. Uses `strum::FromRepr` for
/// efficient byte-to-opcode conversion (bounds check + transmute).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum Opcode {
    // === Stack Operations (no operand) ===
    /// No operation.
    Nop,
    /// Discard top of stack.
    Pop,
    /// Duplicate top of stack.
    Dup,
    /// Swap top two: [a, b] -> [b, a].
    Rot2,
    /// Rotate top three: [a, b, c] -> [c, a, b].
    Rot3,

    // === Constants & Literals ===
    /// Push constant from pool. Operand: u16 const index.
    LoadConst,
    /// Push None.
    LoadNone,
    /// Push True.
    LoadTrue,
    /// Push False.
    LoadFalse,
    /// Push small integer (-128 to 127). Operand: i8.
    LoadSmallInt,

    // === Fast Locals ===
    /// Push fast-local slot. Operand: u8 slot.
    LoadFast,
    /// Pop and store to fast-local slot. Operand: u8 slot.
    StoreFast,
    /// Unbind a fast-local slot. Operand: u8 slot.
    DeleteFast,

    // === Named Variables ===
    /// Push from globals (then builtins). Operand: u16 name index.
    LoadGlobal,
    /// Pop and store into globals. Operand: u16 name index.
    StoreGlobal,
    /// Push via locals-mapping -> globals -> builtins lookup. Operand: u16 name index.
    LoadName,
    /// Pop and store into the locals mapping (globals if absent). Operand: u16 name index.
    StoreName,
    /// Delete from the locals mapping. Operand: u16 name index.
    DeleteName,

    // === Cells (closures) ===
    /// Push the value held by a cell. Operand: u8 cell slot.
    LoadCell,
    /// Pop and store into a cell. Operand: u8 cell slot.
    StoreCell,
    /// Push the cell object itself (for closure construction). Operand: u8 cell slot.
    LoadClosure,

    // === Binary Operations (no operand) ===
    /// Add: a + b.
    BinaryAdd,
    /// Subtract: a - b.
    BinarySub,
    /// Multiply: a * b.
    BinaryMul,
    /// True divide: a / b.
    BinaryDiv,
    /// Floor divide: a // b.
    BinaryFloorDiv,
    /// Modulo: a % b.
    BinaryMod,

    // === Comparison Operations (no operand) ===
    /// Equal: a == b.
    CompareEq,
    /// Not equal: a != b.
    CompareNe,
    /// Less than: a < b.
    CompareLt,
    /// Less than or equal: a <= b.
    CompareLe,
    /// Greater than: a > b.
    CompareGt,
    /// Greater than or equal: a >= b.
    CompareGe,

    // === Unary Operations (no operand) ===
    /// Boolean not.
    UnaryNot,
    /// Arithmetic negation.
    UnaryNeg,

    // === Control Flow ===
    /// Unconditional relative jump. Operand: i16 offset. A negative offset is a
    /// loop back edge and emits a trace anchor.
    Jump,
    /// Pop condition, jump if truthy. Operand: i16 offset.
    JumpIfTrue,
    /// Pop condition, jump if falsy. Operand: i16 offset.
    JumpIfFalse,

    // === Iteration ===
    /// Pop a value, push an iterator over it.
    GetIter,
    /// Advance the iterator at TOS; push the next value, or pop the iterator and
    /// jump when exhausted. Operand: i16 offset.
    ForIter,

    // === Block Stack ===
    /// Push a LOOP block. Operand: u16 absolute exit target.
    SetupLoop,
    /// Push an EXCEPT_HANDLER block. Operand: u16 absolute handler target.
    SetupExcept,
    /// Push a FINALLY block. Operand: u16 absolute handler target.
    SetupFinally,
    /// Push a CONTEXT_EXIT block. Operand: u16 absolute exit-handler target.
    SetupContext,
    /// Pop the innermost block (normal block exit).
    PopBlock,
    /// Pop the pending-action sentinel pushed when entering a FINALLY handler and
    /// re-deliver the deferred control transfer (None means fall through).
    EndFinally,
    /// Break out of the innermost LOOP block, running intervening FINALLY blocks.
    Break,
    /// Jump to the loop head of the innermost LOOP block, running intervening
    /// FINALLY blocks. Operand: u16 absolute loop-head target.
    Continue,

    // === Exceptions ===
    /// Pop a payload value and raise a new exception. Operand: u8 exception kind.
    RaiseNew,
    /// Pop an exception value and (re-)raise it.
    Raise,
    /// Re-raise the frame's last caught exception.
    Reraise,
    /// Clear the frame's last caught exception (leaving an except handler).
    PopExcept,
    /// Peek the exception at TOS, push whether it matches a kind. Operand: u8 kind.
    ExcMatch,
    /// Peek the exception at TOS, push its payload.
    ExcPayload,

    // === Functions ===
    /// Push a function built from a code constant. Operand: u16 const index.
    MakeFunction,
    /// Push a closure: pops N cell objects. Operands: u16 const index, u8 cell count.
    MakeClosure,
    /// Call: pops N args then the callable. Operand: u8 arg count.
    CallFunction,
    /// Pop a value and return it from the current frame.
    ReturnValue,
    /// Pop a value and suspend the generator frame, yielding it.
    YieldValue,

    // === Collections ===
    /// Pop N values and push a list of them. Operand: u16 count.
    BuildList,
}

impl Opcode {
    /// Total operand width in bytes following the opcode byte.
    #[must_use]
    pub fn operand_width(self) -> usize {
        match self {
            Self::LoadSmallInt
            | Self::LoadFast
            | Self::StoreFast
            | Self::DeleteFast
            | Self::LoadCell
            | Self::StoreCell
            | Self::LoadClosure
            | Self::CallFunction
            | Self::RaiseNew
            | Self::ExcMatch => 1,
            Self::LoadConst
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::Jump
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::ForIter
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupContext
            | Self::Continue
            | Self::MakeFunction
            | Self::BuildList => 2,
            Self::MakeClosure => 3,
            _ => 0,
        }
    }

    /// Static operand-stack effect for instructions whose effect does not depend
    /// on an operand. Variable-effect instructions (`CallFunction`, `BuildList`,
    /// `MakeClosure`) are handled by the depth analysis in `code`.
    #[must_use]
    pub fn fixed_stack_effect(self) -> Option<i32> {
        let effect = match self {
            Self::Nop
            | Self::Rot2
            | Self::Rot3
            | Self::DeleteFast
            | Self::DeleteName
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupContext
            | Self::PopBlock
            | Self::PopExcept
            | Self::GetIter
            | Self::UnaryNot
            | Self::UnaryNeg
            | Self::Jump
            | Self::Reraise
            | Self::Break
            | Self::Continue
            // Pops the yielded value; a sent value is pushed on resume.
            | Self::YieldValue => 0,
            Self::Pop
            | Self::StoreFast
            | Self::StoreGlobal
            | Self::StoreName
            | Self::StoreCell
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::ReturnValue
            | Self::Raise
            | Self::EndFinally => -1,
            Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryDiv
            | Self::BinaryFloorDiv
            | Self::BinaryMod
            | Self::CompareEq
            | Self::CompareNe
            | Self::CompareLt
            | Self::CompareLe
            | Self::CompareGt
            | Self::CompareGe => -1,
            Self::RaiseNew => -1,
            Self::Dup
            | Self::LoadConst
            | Self::LoadNone
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadSmallInt
            | Self::LoadFast
            | Self::LoadGlobal
            | Self::LoadName
            | Self::LoadCell
            | Self::LoadClosure
            | Self::ExcMatch
            | Self::ExcPayload
            | Self::MakeFunction => 1,
            // ForIter pushes on fallthrough, pops the iterator on the jump path;
            // both paths are modelled explicitly by the analyzer.
            Self::ForIter => return None,
            Self::CallFunction | Self::BuildList | Self::MakeClosure => return None,
        };
        Some(effect)
    }
}

/// Error for conversion from an invalid byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl std::fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode byte: {}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        // Verify that all opcodes from 0 to BuildList (last opcode) convert to u8 and back
        for byte in 0..=Opcode::BuildList as u8 {
            let opcode = Opcode::try_from(byte).unwrap();
            assert_eq!(opcode as u8, byte, "opcode {opcode:?} has wrong discriminant");
        }
    }

    #[test]
    fn test_invalid_opcode() {
        let result = Opcode::try_from(Opcode::BuildList as u8 + 1);
        assert!(result.is_err());
        let result = Opcode::try_from(255u8);
        assert!(result.is_err());
    }

    #[test]
    fn test_opcode_size() {
        assert_eq!(std::mem::size_of::<Opcode>(), 1);
    }
}

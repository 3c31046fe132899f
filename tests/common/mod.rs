//! Shared fixtures: hand-assembled compiled units used across test files.

use std::rc::Rc;
use std::sync::Arc;

use grail::{Code, CodeBuilder, CodeRegistry, FunctionObj, Machine, Opcode, Value};

/// Wraps a registered unit in a function value bound to the machine's root
/// namespaces.
pub fn function_value(machine: &Machine, code: &Arc<Code>) -> Value {
    Value::Function(Rc::new(FunctionObj {
        name: code.name().into(),
        code: Arc::clone(code),
        globals: Rc::clone(machine.globals()),
        builtins: Rc::clone(machine.builtins()),
        closure: Vec::new(),
    }))
}

/// `count_to(n)`: a generator yielding 1 through n, then returning None.
pub fn count_to(registry: &mut CodeRegistry) -> Arc<Code> {
    let mut b = CodeBuilder::new("count_to");
    b.arg_count(1);
    b.generator();
    let n = b.add_varname("n");
    let i = b.add_varname("i");
    let head = b.new_label();
    let end = b.new_label();
    b.op_i8(Opcode::LoadSmallInt, 1);
    b.op_u8(Opcode::StoreFast, i);
    b.bind(head);
    b.op_u8(Opcode::LoadFast, i);
    b.op_u8(Opcode::LoadFast, n);
    b.op(Opcode::CompareLe);
    b.jump(Opcode::JumpIfFalse, end);
    b.op_u8(Opcode::LoadFast, i);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op_u8(Opcode::LoadFast, i);
    b.op_i8(Opcode::LoadSmallInt, 1);
    b.op(Opcode::BinaryAdd);
    b.op_u8(Opcode::StoreFast, i);
    b.jump(Opcode::Jump, head);
    b.bind(end);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    b.finish(registry).expect("count_to assembles")
}

//! Generator lifecycle: resume, send, close, throw, nested iteration.

mod common;

use grail::{
    CodeBuilder, Const, ExcKind, ExceptionState, GenState, GeneratorStateError, Machine, Opcode, Value, VmError,
};

use common::{count_to, function_value};

#[test]
fn generator_yields_then_completes() {
    let mut machine = Machine::new();
    let code = count_to(machine.registry_mut());
    let func = function_value(&machine, &code);
    let gen_value = machine.call(&func, vec![Value::Int(3)]).unwrap();
    let Value::Generator(gen) = gen_value else {
        panic!("calling a generator unit must produce a generator");
    };
    assert_eq!(gen.borrow().state(), GenState::Created);

    for expected in 1..=3 {
        assert_eq!(machine.resume(&gen, Value::None).unwrap(), Value::Int(expected));
    }
    // The completing resume raises the exhausted sentinel; the body's return
    // value stays readable on the generator.
    assert!(matches!(
        machine.resume(&gen, Value::None),
        Err(VmError::Generator(GeneratorStateError::Exhausted))
    ));
    assert_eq!(gen.borrow().state(), GenState::Completed);
    assert_eq!(gen.borrow().return_value(), Some(&Value::None));
    assert!(matches!(
        machine.resume(&gen, Value::None),
        Err(VmError::Generator(GeneratorStateError::Exhausted))
    ));
}

#[test]
fn sent_value_lands_at_the_waiting_yield() {
    let mut machine = Machine::new();
    // echo: x = yield None; yield x
    let mut b = CodeBuilder::new("echo");
    b.generator();
    let x = b.add_varname("x");
    b.op(Opcode::LoadNone);
    b.op(Opcode::YieldValue);
    b.op_u8(Opcode::StoreFast, x);
    b.op_u8(Opcode::LoadFast, x);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![]).unwrap() else {
        panic!("expected a generator");
    };

    assert_eq!(machine.resume(&gen, Value::None).unwrap(), Value::None);
    assert_eq!(machine.resume(&gen, Value::Int(42)).unwrap(), Value::Int(42));
}

#[test]
fn sending_into_a_fresh_generator_is_rejected() {
    let mut machine = Machine::new();
    let code = count_to(machine.registry_mut());
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![Value::Int(1)]).unwrap() else {
        panic!("expected a generator");
    };
    assert!(matches!(
        machine.resume(&gen, Value::Int(5)),
        Err(VmError::Generator(GeneratorStateError::SendToFresh))
    ));
    // The failed send must not consume the first resume.
    assert_eq!(machine.resume(&gen, Value::None).unwrap(), Value::Int(1));
}

#[test]
fn close_before_first_resume() {
    let mut machine = Machine::new();
    let code = count_to(machine.registry_mut());
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![Value::Int(3)]).unwrap() else {
        panic!("expected a generator");
    };
    machine.close_generator(&gen).unwrap();
    assert_eq!(gen.borrow().state(), GenState::Closed);
    assert!(matches!(
        machine.resume(&gen, Value::None),
        Err(VmError::Generator(GeneratorStateError::Exhausted))
    ));
}

#[test]
fn close_signal_unwinds_an_unguarded_yield() {
    let mut machine = Machine::new();
    let code = count_to(machine.registry_mut());
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![Value::Int(3)]).unwrap() else {
        panic!("expected a generator");
    };
    machine.resume(&gen, Value::None).unwrap();
    machine.close_generator(&gen).unwrap();
    assert_eq!(gen.borrow().state(), GenState::Closed);
    // Closing an already finished generator is a no-op.
    machine.close_generator(&gen).unwrap();
}

/// A generator that yields once under a handler for the given kind, returning
/// 9 when the handler fires.
fn guarded_yield(machine: &mut Machine, kind: ExcKind) -> std::sync::Arc<grail::Code> {
    let mut b = CodeBuilder::new("guarded_yield");
    b.generator();
    let handler = b.new_label();
    let no_match = b.new_label();
    b.setup(Opcode::SetupExcept, handler);
    b.op_i8(Opcode::LoadSmallInt, 1);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op(Opcode::PopBlock);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    b.bind(handler);
    b.op_u8(Opcode::ExcMatch, kind as u8);
    b.jump(Opcode::JumpIfFalse, no_match);
    b.op(Opcode::Pop);
    b.op(Opcode::PopExcept);
    b.op_i8(Opcode::LoadSmallInt, 9);
    b.op(Opcode::ReturnValue);
    b.bind(no_match);
    b.op(Opcode::Pop);
    b.op(Opcode::Reraise);
    b.finish(machine.registry_mut()).unwrap()
}

#[test]
fn close_honored_by_a_catching_handler() {
    let mut machine = Machine::new();
    let code = guarded_yield(&mut machine, ExcKind::GeneratorExit);
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![]).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(machine.resume(&gen, Value::None).unwrap(), Value::Int(1));
    // The body catches GeneratorExit and returns: still an orderly close.
    machine.close_generator(&gen).unwrap();
    assert!(matches!(
        machine.resume(&gen, Value::None),
        Err(VmError::Generator(GeneratorStateError::Exhausted))
    ));
}

#[test]
fn close_rejected_when_the_body_keeps_yielding() {
    let mut machine = Machine::new();
    // Catches the close signal and yields again instead of finishing.
    let mut b = CodeBuilder::new("defiant");
    b.generator();
    let handler = b.new_label();
    b.setup(Opcode::SetupExcept, handler);
    b.op_i8(Opcode::LoadSmallInt, 1);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op(Opcode::PopBlock);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    b.bind(handler);
    b.op(Opcode::Pop);
    b.op(Opcode::PopExcept);
    b.op_i8(Opcode::LoadSmallInt, 5);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![]).unwrap() else {
        panic!("expected a generator");
    };
    machine.resume(&gen, Value::None).unwrap();
    assert!(matches!(
        machine.close_generator(&gen),
        Err(VmError::Generator(GeneratorStateError::CloseIgnored))
    ));
}

#[test]
fn throw_into_a_catching_generator() {
    let mut machine = Machine::new();
    let code = guarded_yield(&mut machine, ExcKind::ValueError);
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![]).unwrap() else {
        panic!("expected a generator");
    };
    machine.resume(&gen, Value::None).unwrap();
    // The handler turns the thrown exception into a return, which surfaces
    // as exhaustion with the return value retained.
    assert!(matches!(
        machine.throw_into(&gen, ExceptionState::msg(ExcKind::ValueError, "stop")),
        Err(VmError::Generator(GeneratorStateError::Exhausted))
    ));
    assert_eq!(gen.borrow().state(), GenState::Completed);
    assert_eq!(gen.borrow().return_value(), Some(&Value::Int(9)));
}

#[test]
fn throw_into_without_a_handler_propagates() {
    let mut machine = Machine::new();
    let code = count_to(machine.registry_mut());
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![Value::Int(3)]).unwrap() else {
        panic!("expected a generator");
    };
    machine.resume(&gen, Value::None).unwrap();
    match machine.throw_into(&gen, ExceptionState::msg(ExcKind::TypeError, "boom")) {
        Err(VmError::Uncaught(exc)) => {
            assert_eq!(exc.kind, ExcKind::TypeError);
            // The unwound generator frame must appear in the traceback.
            let nodes = exc.traceback.nodes();
            assert!(!nodes.is_empty());
            assert_eq!(nodes[0].code, code.id());
        }
        other => panic!("expected the thrown exception back, got {other:?}"),
    }
    assert_eq!(gen.borrow().state(), GenState::Completed);
}

#[test]
fn throw_into_a_fresh_generator_starts_it_to_receive_the_exception() {
    let mut machine = Machine::new();
    let code = guarded_yield(&mut machine, ExcKind::ValueError);
    let func = function_value(&machine, &code);
    let Value::Generator(gen) = machine.call(&func, vec![]).unwrap() else {
        panic!("expected a generator");
    };
    assert_eq!(gen.borrow().state(), GenState::Created);
    // The body never reached its yield, so the handler setup never ran and
    // the exception propagates from the top of the body.
    match machine.throw_into(&gen, ExceptionState::msg(ExcKind::ValueError, "early")) {
        Err(VmError::Uncaught(exc)) => {
            assert_eq!(exc.kind, ExcKind::ValueError);
            let nodes = exc.traceback.nodes();
            assert!(!nodes.is_empty());
            assert_eq!(nodes[0].code, code.id());
            assert_eq!(nodes[0].offset, 0);
        }
        other => panic!("expected the thrown exception back, got {other:?}"),
    }
    assert_eq!(gen.borrow().state(), GenState::Completed);
}

#[test]
fn for_loop_drives_a_generator() {
    let mut machine = Machine::new();
    let gen_code = count_to(machine.registry_mut());

    let mut m = CodeBuilder::new("main");
    let ct_idx = m.add_const(Const::Code(gen_code));
    let ct = m.add_name("count_to");
    let acc = m.add_name("acc");
    let i = m.add_name("i");
    let head = m.new_label();
    let done = m.new_label();
    let exit = m.new_label();
    m.op_u16(Opcode::MakeFunction, ct_idx);
    m.op_u16(Opcode::StoreGlobal, ct);
    m.op_i8(Opcode::LoadSmallInt, 0);
    m.op_u16(Opcode::StoreGlobal, acc);
    m.setup(Opcode::SetupLoop, exit);
    m.op_u16(Opcode::LoadGlobal, ct);
    m.op_i8(Opcode::LoadSmallInt, 3);
    m.op_u8(Opcode::CallFunction, 1);
    m.op(Opcode::GetIter);
    m.bind(head);
    m.jump(Opcode::ForIter, done);
    m.op_u16(Opcode::StoreGlobal, i);
    m.op_u16(Opcode::LoadGlobal, acc);
    m.op_u16(Opcode::LoadGlobal, i);
    m.op(Opcode::BinaryAdd);
    m.op_u16(Opcode::StoreGlobal, acc);
    m.jump(Opcode::Jump, head);
    m.bind(done);
    m.op(Opcode::PopBlock);
    m.bind(exit);
    m.op_u16(Opcode::LoadGlobal, acc);
    m.op(Opcode::ReturnValue);
    let main = m.finish(machine.registry_mut()).unwrap();

    assert_eq!(machine.run_module(&main).unwrap(), Value::Int(6));
}

#[test]
fn interpreted_next_sees_stop_iteration() {
    let mut machine = Machine::new();
    let gen_code = count_to(machine.registry_mut());

    // g = count_to(0): the first next() exhausts it immediately.
    let mut m = CodeBuilder::new("main");
    let ct_idx = m.add_const(Const::Code(gen_code));
    let ct = m.add_name("count_to");
    let g = m.add_name("g");
    let next = m.add_name("next");
    let handler = m.new_label();
    let no_match = m.new_label();
    m.op_u16(Opcode::MakeFunction, ct_idx);
    m.op_u16(Opcode::StoreGlobal, ct);
    m.op_u16(Opcode::LoadGlobal, ct);
    m.op_i8(Opcode::LoadSmallInt, 0);
    m.op_u8(Opcode::CallFunction, 1);
    m.op_u16(Opcode::StoreGlobal, g);
    m.setup(Opcode::SetupExcept, handler);
    m.op_u16(Opcode::LoadGlobal, next);
    m.op_u16(Opcode::LoadGlobal, g);
    m.op_u8(Opcode::CallFunction, 1);
    m.op(Opcode::Pop);
    m.op(Opcode::PopBlock);
    m.op_i8(Opcode::LoadSmallInt, 0);
    m.op(Opcode::ReturnValue);
    m.bind(handler);
    m.op_u8(Opcode::ExcMatch, ExcKind::StopIteration as u8);
    m.jump(Opcode::JumpIfFalse, no_match);
    m.op(Opcode::Pop);
    m.op(Opcode::PopExcept);
    m.op_i8(Opcode::LoadSmallInt, 1);
    m.op(Opcode::ReturnValue);
    m.bind(no_match);
    m.op(Opcode::Pop);
    m.op(Opcode::Reraise);
    let main = m.finish(machine.registry_mut()).unwrap();

    assert_eq!(machine.run_module(&main).unwrap(), Value::Int(1));
}

#[test]
fn reentrant_resume_is_a_catchable_condition() {
    let mut machine = Machine::new();
    // The body resumes itself through the global binding.
    let mut b = CodeBuilder::new("loopy");
    b.generator();
    let next = b.add_name("next");
    let g = b.add_name("g");
    b.op_u16(Opcode::LoadGlobal, next);
    b.op_u16(Opcode::LoadGlobal, g);
    b.op_u8(Opcode::CallFunction, 1);
    b.op(Opcode::YieldValue);
    b.op(Opcode::Pop);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();
    let func = function_value(&machine, &code);
    let gen_value = machine.call(&func, vec![]).unwrap();
    let Value::Generator(gen) = gen_value.clone() else {
        panic!("expected a generator");
    };
    machine.globals().borrow_mut().set("g", gen_value);

    match machine.resume(&gen, Value::None) {
        Err(VmError::Uncaught(exc)) => {
            assert_eq!(exc.kind, ExcKind::ValueError);
            assert_eq!(exc.payload, Value::str("generator already executing"));
        }
        other => panic!("expected uncaught ValueError, got {other:?}"),
    }
}

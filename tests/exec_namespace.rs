//! Dynamic snippet execution under caller-supplied namespaces.

mod common;

use grail::{CodeBuilder, Const, ExcKind, Machine, Namespace, Opcode, Value, VmError};

/// Assembles `a = 3` as a dynamic-namespace snippet.
fn assign_snippet(machine: &mut Machine) -> std::sync::Arc<grail::Code> {
    let mut b = CodeBuilder::new("<exec>");
    b.dynamic_namespace();
    let a = b.add_name("a");
    b.op_i8(Opcode::LoadSmallInt, 3);
    b.op_u16(Opcode::StoreName, a);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    b.finish(machine.registry_mut()).unwrap()
}

#[test]
fn supplied_globals_receive_stores_and_builtins() {
    let mut machine = Machine::new();
    let code = assign_snippet(&mut machine);
    let ns = Namespace::new().into_ref();
    machine
        .exec_dynamic(&code, Some(Value::Namespace(ns.clone())), None)
        .unwrap();
    assert_eq!(ns.borrow().get("a"), Some(Value::Int(3)));
    // The builtins escape hatch is injected into an explicit globals dict.
    assert!(ns.borrow().contains("__builtins__"));
    // The machine's own globals are untouched.
    assert!(!machine.globals().borrow().contains("a"));
}

#[test]
fn default_exec_shares_machine_globals() {
    let mut machine = Machine::new();
    let code = assign_snippet(&mut machine);
    machine.exec_dynamic(&code, None, None).unwrap();
    assert_eq!(machine.globals().borrow().get("a"), Some(Value::Int(3)));
    assert!(!machine.globals().borrow().contains("__builtins__"));
}

#[test]
fn separate_locals_receive_stores() {
    let mut machine = Machine::new();
    let code = assign_snippet(&mut machine);
    let globals = Namespace::new().into_ref();
    let locals = Namespace::new().into_ref();
    machine
        .exec_dynamic(
            &code,
            Some(Value::Namespace(globals.clone())),
            Some(Value::Namespace(locals.clone())),
        )
        .unwrap();
    assert_eq!(locals.borrow().get("a"), Some(Value::Int(3)));
    assert!(!globals.borrow().contains("a"));
}

#[test]
fn name_lookup_falls_back_to_globals_then_builtins() {
    let mut machine = Machine::new();
    // b is only in globals, next only in builtins, a shadows globals locally.
    let mut b = CodeBuilder::new("<exec>");
    b.dynamic_namespace();
    let a = b.add_name("a");
    let bn = b.add_name("b");
    let next = b.add_name("next");
    b.op_u16(Opcode::LoadName, next);
    b.op(Opcode::Pop);
    b.op_u16(Opcode::LoadName, a);
    b.op_u16(Opcode::LoadName, bn);
    b.op(Opcode::BinaryAdd);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();

    let mut globals = Namespace::new();
    globals.set("a", Value::Int(100));
    globals.set("b", Value::Int(2));
    let mut locals = Namespace::new();
    locals.set("a", Value::Int(1));
    let result = machine
        .exec_dynamic(
            &code,
            Some(Value::Namespace(globals.into_ref())),
            Some(Value::Namespace(locals.into_ref())),
        )
        .unwrap();
    assert_eq!(result, Value::Int(3));
}

#[test]
fn non_namespace_argument_is_rejected_up_front() {
    let mut machine = Machine::new();
    let code = assign_snippet(&mut machine);
    match machine.exec_dynamic(&code, Some(Value::Int(1)), None) {
        Err(VmError::NamespaceType(err)) => assert_eq!(err.found, "int"),
        other => panic!("expected a namespace type error, got {other:?}"),
    }
}

#[test]
fn snippet_function_resolves_through_snippet_globals() {
    let mut machine = Machine::new();

    // helper(): return k, resolving k as a global.
    let mut helper = CodeBuilder::new("helper");
    let k = helper.add_name("k");
    helper.op_u16(Opcode::LoadGlobal, k);
    helper.op(Opcode::ReturnValue);
    let helper = helper.finish(machine.registry_mut()).unwrap();

    // Snippet: k = 5; h = helper; return h()
    let mut b = CodeBuilder::new("<exec>");
    b.dynamic_namespace();
    let helper_idx = b.add_const(Const::Code(helper));
    let k = b.add_name("k");
    let h = b.add_name("h");
    b.op_i8(Opcode::LoadSmallInt, 5);
    b.op_u16(Opcode::StoreName, k);
    b.op_u16(Opcode::MakeFunction, helper_idx);
    b.op_u16(Opcode::StoreName, h);
    b.op_u16(Opcode::LoadName, h);
    b.op_u8(Opcode::CallFunction, 0);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();

    let ns = Namespace::new().into_ref();
    let result = machine.exec_dynamic(&code, Some(Value::Namespace(ns)), None).unwrap();
    assert_eq!(result, Value::Int(5));
    // k lives in the snippet's dict, not the machine globals.
    assert!(!machine.globals().borrow().contains("k"));
}

#[test]
fn delete_name_unbinds_and_missing_names_raise() {
    let mut machine = Machine::new();
    let mut b = CodeBuilder::new("<exec>");
    b.dynamic_namespace();
    let a = b.add_name("a");
    b.op_i8(Opcode::LoadSmallInt, 1);
    b.op_u16(Opcode::StoreName, a);
    b.op_u16(Opcode::DeleteName, a);
    // Second delete: the name is gone.
    b.op_u16(Opcode::DeleteName, a);
    b.op(Opcode::LoadNone);
    b.op(Opcode::ReturnValue);
    let code = b.finish(machine.registry_mut()).unwrap();

    let ns = Namespace::new().into_ref();
    match machine.exec_dynamic(&code, Some(Value::Namespace(ns.clone())), None) {
        Err(VmError::Uncaught(exc)) => assert_eq!(exc.kind, ExcKind::NameError),
        other => panic!("expected uncaught NameError, got {other:?}"),
    }
    assert!(!ns.borrow().contains("a"));
}

#[test]
fn snippet_binding_shadows_an_identically_named_fast_local() {
    let mut machine = Machine::new();

    // A statically compiled function whose parameter x lives in a fast slot.
    let mut f = CodeBuilder::new("uses_fast_x");
    f.arg_count(1);
    let x_slot = f.add_varname("x");
    f.op_u8(Opcode::LoadFast, x_slot);
    f.op(Opcode::ReturnValue);
    let fast_code = f.finish(machine.registry_mut()).unwrap();

    // A function defined inside the snippet, reading x as a free name.
    let mut r = CodeBuilder::new("reads_x");
    let xr = r.add_name("x");
    r.op_u16(Opcode::LoadGlobal, xr);
    r.op(Opcode::ReturnValue);
    let reader = r.finish(machine.registry_mut()).unwrap();

    // Snippet: x = 3; f = reads_x; return f()
    let mut b = CodeBuilder::new("<exec>");
    b.dynamic_namespace();
    let reader_idx = b.add_const(Const::Code(reader));
    let xs = b.add_name("x");
    let fs = b.add_name("f");
    b.op_i8(Opcode::LoadSmallInt, 3);
    b.op_u16(Opcode::StoreName, xs);
    b.op_u16(Opcode::MakeFunction, reader_idx);
    b.op_u16(Opcode::StoreName, fs);
    b.op_u16(Opcode::LoadName, fs);
    b.op_u8(Opcode::CallFunction, 0);
    b.op(Opcode::ReturnValue);
    let snippet = b.finish(machine.registry_mut()).unwrap();

    let ns = Namespace::new().into_ref();
    let result = machine
        .exec_dynamic(&snippet, Some(Value::Namespace(ns.clone())), None)
        .unwrap();
    // The nested function sees the snippet's dict binding.
    assert_eq!(result, Value::Int(3));
    assert_eq!(ns.borrow().get("x"), Some(Value::Int(3)));

    // The identically named fast slot is separate storage: the compiled
    // function still reads its own parameter, and the snippet's binding
    // never leaked into the machine globals.
    let func = common::function_value(&machine, &fast_code);
    assert_eq!(machine.call(&func, vec![Value::Int(99)]).unwrap(), Value::Int(99));
    assert!(!machine.globals().borrow().contains("x"));
}

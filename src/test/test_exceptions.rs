// Exception machinery: throw, catch, finally ordering, cause chaining.

use super::*;
use crate::vm::OpCode;

#[test]
fn catch_lands_the_exception_in_its_slot() {
    let mut vm = new_vm();
    let boom = vm.new_string("boom");
    let code = vec![
        Instruction::asbx(OpCode::PushCatch, 2, 3), // handler at 4, slot r2
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::Throw, 0, false, 0, 0),
        Instruction::abc(OpCode::Ret, 0, false, 1, 0), // unreachable
        Instruction::abc(OpCode::Ret, 2, false, 2, 0), // handler: return caught
    ];
    let def = make_def(&mut vm, "catcher", 0, 4, vec![boom], code);
    let f = install(&mut vm, def);

    let r = vm.call_value(f, &[], 1).expect("exception was caught");
    let exc = r[0];
    assert!(exc.is_instance());
    // Non-instance throws arrive wrapped, with the payload in `value`.
    let v = vm.instance_field(exc, "value").unwrap();
    assert!(v.raw_equal(&boom));
    // Nothing is left in flight.
    assert!(vm.catch_exception().is_none());
}

#[test]
fn untouched_handlers_pop_cleanly() {
    let mut vm = new_vm();
    let code = vec![
        Instruction::asbx(OpCode::PushCatch, 2, 3),
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::PopHandler, 0, false, 0, 0),
        Instruction::abc(OpCode::Ret, 0, false, 2, 0),
        Instruction::abc(OpCode::Ret, 2, false, 2, 0), // handler, not taken
    ];
    let def = make_def(&mut vm, "no_throw", 0, 4, vec![Value::int(42)], code);
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 42);
}

#[test]
fn finally_throw_replaces_and_chains_the_cause() {
    let mut vm = new_vm();
    let a = vm.new_string("a");
    let b = vm.new_string("b");
    // try { throw "a" } finally { throw "b" }
    let code = vec![
        Instruction::asbx(OpCode::PushFinally, 0, 3), // handler at 4
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::Throw, 0, false, 0, 0),
        Instruction::abc(OpCode::Ret, 0, false, 1, 0), // unreachable
        Instruction::abx(OpCode::LoadK, 1, 1),         // finally:
        Instruction::abc(OpCode::Throw, 1, false, 0, 0),
        Instruction::abc(OpCode::EndFinally, 0, false, 0, 0),
    ];
    let def = make_def(&mut vm, "chained", 0, 4, vec![a, b], code);
    let f = install(&mut vm, def);

    assert!(vm.call_value(f, &[], 0).is_err());
    let exc = vm.catch_exception().expect("escaped exception");

    let outer = vm.instance_field(exc, "value").unwrap();
    assert!(outer.raw_equal(&b), "the finally's exception wins");

    let cause = vm.instance_field(exc, "cause").unwrap();
    assert!(cause.is_instance(), "prior exception is chained as cause");
    let inner = vm.instance_field(cause, "value").unwrap();
    assert!(inner.raw_equal(&a));
}

#[test]
fn finally_runs_on_the_normal_path_too() {
    let mut vm = new_vm();
    // The compiler emits the finally body inline on the normal path:
    // pop the handler, run the body, fall through to the return.
    let code = vec![
        Instruction::asbx(OpCode::PushFinally, 0, 4), // handler at 5
        Instruction::abx(OpCode::LoadK, 0, 0),        // r0 = 7
        Instruction::abc(OpCode::PopHandler, 0, false, 0, 0),
        Instruction::asbx(OpCode::Jmp, 0, 1),         // into the inline copy
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
        Instruction::abx(OpCode::LoadK, 1, 1),        // finally body: r1 = 9
        Instruction::abc(OpCode::EndFinally, 0, false, 0, 0),
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
    ];
    let def = make_def(
        &mut vm,
        "normal_finally",
        0,
        4,
        vec![Value::int(7), Value::int(9)],
        code,
    );
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 9);
}

#[test]
fn uncaught_exceptions_escape_to_the_host_with_location() {
    let mut vm = new_vm();
    let code = vec![
        Instruction::abc(OpCode::Div, 2, false, 0, 1),
        Instruction::abc(OpCode::Ret, 2, false, 2, 0),
    ];
    let def = make_def(&mut vm, "div0", 2, 4, vec![], code);
    let f = install(&mut vm, def);
    assert!(vm.call_value(f, &[Value::int(1), Value::int(0)], 1).is_err());

    let exc = vm.catch_exception().unwrap();
    let loc = vm.instance_field(exc, "location").unwrap();
    let aid = loc.as_array_id().expect("location is [name, line]");
    let arr = vm.pool().array(aid).unwrap();
    assert_eq!(arr.len(), 2);
    let fname = arr.get(0).unwrap().as_string_id().unwrap();
    assert_eq!(vm.pool().str_of(fname), "div0");
}

#[test]
fn exception_classes_form_the_documented_hierarchy() {
    let mut vm = new_vm();
    for name in [
        "Throwable",
        "Exception",
        "Error",
        "TypeError",
        "ValueError",
        "RangeError",
        "FieldError",
        "BoundsError",
        "ImportError",
        "IOError",
        "EOFError",
        "StateError",
        "SyntaxError",
        "LookupError",
        "NotImplementedError",
    ] {
        let v = vm.get_global(name).unwrap_or_else(|| panic!("missing {}", name));
        assert!(v.is_class(), "{} must be a class", name);
    }

    // TypeError < Error < Throwable
    let te = vm.get_global("TypeError").unwrap().as_class_id().unwrap();
    let err = vm.get_global("Error").unwrap().as_class_id().unwrap();
    let root = vm.get_global("Throwable").unwrap().as_class_id().unwrap();
    let parent = vm.pool().class(te).unwrap().parent.unwrap();
    assert_eq!(parent, err);
    let grandparent = vm.pool().class(err).unwrap().parent.unwrap();
    assert_eq!(grandparent, root);
}

#[test]
fn nested_catch_rethrow_keeps_unwinding() {
    let mut vm = new_vm();
    let boom = vm.new_string("boom");
    // Inner function throws; outer catches and rethrows the caught value.
    let inner_name = vm.new_string("inner_thrower");
    let inner = make_def(
        &mut vm,
        "inner_thrower",
        0,
        2,
        vec![boom],
        vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Throw, 0, false, 0, 0),
        ],
    );
    let inner_f = install(&mut vm, inner);
    vm.set_global("inner_thrower", inner_f);

    let code = vec![
        Instruction::asbx(OpCode::PushCatch, 2, 3), // handler at 4
        Instruction::abx(OpCode::GetGlobal, 0, 0),
        Instruction::abc(OpCode::Call, 0, false, 1, 1),
        Instruction::abc(OpCode::Ret, 0, false, 1, 0),
        Instruction::abc(OpCode::Throw, 2, false, 0, 0), // rethrow caught
    ];
    let def = make_def(&mut vm, "rethrower", 0, 4, vec![inner_name], code);
    let f = install(&mut vm, def);

    assert!(vm.call_value(f, &[], 0).is_err());
    let exc = vm.catch_exception().unwrap();
    let v = vm.instance_field(exc, "value").unwrap();
    assert!(v.raw_equal(&boom));
}

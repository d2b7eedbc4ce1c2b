// Embedding API: native functions, slots, pinning, hooks, classes,
// metamethods, parameter type masks.

use super::*;
use crate::value::{hook_bits, ThreadId, ValueKind};
use crate::vm::{ExecError, OpCode};

fn native_add(vm: &mut CrocVm, tid: ThreadId, nargs: usize) -> Result<usize, ExecError> {
    let mut sum = 0i64;
    for i in 0..nargs {
        sum += vm.arg(tid, i).as_int().unwrap_or(0);
    }
    vm.push(tid, Value::int(sum));
    Ok(1)
}

#[test]
fn native_functions_see_a_stack_window() {
    let mut vm = new_vm();
    let add = vm.new_native_function("add", 8, native_add);
    let r = vm
        .call_value(add, &[Value::int(1), Value::int(2), Value::int(39)], 1)
        .unwrap();
    assert_eq!(int1(&r), 42);
}

#[test]
fn script_can_call_registered_natives() {
    let mut vm = new_vm();
    let add = vm.new_native_function("add", 8, native_add);
    vm.set_global("add", add);

    let name = vm.new_string("add");
    let code = vec![
        Instruction::abx(OpCode::GetGlobal, 0, 0),
        Instruction::abx(OpCode::LoadK, 1, 1),
        Instruction::abx(OpCode::LoadK, 2, 2),
        Instruction::abc(OpCode::Call, 0, false, 3, 2),
        Instruction::abc(OpCode::Ret, 0, false, 2, 0),
    ];
    let def = make_def(
        &mut vm,
        "caller",
        0,
        4,
        vec![name, Value::int(20), Value::int(22)],
        code,
    );
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 42);
}

#[test]
fn parameter_type_masks_gate_calls() {
    let mut vm = new_vm();
    let code = vec![Instruction::abc(OpCode::Ret, 0, false, 2, 0)];
    let mut def = make_def(&mut vm, "int_only", 1, 2, vec![], code);
    def.param_masks = vec![ValueKind::Int.mask_bit()];
    let f = install(&mut vm, def);

    let r = vm.call_value(f, &[Value::int(5)], 1).unwrap();
    assert_eq!(int1(&r), 5);

    assert!(vm.call_value(f, &[Value::bool(true)], 1).is_err());
    let exc = vm.catch_exception().unwrap();
    let te = vm.get_global("TypeError").unwrap().as_class_id().unwrap();
    let iid = exc.as_instance_id().unwrap();
    assert_eq!(vm.pool().instance(iid).unwrap().class, te);
}

#[test]
fn pinning_protects_host_held_objects() {
    let mut vm = new_vm();
    let t = vm.new_table();
    vm.table_set(t, Value::int(1), Value::int(2)).unwrap();
    let pin = vm.pin(t);

    vm.collect_garbage().unwrap();

    let still = vm.pinned(pin).unwrap();
    assert!(still.is_identical(&t));
    assert_eq!(vm.table_get(still, Value::int(1)).unwrap(), Value::int(2));

    vm.unpin(pin);
    vm.collect_garbage().unwrap();
    assert!(vm.pool().table(t.as_table_id().unwrap()).is_none());
}

#[test]
fn slot_api_pushes_and_pops() {
    let mut vm = new_vm();
    let tid = vm.main_thread();
    vm.push(tid, Value::int(1));
    vm.push(tid, Value::int(2));
    assert_eq!(vm.top(tid), 2);
    assert_eq!(vm.get_slot(tid, 0), Value::int(1));
    assert_eq!(vm.pop(tid), Value::int(2));
    assert_eq!(vm.pop(tid), Value::int(1));
    assert_eq!(vm.top(tid), 0);
}

#[test]
fn instance_fields_and_methods_resolve_through_the_chain() {
    let mut vm = new_vm();

    // Base with a method and a field; Derived shadows the method.
    let base = vm.new_class("Base", None).unwrap();
    let base_id = base.as_class_id().unwrap();
    fn base_m(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        vm.push(tid, Value::int(1));
        Ok(1)
    }
    fn derived_m(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        vm.push(tid, Value::int(2));
        Ok(1)
    }
    let bm = vm.new_native_function("Base.which", 1, base_m);
    vm.class_set_method(base_id, "which", bm).unwrap();
    vm.class_set_field(base_id, "tag", Value::int(7)).unwrap();

    let derived = vm.new_class("Derived", Some(base_id)).unwrap();
    let derived_id = derived.as_class_id().unwrap();
    let dm = vm.new_native_function("Derived.which", 1, derived_m);
    vm.class_set_method(derived_id, "which", dm).unwrap();
    vm.set_global("Base", base);
    vm.set_global("Derived", derived);

    let inst = vm.instantiate(derived_id).unwrap();
    vm.set_global("inst", inst);

    // Field default flows down the chain.
    assert_eq!(vm.instance_field(inst, "tag"), Some(Value::int(7)));

    // Method lookup is derived-before-base: obj.which() via Method + Call.
    let inst_name = vm.new_string("inst");
    let which = vm.new_string("which");
    let code = vec![
        Instruction::abx(OpCode::GetGlobal, 0, 0),
        Instruction::abc(OpCode::Method, 1, false, 0, 1),
        Instruction::abc(OpCode::Call, 1, false, 2, 2),
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
    ];
    let def = make_def(&mut vm, "dispatch", 0, 4, vec![inst_name, which], code);
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 2);
}

#[test]
fn hidden_fields_are_visible_only_to_privileged_code() {
    let mut vm = new_vm();
    let class_value = vm.new_class("Vault", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    vm.class_set_hidden_field(cid, "secret", Value::int(777)).unwrap();
    vm.set_global("Vault", class_value);

    // Two byte-identical bodies reading this.secret; only the one that is
    // registered as a method of the class is privileged.
    let secret_name = vm.new_string("secret");
    let body = || {
        vec![
            Instruction::abc(OpCode::Field, 1, false, 0, 0),
            Instruction::abc(OpCode::Ret, 1, false, 2, 0),
        ]
    };
    let reveal_def = make_def(&mut vm, "reveal", 1, 4, vec![secret_name], body());
    let reveal = install(&mut vm, reveal_def);
    vm.class_set_method(cid, "reveal", reveal).unwrap();

    let snoop_def = make_def(&mut vm, "snoop", 1, 4, vec![secret_name], body());
    let snoop = install(&mut vm, snoop_def);

    let inst = vm.instantiate(cid).unwrap();
    vm.set_global("vault", inst);

    let r = vm.call_value(reveal, &[inst], 1).expect("method sees hidden");
    assert_eq!(int1(&r), 777);

    assert!(vm.call_value(snoop, &[inst], 1).is_err());
    vm.catch_exception();

    // Host-side field access is unprivileged too.
    assert_eq!(vm.instance_field(inst, "secret"), None);
}

#[test]
fn privileged_code_can_assign_hidden_fields() {
    let mut vm = new_vm();
    let class_value = vm.new_class("Cell", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    vm.class_set_hidden_field(cid, "state", Value::int(0)).unwrap();
    vm.set_global("Cell", class_value);

    // bump(this): this.state = this.state + 1; return this.state
    let state_name = vm.new_string("state");
    let code = vec![
        Instruction::abc(OpCode::Field, 1, false, 0, 0),
        Instruction::abc(OpCode::Add, 1, true, 1, 1),
        Instruction::abc(OpCode::FieldAssign, 0, false, 0, 1),
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
    ];
    let def = make_def(&mut vm, "bump", 1, 4, vec![state_name, Value::int(1)], code);
    let bump = install(&mut vm, def);
    vm.class_set_method(cid, "bump", bump).unwrap();

    let inst = vm.instantiate(cid).unwrap();
    vm.set_global("cell", inst);

    let r = vm.call_value(bump, &[inst], 1).unwrap();
    assert_eq!(int1(&r), 1);
    let r = vm.call_value(bump, &[inst], 1).unwrap();
    assert_eq!(int1(&r), 2);
}

#[test]
fn subclass_methods_reach_base_hidden_fields() {
    let mut vm = new_vm();
    let base = vm.new_class("Sealed", None).unwrap();
    let base_id = base.as_class_id().unwrap();
    vm.class_set_hidden_field(base_id, "token", Value::int(31)).unwrap();
    vm.set_global("Sealed", base);

    let derived = vm.new_class("Opened", Some(base_id)).unwrap();
    let derived_id = derived.as_class_id().unwrap();

    let token_name = vm.new_string("token");
    let code = vec![
        Instruction::abc(OpCode::Field, 1, false, 0, 0),
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
    ];
    let def = make_def(&mut vm, "peek", 1, 4, vec![token_name], code);
    let peek = install(&mut vm, def);
    vm.class_set_method(derived_id, "peek", peek).unwrap();
    vm.set_global("Opened", derived);

    let inst = vm.instantiate(derived_id).unwrap();
    vm.set_global("opened", inst);

    let r = vm.call_value(peek, &[inst], 1).unwrap();
    assert_eq!(int1(&r), 31);
}

#[test]
fn calling_a_class_builds_an_instance_and_runs_the_constructor() {
    let mut vm = new_vm();
    fn ctor(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let this = vm.arg(tid, 0);
        let arg = vm.arg(tid, 1);
        let key = vm.intern("x");
        if let Some(iid) = this.as_instance_id() {
            if let Some(i) = vm.pool.instance_mut(iid) {
                i.set_field(key, arg);
            }
        }
        Ok(0)
    }
    let class_value = vm.new_class("Point", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    vm.class_set_field(cid, "x", Value::null()).unwrap();
    let c = vm.new_native_function("Point.ctor", 2, ctor);
    vm.class_set_constructor(cid, c).unwrap();
    vm.set_global("Point", class_value);

    let r = vm.call_value(class_value, &[Value::int(5)], 1).unwrap();
    let inst = r[0];
    assert!(inst.is_instance());
    assert_eq!(vm.instance_field(inst, "x"), Some(Value::int(5)));

    // Instantiation froze the class.
    assert!(vm.pool().class(cid).unwrap().is_frozen());
    assert!(vm.class_set_field(cid, "y", Value::null()).is_err());
    vm.catch_exception();
}

#[test]
fn metamethods_resolve_on_the_class_of_the_operand() {
    let mut vm = new_vm();
    fn op_add(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let this = vm.arg(tid, 0);
        let rhs = vm.arg(tid, 1);
        let v = vm.instance_field(this, "v").and_then(|v| v.as_int()).unwrap_or(0);
        let r = rhs.as_int().unwrap_or(0);
        vm.push(tid, Value::int(v + r));
        Ok(1)
    }
    let class_value = vm.new_class("Adder", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    vm.class_set_field(cid, "v", Value::int(40)).unwrap();
    let m = vm.new_native_function("Adder.opAdd", 2, op_add);
    vm.class_set_method(cid, "opAdd", m).unwrap();
    vm.set_global("Adder", class_value);

    let inst = vm.instantiate(cid).unwrap();
    vm.set_global("adder", inst);

    let adder_name = vm.new_string("adder");
    let code = vec![
        Instruction::abx(OpCode::GetGlobal, 0, 0),
        Instruction::abc(OpCode::Add, 1, true, 0, 1), // r1 = adder + 2
        Instruction::abc(OpCode::Ret, 1, false, 2, 0),
    ];
    let def = make_def(&mut vm, "use_mm", 0, 4, vec![adder_name, Value::int(2)], code);
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 42);
}

#[test]
fn foreach_walks_a_function_iterator() {
    let mut vm = new_vm();
    // Iterator protocol: f(state, control) -> next control or null.
    fn upto(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let limit = vm.arg(tid, 0).as_int().unwrap_or(0);
        let prev = vm.arg(tid, 1).as_int().unwrap_or(0);
        let next = prev + 1;
        if next > limit {
            vm.push(tid, Value::null());
        } else {
            vm.push(tid, Value::int(next));
        }
        Ok(1)
    }
    let iter = vm.new_native_function("upto", 2, upto);
    vm.set_global("upto", iter);

    // sum = 0; foreach i over upto(4, start 0): sum += i; return sum
    let upto_name = vm.new_string("upto");
    let code = vec![
        Instruction::abx(OpCode::LoadK, 0, 0),           // r0 = sum = 0
        Instruction::abx(OpCode::GetGlobal, 1, 1),       // r1 = iter
        Instruction::abx(OpCode::LoadK, 2, 2),           // r2 = state = 4
        Instruction::abx(OpCode::LoadK, 3, 0),           // r3 = control = 0
        Instruction::abc(OpCode::ForeachCall, 1, false, 0, 1), // r4 = f(state, ctl)
        Instruction::asbx(OpCode::ForeachLoop, 1, 1),    // continue -> 6
        Instruction::asbx(OpCode::Jmp, 0, 2),            // done -> 8
        Instruction::abc(OpCode::Add, 0, false, 0, 4),   // sum += r4
        Instruction::asbx(OpCode::Jmp, 0, -5),           // back to ForeachCall
        Instruction::abc(OpCode::Ret, 0, false, 2, 0),
    ];
    let def = make_def(
        &mut vm,
        "sum_upto",
        0,
        8,
        vec![Value::int(0), upto_name, Value::int(4)],
        code,
    );
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 10); // 1+2+3+4
}

#[test]
fn hooks_fire_on_calls_and_returns_without_reentry() {
    let mut vm = new_vm();
    fn hook(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let ev = vm.arg(tid, 0);
        let name = ev.as_string_id().map(|s| vm.pool().str_of(s).to_string());
        let key = match name.as_deref() {
            Some("call") => "hook_calls",
            Some("ret") => "hook_rets",
            _ => return Ok(0),
        };
        let n = vm.get_global(key).and_then(|v| v.as_int()).unwrap_or(0);
        vm.set_global(key, Value::int(n + 1));
        Ok(0)
    }
    vm.set_global("hook_calls", Value::int(0));
    vm.set_global("hook_rets", Value::int(0));
    let h = vm.new_native_function("hook", 2, hook);
    let tid = vm.main_thread();
    vm.set_hook(tid, h, hook_bits::CALL | hook_bits::RET, 0);

    let code = vec![
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::Ret, 0, false, 2, 0),
    ];
    let def = make_def(&mut vm, "hooked", 0, 2, vec![Value::int(5)], code);
    let f = install(&mut vm, def);
    let r = vm.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 5);

    let calls = vm.get_global("hook_calls").and_then(|v| v.as_int()).unwrap();
    let rets = vm.get_global("hook_rets").and_then(|v| v.as_int()).unwrap();
    assert!(calls >= 1, "call hook fired");
    assert!(rets >= 1, "ret hook fired");

    vm.set_hook(tid, Value::null(), 0, 0);
}

#[test]
fn delay_hook_fires_periodically() {
    let mut vm = new_vm();
    fn hook(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let ev = vm.arg(tid, 0);
        let is_delay = ev
            .as_string_id()
            .map(|s| vm.pool().str_of(s) == "delay")
            .unwrap_or(false);
        if is_delay {
            let n = vm.get_global("ticks").and_then(|v| v.as_int()).unwrap_or(0);
            vm.set_global("ticks", Value::int(n + 1));
        }
        Ok(0)
    }
    vm.set_global("ticks", Value::int(0));
    let h = vm.new_native_function("delay_hook", 2, hook);
    let tid = vm.main_thread();
    vm.set_hook(tid, h, hook_bits::DELAY, 10);

    // ~100 instructions of busy work.
    let code = vec![
        Instruction::abx(OpCode::LoadK, 1, 0),
        Instruction::abx(OpCode::LoadK, 2, 1),
        Instruction::abx(OpCode::LoadK, 3, 2),
        Instruction::asbx(OpCode::ForPrep, 1, 1),
        Instruction::abc(OpCode::Move, 5, false, 4, 0),
        Instruction::asbx(OpCode::ForLoop, 1, -2),
        Instruction::abc(OpCode::Ret, 0, false, 1, 0),
    ];
    let def = make_def(
        &mut vm,
        "busy",
        0,
        8,
        vec![Value::int(0), Value::int(50), Value::int(1)],
        code,
    );
    let f = install(&mut vm, def);
    vm.call_value(f, &[], 0).unwrap();

    let ticks = vm.get_global("ticks").and_then(|v| v.as_int()).unwrap();
    assert!(ticks >= 5, "delay hook ticked {} times", ticks);
    vm.set_hook(tid, Value::null(), 0, 0);
}

// Serializer: round trips, back-references, cycles, transients, modules.

use super::*;
use crate::value::{ThreadId, UpvalDesc};
use crate::vm::{ExecError, OpCode};

fn roundtrip(vm: &mut CrocVm, v: Value) -> Value {
    let bytes = vm.serialize_graph(v, None).expect("serialize");
    vm.deserialize_graph(&bytes, None).expect("deserialize")
}

#[test]
fn scalars_round_trip() {
    let mut vm = new_vm();
    for v in [
        Value::null(),
        Value::bool(true),
        Value::bool(false),
        Value::int(0),
        Value::int(-12345),
        Value::int(i64::MAX),
        Value::float(3.5),
        Value::float(-0.0),
    ] {
        let back = roundtrip(&mut vm, v);
        assert!(back.raw_equal(&v), "{:?} survived", v);
    }
}

#[test]
fn strings_reintern_on_read() {
    let mut vm = new_vm();
    let s = vm.new_string("serial me");
    let back = roundtrip(&mut vm, s);
    // Same VM: interning makes the restored string the same object.
    assert!(back.is_identical(&s));
}

#[test]
fn flat_containers_round_trip() {
    let mut vm = new_vm();
    let key = vm.new_string("answer");
    let t = vm.new_table();
    vm.table_set(t, key, Value::int(42)).unwrap();
    vm.table_set(t, Value::int(7), Value::float(1.25)).unwrap();

    let back = roundtrip(&mut vm, t);
    assert!(!back.is_identical(&t), "a fresh table is built");
    assert_eq!(vm.table_get(back, key).unwrap(), Value::int(42));
    assert_eq!(vm.table_get(back, Value::int(7)).unwrap(), Value::float(1.25));

    let arr = vm.new_array_from(vec![Value::int(1), Value::int(2), Value::int(3)]);
    let back = roundtrip(&mut vm, arr);
    let aid = back.as_array_id().unwrap();
    let values: Vec<Value> = vm.pool().array(aid).unwrap().values().collect();
    assert_eq!(values, vec![Value::int(1), Value::int(2), Value::int(3)]);

    let mb = vm.new_memblock_from(vec![0xDE, 0xAD, 0xBE, 0xEF]);
    let back = roundtrip(&mut vm, mb);
    let mid = back.as_memblock_id().unwrap();
    assert_eq!(vm.pool().memblock(mid).unwrap().as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn self_referencing_table_round_trips() {
    let mut vm = new_vm();
    let key = vm.new_string("self");
    let t = vm.new_table();
    vm.table_set(t, key, t).unwrap();
    vm.set_global("t", t); // root across the GC that may run inside

    let back = roundtrip(&mut vm, t);
    let inner = vm.table_get(back, key).unwrap();
    assert!(inner.is_identical(&back), "cycle restored by identity");
}

#[test]
fn shared_subobjects_keep_their_identity() {
    let mut vm = new_vm();
    let shared = vm.new_table();
    let arr = vm.new_array_from(vec![shared, shared]);

    let back = roundtrip(&mut vm, arr);
    let aid = back.as_array_id().unwrap();
    let (a0, a1) = {
        let a = vm.pool().array(aid).unwrap();
        (a.get(0).unwrap(), a.get(1).unwrap())
    };
    assert!(a0.is_identical(&a1), "one back-reference, one object");
    assert!(!a0.is_identical(&shared));
}

#[test]
fn mutual_table_cycle_round_trips() {
    let mut vm = new_vm();
    let ka = vm.new_string("a");
    let kb = vm.new_string("b");
    let a = vm.new_table();
    let b = vm.new_table();
    vm.table_set(a, kb, b).unwrap();
    vm.table_set(b, ka, a).unwrap();

    let back_a = roundtrip(&mut vm, a);
    let back_b = vm.table_get(back_a, kb).unwrap();
    let forth = vm.table_get(back_b, ka).unwrap();
    assert!(forth.is_identical(&back_a));
}

#[test]
fn threads_and_native_functions_refuse_to_serialize() {
    let mut vm = new_vm();

    fn noop(_vm: &mut CrocVm, _t: ThreadId, _n: usize) -> Result<usize, ExecError> {
        Ok(0)
    }
    let native = vm.new_native_function("noop", 0, noop);
    assert!(vm.serialize_graph(native, None).is_err());
    vm.catch_exception();

    let body = {
        let def = make_def(
            &mut vm,
            "tiny",
            0,
            1,
            vec![],
            vec![Instruction::abc(OpCode::Ret, 0, false, 1, 0)],
        );
        install(&mut vm, def)
    };
    let co = vm.new_thread(body).unwrap();
    assert!(vm.serialize_graph(co, None).is_err());
    vm.catch_exception();

    let view = vm.new_memblock_view(&[1, 2, 3]);
    assert!(vm.serialize_graph(view, None).is_err());
    vm.catch_exception();
}

#[test]
fn finalizable_instances_refuse_to_serialize() {
    let mut vm = new_vm();
    fn fin(_vm: &mut CrocVm, _t: ThreadId, _n: usize) -> Result<usize, ExecError> {
        Ok(0)
    }
    let class_value = vm.new_class("Guarded", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    let f = vm.new_native_function("fin", 1, fin);
    vm.class_set_finalizer(cid, f).unwrap();
    vm.set_global("Guarded", class_value);

    let inst = vm.instantiate(cid).unwrap();
    vm.set_global("inst", inst);
    assert!(vm.serialize_graph(inst, None).is_err());
    vm.catch_exception();
}

#[test]
fn transients_substitute_unserializable_values() {
    let mut vm = new_vm();
    // A native object stands in for a host handle; the transients map
    // rewrites it to a marker string and restores it on read.
    let handle = vm.new_nativeobj(Box::new(17u32));
    let marker = vm.new_string("the-handle");
    let trans = vm.new_table();
    vm.table_set(trans, handle, marker).unwrap();
    vm.set_global("trans", trans);

    let arr = vm.new_array_from(vec![Value::int(1), handle]);
    let tid = trans.as_table_id().unwrap();
    let bytes = vm.serialize_graph(arr, Some(tid)).expect("serialize");
    let back = vm.deserialize_graph(&bytes, Some(tid)).expect("deserialize");

    let aid = back.as_array_id().unwrap();
    let restored = vm.pool().array(aid).unwrap().get(1).unwrap();
    assert!(restored.is_identical(&handle));
}

#[test]
fn module_round_trips_into_a_fresh_vm() {
    let mut vm = new_vm();
    let def = make_def(
        &mut vm,
        "module_top",
        0,
        2,
        vec![Value::int(42)],
        vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Ret, 0, false, 2, 0),
        ],
    );
    let def_id = vm.new_funcdef(def);
    let bytes = vm.serialize_module("answers", def_id).expect("module out");
    assert_eq!(&bytes[..4], b"Croc");

    let mut vm2 = new_vm();
    let (name, def2) = vm2.deserialize_module(&bytes).expect("module in");
    assert_eq!(vm2.pool().str_of(name), "answers");

    let f = vm2.new_function(def2, None).expect("cacheable close");
    let r = vm2.call_value(f, &[], 1).unwrap();
    assert_eq!(int1(&r), 42);

    // Closing again returns the cached closure.
    let f2 = vm2.new_function(def2, None).unwrap();
    assert!(f2.is_identical(&f));
}

#[test]
fn cached_module_defs_are_rejected() {
    let mut vm = new_vm();
    let def = make_def(
        &mut vm,
        "once",
        0,
        1,
        vec![],
        vec![Instruction::abc(OpCode::Ret, 0, false, 1, 0)],
    );
    let def_id = vm.new_funcdef(def);
    vm.new_function(def_id, None).unwrap(); // caches the closure
    assert!(vm.serialize_module("once", def_id).is_err());
    vm.catch_exception();
}

#[test]
fn closures_round_trip_with_shared_upvalues() {
    let mut vm = new_vm();
    // Two closures over one closed cell, built by the factory from the
    // interpreter suite's pattern.
    let inc_def = {
        let mut d = make_def(
            &mut vm,
            "inc",
            0,
            2,
            vec![Value::int(1)],
            vec![
                Instruction::abc(OpCode::GetUpval, 0, false, 0, 0),
                Instruction::abc(OpCode::Add, 0, true, 0, 0),
                Instruction::abc(OpCode::SetUpval, 0, false, 0, 0),
                Instruction::abc(OpCode::Ret, 0, false, 1, 0),
            ],
        );
        d.upvals = vec![UpvalDesc::Local(0)];
        d.cacheable = false;
        d
    };
    let get_def = {
        let mut d = make_def(
            &mut vm,
            "get",
            0,
            2,
            vec![],
            vec![
                Instruction::abc(OpCode::GetUpval, 0, false, 0, 0),
                Instruction::abc(OpCode::Ret, 0, false, 2, 0),
            ],
        );
        d.upvals = vec![UpvalDesc::Local(0)];
        d.cacheable = false;
        d
    };
    let inc_id = vm.new_funcdef(inc_def);
    let get_id = vm.new_funcdef(get_def);
    let factory_def = {
        let mut d = make_def(
            &mut vm,
            "factory",
            0,
            4,
            vec![Value::int(0)],
            vec![
                Instruction::abx(OpCode::LoadK, 0, 0),
                Instruction::abx(OpCode::Closure, 1, 0),
                Instruction::abx(OpCode::Closure, 2, 1),
                Instruction::abc(OpCode::Ret, 1, false, 3, 0),
            ],
        );
        d.inner_defs = vec![inc_id, get_id];
        d
    };
    let factory = install(&mut vm, factory_def);
    let pair = vm.call_value(factory, &[], 2).unwrap();
    vm.call_value(pair[0], &[], 0).unwrap(); // count = 1

    let both = vm.new_array_from(vec![pair[0], pair[1]]);
    vm.set_global("both", both);
    let back = roundtrip(&mut vm, both);

    let aid = back.as_array_id().unwrap();
    let (inc2, get2) = {
        let a = vm.pool().array(aid).unwrap();
        (a.get(0).unwrap(), a.get(1).unwrap())
    };
    // The restored pair shares one cell, detached from the original.
    vm.call_value(inc2, &[], 0).unwrap();
    vm.call_value(inc2, &[], 0).unwrap();
    let r = vm.call_value(get2, &[], 1).unwrap();
    assert_eq!(int1(&r), 3);
    let r = vm.call_value(pair[1], &[], 1).unwrap();
    assert_eq!(int1(&r), 1, "original cell untouched");
}

#[test]
fn custom_hooks_drive_their_own_payload() {
    let mut vm = new_vm();

    // opSerialize emits the `x` field; opDeserialize pulls it back.
    fn ser_hook(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let this = vm.arg(tid, 0);
        let emit = vm.arg(tid, 2);
        let x = vm.instance_field(this, "x").unwrap_or_default();
        vm.call_value(emit, &[x], 0)?;
        Ok(0)
    }
    fn deser_hook(vm: &mut CrocVm, tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        let this = vm.arg(tid, 0);
        let pull = vm.arg(tid, 2);
        let x = vm.call_value(pull, &[], 1)?.first().copied().unwrap_or_default();
        let key = vm.intern("x");
        if let Some(iid) = this.as_instance_id() {
            if let Some(inst) = vm.pool.instance_mut(iid) {
                inst.set_field(key, x);
            }
        }
        Ok(0)
    }

    let class_value = vm.new_class("Packet", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    vm.class_set_field(cid, "x", Value::null()).unwrap();
    let s = vm.new_native_function("Packet.opSerialize", 3, ser_hook);
    vm.class_set_method(cid, "opSerialize", s).unwrap();
    let d = vm.new_native_function("Packet.opDeserialize", 3, deser_hook);
    vm.class_set_method(cid, "opDeserialize", d).unwrap();
    vm.set_global("Packet", class_value);

    // The class carries native methods, so it must travel by transient.
    let marker = vm.new_string("class:Packet");
    let trans = vm.new_table();
    vm.table_set(trans, class_value, marker).unwrap();
    vm.set_global("trans", trans);

    let inst = vm.instantiate(cid).unwrap();
    let key = vm.intern("x");
    if let Some(i) = vm.pool.instance_mut(inst.as_instance_id().unwrap()) {
        i.set_field(key, Value::int(99));
    }
    vm.set_global("inst", inst);

    let tid = trans.as_table_id().unwrap();
    let bytes = vm.serialize_graph(inst, Some(tid)).expect("custom serialize");
    let back = vm.deserialize_graph(&bytes, Some(tid)).expect("custom deserialize");

    assert!(!back.is_identical(&inst));
    assert_eq!(vm.instance_field(back, "x"), Some(Value::int(99)));
}

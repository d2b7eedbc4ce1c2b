// Collector invariants: reachability, finalizers, weak references.

use super::*;
use crate::value::ThreadId;
use crate::vm::ExecError;

#[test]
fn rooted_objects_survive_a_full_collection() {
    let mut vm = new_vm();
    let t = vm.new_table();
    vm.table_set(t, Value::int(1), Value::int(42)).unwrap();
    vm.set_global("keep", t);

    vm.collect_garbage().unwrap();

    let back = vm.get_global("keep").unwrap();
    assert!(back.is_identical(&t));
    assert_eq!(vm.table_get(back, Value::int(1)).unwrap(), Value::int(42));
}

#[test]
fn unrooted_objects_are_reclaimed() {
    let mut vm = new_vm();
    let before = vm.pool().tables.len();
    for _ in 0..100 {
        vm.new_table();
    }
    assert_eq!(vm.pool().tables.len(), before + 100);
    vm.collect_garbage().unwrap();
    assert_eq!(vm.pool().tables.len(), before);
}

#[test]
fn reference_cycles_are_collected() {
    let mut vm = new_vm();
    let a = vm.new_table();
    let b = vm.new_table();
    let ka = vm.new_string("a");
    let kb = vm.new_string("b");
    vm.table_set(a, kb, b).unwrap();
    vm.table_set(b, ka, a).unwrap();

    let before = vm.pool().tables.len();
    vm.collect_garbage().unwrap();
    // Mark-sweep proves the cycle dead even though each member is referenced.
    assert_eq!(vm.pool().tables.len(), before - 2);
}

#[test]
fn weakref_is_nulled_after_referent_dies() {
    let mut vm = new_vm();
    let x = vm.new_table();
    let w = vm.new_weakref(x).unwrap();
    let pin = vm.pin(w); // keep the weak ref itself alive

    assert!(vm.weakref_deref(w).is_identical(&x));

    // Drop the only strong reference (x was never rooted) and collect.
    vm.collect_garbage().unwrap();

    assert!(vm.weakref_deref(w).is_null());
    vm.unpin(pin);
}

#[test]
fn weakrefs_are_uniqued_per_referent() {
    let mut vm = new_vm();
    let x = vm.new_table();
    vm.set_global("x", x);
    let w1 = vm.new_weakref(x).unwrap();
    let w2 = vm.new_weakref(x).unwrap();
    assert!(w1.is_identical(&w2));
}

/// Finalizer that bumps the `fin_count` global.
fn counting_finalizer(vm: &mut CrocVm, _tid: ThreadId, _nargs: usize) -> Result<usize, ExecError> {
    let n = vm
        .get_global("fin_count")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    vm.set_global("fin_count", Value::int(n + 1));
    Ok(0)
}

#[test]
fn finalizers_run_exactly_once_before_reclamation() {
    let mut vm = new_vm();
    vm.set_global("fin_count", Value::int(0));

    let class_value = vm.new_class("Resource", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    let fin = vm.new_native_function("finalize_resource", 1, counting_finalizer);
    vm.class_set_finalizer(cid, fin).unwrap();
    vm.set_global("Resource", class_value);

    let instances_before = vm.pool().instances.len();
    vm.instantiate(cid).unwrap(); // unreachable immediately

    // First cycle: the instance is resurrected and finalized, not freed.
    vm.collect_garbage().unwrap();
    assert_eq!(
        vm.get_global("fin_count").unwrap(),
        Value::int(1),
        "finalizer ran once"
    );

    // Second cycle: the finalized instance is reclaimed, finalizer not rerun.
    vm.collect_garbage().unwrap();
    assert_eq!(vm.get_global("fin_count").unwrap(), Value::int(1));
    assert_eq!(vm.pool().instances.len(), instances_before);
}

#[test]
fn finalizable_cycle_is_fatal() {
    let mut vm = new_vm();
    let class_value = vm.new_class("Linked", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    let fin = vm.new_native_function("finalize_linked", 1, counting_finalizer);
    vm.class_set_finalizer(cid, fin).unwrap();
    vm.class_set_field(cid, "other", Value::null()).unwrap();
    vm.set_global("fin_count", Value::int(0));
    vm.set_global("Linked", class_value);

    let a = vm.instantiate(cid).unwrap();
    let b = vm.instantiate(cid).unwrap();
    let other = vm.intern("other");
    if let Some(inst) = vm.pool.instance_mut(a.as_instance_id().unwrap()) {
        inst.set_field(other, b);
    }
    if let Some(inst) = vm.pool.instance_mut(b.as_instance_id().unwrap()) {
        inst.set_field(other, a);
    }

    // Both are unreachable, finalizable, and mutually entangled: the
    // collection order would be undefined, so the VM gives up.
    let err = vm.collect_garbage();
    assert_eq!(err, Err(ExecError::Fatal));
    assert!(vm.fatal_message().contains("finalizable"));
}

#[test]
fn close_runs_outstanding_finalizers() {
    use std::sync::atomic::{AtomicI64, Ordering};
    static CLOSE_FINALIZED: AtomicI64 = AtomicI64::new(0);
    fn fin(_vm: &mut CrocVm, _tid: ThreadId, _n: usize) -> Result<usize, ExecError> {
        CLOSE_FINALIZED.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    let mut vm = new_vm();
    let class_value = vm.new_class("Handle", None).unwrap();
    let cid = class_value.as_class_id().unwrap();
    let f = vm.new_native_function("finalize_handle", 1, fin);
    vm.class_set_finalizer(cid, f).unwrap();
    vm.set_global("Handle", class_value);

    // One reachable instance, one garbage; close finalizes both.
    let kept = vm.instantiate(cid).unwrap();
    vm.set_global("kept", kept);
    vm.instantiate(cid).unwrap();

    CLOSE_FINALIZED.store(0, Ordering::SeqCst);
    vm.close().unwrap();
    assert_eq!(CLOSE_FINALIZED.load(Ordering::SeqCst), 2);
}

#[test]
fn dead_strings_leave_the_intern_table() {
    let mut vm = new_vm();
    let kept = vm.new_string("kept_string");
    vm.set_global("kept", kept);
    vm.new_string("transient_string");

    vm.collect_garbage().unwrap();

    // Re-interning the dead content builds a fresh object; the kept one is
    // still canonical.
    let again = vm.new_string("kept_string");
    assert!(again.is_identical(&kept));
    let reborn = vm.new_string("transient_string");
    assert!(reborn.is_string());
}

#[test]
fn gc_runs_incrementally_during_execution() {
    let mut vm = new_vm();
    // A loop that allocates garbage tables every iteration and eventually
    // crosses the debt threshold mid-run.
    let code = vec![
        Instruction::abx(crate::vm::OpCode::LoadK, 1, 0), // r1 = idx = 0
        Instruction::abc(crate::vm::OpCode::Move, 2, false, 0, 0), // limit = n
        Instruction::abx(crate::vm::OpCode::LoadK, 3, 1), // step = 1
        Instruction::asbx(crate::vm::OpCode::ForPrep, 1, 1),
        Instruction::abc(crate::vm::OpCode::NewTable, 5, false, 0, 0), // garbage
        Instruction::asbx(crate::vm::OpCode::ForLoop, 1, -2),
        Instruction::abc(crate::vm::OpCode::Ret, 0, false, 1, 0),
    ];
    let def = make_def(
        &mut vm,
        "churn",
        1,
        8,
        vec![Value::int(0), Value::int(1)],
        code,
    );
    let f = install(&mut vm, def);
    vm.call_value(f, &[Value::int(20_000)], 0).unwrap();

    let stats = vm.gc_stats();
    assert!(stats.collection_count > 0, "GC should have stepped in");
    // Most of the garbage is gone again.
    assert!(vm.pool().tables.len() < 20_000 / 2);
}

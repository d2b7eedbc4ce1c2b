// Coroutines: create/resume/yield, state machine, LIFO nesting, halt.

use super::*;
use crate::value::ThreadState;
use crate::vm::OpCode;

/// Body that yields 1, 2, 3 and then returns nothing.
fn producer(vm: &mut CrocVm) -> Value {
    let code = vec![
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::Yield, 0, false, 2, 1),
        Instruction::abx(OpCode::LoadK, 0, 1),
        Instruction::abc(OpCode::Yield, 0, false, 2, 1),
        Instruction::abx(OpCode::LoadK, 0, 2),
        Instruction::abc(OpCode::Yield, 0, false, 2, 1),
        Instruction::abc(OpCode::Ret, 0, false, 1, 0),
    ];
    let def = make_def(
        vm,
        "producer",
        0,
        2,
        vec![Value::int(1), Value::int(2), Value::int(3)],
        code,
    );
    install(vm, def)
}

#[test]
fn producer_yields_then_dies() {
    let mut vm = new_vm();
    let f = producer(&mut vm);
    let co = vm.new_thread(f).expect("thread");

    assert_eq!(vm.thread_state(co), Some(ThreadState::Initial));
    for want in [1, 2, 3] {
        let r = vm.resume_thread(co, &[]).expect("resume");
        assert_eq!(int1(&r), want);
        assert_eq!(vm.thread_state(co), Some(ThreadState::Suspended));
    }
    let r = vm.resume_thread(co, &[]).expect("final resume");
    assert!(r.is_empty());
    assert_eq!(vm.thread_state(co), Some(ThreadState::Dead));

    // A dead coroutine refuses to run again.
    assert!(vm.resume_thread(co, &[]).is_err());
    vm.catch_exception();
}

#[test]
fn resume_arguments_become_yield_results() {
    let mut vm = new_vm();
    // r0 = yield 10; return r0 + 1
    let code = vec![
        Instruction::abx(OpCode::LoadK, 0, 0),
        Instruction::abc(OpCode::Yield, 0, false, 2, 2), // yield r0, expect 1
        Instruction::abc(OpCode::Add, 0, true, 0, 1),    // r0 = r0 + 1
        Instruction::abc(OpCode::Ret, 0, false, 2, 0),
    ];
    let def = make_def(
        &mut vm,
        "echo",
        0,
        2,
        vec![Value::int(10), Value::int(1)],
        code,
    );
    let f = install(&mut vm, def);
    let co = vm.new_thread(f).unwrap();

    let r = vm.resume_thread(co, &[]).unwrap();
    assert_eq!(int1(&r), 10);
    let r = vm.resume_thread(co, &[Value::int(100)]).unwrap();
    assert_eq!(int1(&r), 101);
    assert_eq!(vm.thread_state(co), Some(ThreadState::Dead));
}

#[test]
fn lifo_nesting_yields_to_the_nearest_resumer() {
    let mut vm = new_vm();

    // C: yields 10, then returns 20.
    let c_def = make_def(
        &mut vm,
        "c_body",
        0,
        2,
        vec![Value::int(10), Value::int(20)],
        vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Yield, 0, false, 2, 1),
            Instruction::abx(OpCode::LoadK, 0, 1),
            Instruction::abc(OpCode::Ret, 0, false, 2, 0),
        ],
    );
    let c_func = install(&mut vm, c_def);
    let co_c = vm.new_thread(c_func).unwrap();

    // B(c): r1 = c() resumes C; C's yield lands HERE, not in main.
    //       yield r1 + 1; then r2 = c() again -> C returns 20; return it.
    let b_def = make_def(
        &mut vm,
        "b_body",
        1,
        4,
        vec![Value::int(1)],
        vec![
            Instruction::abc(OpCode::Move, 1, false, 0, 0),
            Instruction::abc(OpCode::Call, 1, false, 1, 2), // r1 = resume C -> 10
            Instruction::abc(OpCode::Add, 1, true, 1, 0),   // r1 = 11
            Instruction::abc(OpCode::Yield, 1, false, 2, 1), // -> main sees 11
            Instruction::abc(OpCode::Move, 2, false, 0, 0),
            Instruction::abc(OpCode::Call, 2, false, 1, 2), // r2 = resume C -> 20
            Instruction::abc(OpCode::Ret, 2, false, 2, 0),
        ],
    );
    let b_func = install(&mut vm, b_def);
    let co_b = vm.new_thread(b_func).unwrap();

    // Main resumes B; B resumes C; C yields 10 to B; B yields 11 to main.
    let r = vm.resume_thread(co_b, &[co_c]).expect("resume chain");
    assert_eq!(int1(&r), 11);
    assert_eq!(vm.thread_state(co_b), Some(ThreadState::Suspended));
    assert_eq!(vm.thread_state(co_c), Some(ThreadState::Suspended));

    // Second leg: B finishes C and returns its result.
    let r = vm.resume_thread(co_b, &[]).unwrap();
    assert_eq!(int1(&r), 20);
    assert_eq!(vm.thread_state(co_b), Some(ThreadState::Dead));
    assert_eq!(vm.thread_state(co_c), Some(ThreadState::Dead));
}

#[test]
fn coroutine_error_propagates_to_the_resumer() {
    let mut vm = new_vm();
    let boom = vm.new_string("boom");
    let def = make_def(
        &mut vm,
        "thrower",
        0,
        2,
        vec![boom],
        vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Throw, 0, false, 0, 0),
        ],
    );
    let f = install(&mut vm, def);
    let co = vm.new_thread(f).unwrap();

    assert!(vm.resume_thread(co, &[]).is_err());
    assert_eq!(vm.thread_state(co), Some(ThreadState::Dead));
    let exc = vm.catch_exception().expect("propagated exception");
    let v = vm.instance_field(exc, "value").unwrap();
    assert!(v.raw_equal(&boom));
}

#[test]
fn main_thread_cannot_yield() {
    let mut vm = new_vm();
    let def = make_def(
        &mut vm,
        "bad_yield",
        0,
        2,
        vec![],
        vec![
            Instruction::abc(OpCode::Yield, 0, false, 1, 1),
            Instruction::abc(OpCode::Ret, 0, false, 1, 0),
        ],
    );
    let f = install(&mut vm, def);
    assert!(vm.call_value(f, &[], 0).is_err());
    let exc = vm.catch_exception().unwrap();
    let msg = vm.instance_field(exc, "msg").unwrap();
    let s = vm.pool().str_of(msg.as_string_id().unwrap()).to_string();
    assert!(s.contains("main thread"));
}

#[test]
fn halt_unwinds_a_spinning_coroutine() {
    let mut vm = new_vm();
    // Infinite loop: Jmp -1.
    let def = make_def(
        &mut vm,
        "spin",
        0,
        1,
        vec![],
        vec![Instruction::asbx(OpCode::Jmp, 0, -1)],
    );
    let f = install(&mut vm, def);
    let co = vm.new_thread(f).unwrap();
    let co_id = co.as_thread_id().unwrap();

    // Mark for halting before resuming: the first back-branch honors it.
    vm.halt(co_id);
    let r = vm.resume_thread(co, &[]).expect("halt is not an error for the resumer");
    assert!(r.is_empty());
    assert_eq!(vm.thread_state(co), Some(ThreadState::Dead));
}

#[test]
fn halt_runs_finally_blocks() {
    let mut vm = new_vm();
    let marker = vm.new_string("cleanup_ran");
    // global cleanup = false is pre-set by the host; finally sets it true,
    // then the loop halts.
    let def = make_def(
        &mut vm,
        "spin_guarded",
        0,
        2,
        vec![marker, Value::bool(true)],
        vec![
            Instruction::asbx(OpCode::PushFinally, 0, 2), // handler at 3
            Instruction::asbx(OpCode::Jmp, 0, -1),        // spin
            Instruction::abc(OpCode::Ret, 0, false, 1, 0),
            Instruction::abc(OpCode::LoadBool, 0, true, 0, 0), // finally:
            Instruction::abx(OpCode::SetGlobal, 0, 0),
            Instruction::abc(OpCode::EndFinally, 0, false, 0, 0),
        ],
    );
    let f = install(&mut vm, def);
    vm.set_global("cleanup_ran", Value::bool(false));

    let co = vm.new_thread(f).unwrap();
    let co_id = co.as_thread_id().unwrap();
    vm.halt(co_id);
    vm.resume_thread(co, &[]).expect("halted resume");

    assert_eq!(vm.get_global("cleanup_ran"), Some(Value::bool(true)));
    assert_eq!(vm.thread_state(co), Some(ThreadState::Dead));
}

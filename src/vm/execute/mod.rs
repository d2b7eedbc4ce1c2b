// Bytecode interpreter: decode-dispatch loop, call/return protocol,
// exception unwinding and the portable coroutine scheduler.

mod arith;
mod index_ops;

pub(crate) use arith::{arith_binary, arith_unary, cat_values, cmp_values, ArithOp};
pub(crate) use index_ops::{
    field_get, field_set, in_values, index_get, index_set, method_of, slice_get, slice_set,
};

use crate::gc::GcId;
use crate::value::*;
use crate::vm::{ActRecord, CrocVm, ExecError, ExecResult, Instruction, MetaName, OpCode, TryRecord};

/// What precall did with the callee.
enum CallKind {
    /// Native function ran to completion; results already delivered.
    Done,
    /// A script frame was pushed; the interpreter must run it.
    Script,
}

/// Hook events, in wire order: Call, Ret, TailRet, Line, Delay.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Ret,
    TailRet,
    Line,
    Delay,
}

impl HookEvent {
    fn mask_bit(self) -> u8 {
        match self {
            HookEvent::Call => hook_bits::CALL,
            HookEvent::Ret => hook_bits::RET,
            HookEvent::TailRet => hook_bits::TAILRET,
            HookEvent::Line => hook_bits::LINE,
            HookEvent::Delay => hook_bits::DELAY,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HookEvent::Call => "call",
            HookEvent::Ret => "ret",
            HookEvent::TailRet => "tailret",
            HookEvent::Line => "line",
            HookEvent::Delay => "delay",
        }
    }
}

impl CrocVm {
    // ============ Host-level calls ============

    /// Call a callable value with arguments, returning up to `expected`
    /// results (-1 = all). This is the entry point used by the host, by
    /// native functions and by metamethod dispatch.
    pub fn call_value(&mut self, func: Value, args: &[Value], expected: i32) -> ExecResult<Vec<Value>> {
        let tid = self.current_thread;
        let func_slot = self.top(tid);

        self.push(tid, func);
        for a in args {
            self.push(tid, *a);
        }

        let depth = self
            .pool
            .thread(tid)
            .map(|t| t.act_records.len())
            .unwrap_or(0);

        let result = (|| -> ExecResult<()> {
            match self.precall(tid, func_slot, args.len(), expected)? {
                CallKind::Done => Ok(()),
                CallKind::Script => self.run_interpreter(tid, depth),
            }
        })();

        match result {
            Ok(()) => {}
            Err(e) => {
                // Drop any frames this call left behind before propagating.
                self.unwind_to_depth(tid, depth);
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set_top(func_slot);
                }
                return Err(e);
            }
        }

        let top = self.top(tid);
        let mut results = Vec::with_capacity(top.saturating_sub(func_slot));
        for i in func_slot..top {
            results.push(self.get_slot(tid, i));
        }
        if let Some(t) = self.pool.thread_mut(tid) {
            t.set_top(func_slot);
        }
        Ok(results)
    }

    /// Like call_value, but catches a thrown exception and hands it back as
    /// the inner Err. Halt and fatal signals still propagate - user code
    /// never catches those.
    pub fn call_protected(
        &mut self,
        func: Value,
        args: &[Value],
        expected: i32,
    ) -> ExecResult<Result<Vec<Value>, Value>> {
        match self.call_value(func, args, expected) {
            Ok(r) => Ok(Ok(r)),
            Err(ExecError::Exception) => {
                Ok(Err(self.catch_exception().unwrap_or_default()))
            }
            Err(e) => Err(e),
        }
    }

    // ============ Coroutines (portable scheduler) ============

    /// Resume a coroutine, transferring `args` as the results of its last
    /// yield (or as its initial arguments). Returns the values it yields or
    /// returns. LIFO nesting: this thread becomes the target's resumer.
    pub fn resume_thread(&mut self, co_value: Value, args: &[Value]) -> ExecResult<Vec<Value>> {
        let Some(co) = co_value.as_thread_id() else {
            return Err(self.type_error(format!("cannot resume a {}", co_value.kind().name())));
        };
        if co == self.current_thread {
            return Err(self.state_error("cannot resume the running thread".into()));
        }

        let state = match self.pool.thread(co) {
            Some(t) => t.state,
            None => return Err(self.value_error("dangling thread".into())),
        };
        match state {
            ThreadState::Initial | ThreadState::Suspended => {}
            s => {
                return Err(self.state_error(format!("cannot resume a {} coroutine", s.name())));
            }
        }

        let prev = self.current_thread;
        if let Some(t) = self.pool.thread_mut(prev) {
            t.state = ThreadState::Waiting;
        }
        {
            let t = self.pool.thread_mut(co).expect("validated above");
            t.resumer = Some(prev);
            t.state = ThreadState::Running;
            t.saved_native_depth = t.native_call_depth;
        }
        self.current_thread = co;

        let setup: ExecResult<()> = if state == ThreadState::Initial {
            // First resume: push the body with the arguments.
            let fid = self.pool.thread(co).and_then(|t| t.coro_func);
            match fid {
                Some(fid) => {
                    if let Some(t) = self.pool.thread_mut(co) {
                        t.set_top(0);
                        t.push(Value::function(fid));
                        for a in args {
                            t.push(*a);
                        }
                    }
                    self.precall(co, 0, args.len(), -1).map(|_| ())
                }
                None => Err(self.state_error("thread has no coroutine body".into())),
            }
        } else {
            // Deliver resume arguments where the yield expects them.
            self.deliver_resume_values(co, args);
            Ok(())
        };

        let run = setup.and_then(|_| self.run_interpreter(co, 0));

        self.current_thread = prev;
        if let Some(t) = self.pool.thread_mut(prev) {
            t.state = ThreadState::Running;
        }

        match run {
            Ok(()) => {
                let results = match self.pool.thread_mut(co) {
                    Some(t) => {
                        t.state = ThreadState::Dead;
                        std::mem::take(&mut t.results)
                    }
                    None => Vec::new(),
                };
                Ok(results)
            }
            Err(ExecError::Yield) => {
                let results = self
                    .pool
                    .thread_mut(co)
                    .map(|t| std::mem::take(&mut t.transfer))
                    .unwrap_or_default();
                Ok(results)
            }
            Err(ExecError::Halt) => {
                // Halt terminates the target thread but not its resumer.
                if let Some(t) = self.pool.thread_mut(co) {
                    t.state = ThreadState::Dead;
                    t.pending_halt = false;
                }
                Ok(Vec::new())
            }
            Err(e) => {
                // Error: the coroutine dies and the error propagates here.
                if let Some(t) = self.pool.thread_mut(co) {
                    t.state = ThreadState::Dead;
                }
                Err(e)
            }
        }
    }

    fn deliver_resume_values(&mut self, co: ThreadId, args: &[Value]) {
        let Some((slot, expected)) = self.pool.thread(co).and_then(|t| t.yield_ret) else {
            return;
        };
        let frame_top = self.frame_working_top(co);
        if let Some(t) = self.pool.thread_mut(co) {
            t.yield_ret = None;
            if expected < 0 {
                for (i, a) in args.iter().enumerate() {
                    t.set(slot + i, *a);
                }
                t.set_top(slot + args.len());
            } else {
                for i in 0..expected as usize {
                    t.set(slot + i, args.get(i).copied().unwrap_or_default());
                }
                if let Some(top) = frame_top {
                    t.set_top(top);
                }
            }
        }
    }

    /// base + stack_size of the thread's top script frame.
    fn frame_working_top(&self, tid: ThreadId) -> Option<usize> {
        let t = self.pool.thread(tid)?;
        let ar = t.current_ar()?;
        let def = self.pool.function(ar.func)?.script_def()?;
        Some(ar.base + self.pool.funcdef(def)?.stack_size as usize)
    }

    // ============ Call protocol ============

    /// Resolve and begin a call: `func_slot` holds the callee, the `nargs`
    /// arguments follow it. Natives run to completion here.
    fn precall(
        &mut self,
        tid: ThreadId,
        func_slot: usize,
        nargs: usize,
        expected: i32,
    ) -> ExecResult<CallKind> {
        let callee = self.get_slot(tid, func_slot);

        match callee.kind() {
            ValueKind::Function => {
                let fid = callee.as_function_id().expect("kind checked");
                if self.pool.function(fid).map(|f| f.is_native()).unwrap_or(false) {
                    self.call_native(tid, fid, func_slot, nargs, expected)?;
                    Ok(CallKind::Done)
                } else {
                    self.push_script_frame(tid, fid, func_slot, nargs, expected, 0)?;
                    Ok(CallKind::Script)
                }
            }
            ValueKind::Class => {
                // Calling a class instantiates it and runs the constructor.
                let cid = callee.as_class_id().expect("kind checked");
                let inst = self.instantiate(cid)?;
                let ctor = self.pool.class(cid).and_then(|c| c.constructor);
                if let Some(ctor) = ctor {
                    let args: Vec<Value> = (0..nargs)
                        .map(|i| self.get_slot(tid, func_slot + 1 + i))
                        .collect();
                    let mut full_args = Vec::with_capacity(nargs + 1);
                    full_args.push(inst);
                    full_args.extend(args);
                    self.call_value(ctor, &full_args, 0)?;
                }
                self.set_slot(tid, func_slot, inst);
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set_top(func_slot + 1);
                }
                self.adjust_results(tid, func_slot, 1, expected);
                Ok(CallKind::Done)
            }
            ValueKind::Thread => {
                // Calling a thread resumes it.
                let args: Vec<Value> = (0..nargs)
                    .map(|i| self.get_slot(tid, func_slot + 1 + i))
                    .collect();
                let results = self.resume_thread(callee, &args)?;
                for (i, r) in results.iter().enumerate() {
                    self.set_slot(tid, func_slot + i, *r);
                }
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set_top(func_slot + results.len());
                }
                self.adjust_results(tid, func_slot, results.len(), expected);
                Ok(CallKind::Done)
            }
            _ => {
                // Anything else needs an opCall metamethod; the callee
                // becomes the first argument.
                let Some(mm) = self.get_metamethod(&callee, MetaName::Call) else {
                    return Err(
                        self.type_error(format!("cannot call a {}", callee.kind().name()))
                    );
                };
                // Shift arguments up one slot to make room for `this`.
                for i in (0..nargs).rev() {
                    let v = self.get_slot(tid, func_slot + 1 + i);
                    self.set_slot(tid, func_slot + 2 + i, v);
                }
                self.set_slot(tid, func_slot, mm);
                self.set_slot(tid, func_slot + 1, callee);
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set_top(func_slot + 2 + nargs);
                }
                self.precall(tid, func_slot, nargs + 1, expected)
            }
        }
    }

    fn call_native(
        &mut self,
        tid: ThreadId,
        fid: FunctionId,
        func_slot: usize,
        nargs: usize,
        expected: i32,
    ) -> ExecResult<()> {
        let func = match self.pool.function(fid) {
            Some(f) => match &f.body {
                FuncBody::Native { func, .. } => *func,
                _ => return Err(self.runtime_error("native call on script function".into())),
            },
            None => return Err(self.value_error("dangling function".into())),
        };

        let base = func_slot + 1;
        let try_base = {
            let t = self.pool.thread_mut(tid).ok_or(ExecError::Fatal)?;
            let saved = t.stack_top;
            let try_base = t.try_records.len();
            t.act_records.push(ActRecord::new_native(
                fid, base, func_slot, saved, expected, try_base,
            ));
            t.set_top(base + nargs);
            t.native_call_depth += 1;
            try_base
        };

        self.fire_hook(tid, HookEvent::Call, 0)?;

        let result = func(self, tid, nargs);

        if let Some(t) = self.pool.thread_mut(tid) {
            t.native_call_depth = t.native_call_depth.saturating_sub(1);
        }

        match result {
            Ok(nresults) => {
                self.fire_hook(tid, HookEvent::Ret, 0)?;
                // Results are the top nresults values of the native window.
                let top = self.top(tid);
                let first = top.saturating_sub(nresults);
                let results: Vec<Value> =
                    (first..top).map(|i| self.get_slot(tid, i)).collect();
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.act_records.pop();
                    t.try_records.truncate(try_base);
                    for (i, r) in results.iter().enumerate() {
                        t.set(func_slot + i, *r);
                    }
                    t.set_top(func_slot + results.len());
                }
                self.adjust_results(tid, func_slot, results.len(), expected);
                Ok(())
            }
            Err(e) => {
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.act_records.pop();
                    t.try_records.truncate(try_base);
                    t.set_top(func_slot);
                }
                Err(e)
            }
        }
    }

    fn push_script_frame(
        &mut self,
        tid: ThreadId,
        fid: FunctionId,
        func_slot: usize,
        nargs: usize,
        expected: i32,
        tailcalls: u32,
    ) -> ExecResult<()> {
        let def_id = match self.pool.function(fid).and_then(|f| f.script_def()) {
            Some(d) => d,
            None => return Err(self.value_error("dangling function".into())),
        };
        let (num_params, is_vararg, stack_size, masks_ok_index) = {
            let def = self
                .pool
                .funcdef(def_id)
                .ok_or(ExecError::Fatal)?;
            // Parameter type masks gate the call before any code runs.
            // Absent arguments are null.
            let mut bad: Option<(usize, ValueKind)> = None;
            for i in 0..(def.num_params as usize) {
                let v = if i < nargs {
                    self.pool
                        .thread(tid)
                        .map(|t| t.get(func_slot + 1 + i))
                        .unwrap_or_default()
                } else {
                    Value::null()
                };
                let mask = def.param_masks.get(i).copied().unwrap_or(TYPE_MASK_ANY);
                if mask & v.kind().mask_bit() == 0 {
                    bad = Some((i, v.kind()));
                    break;
                }
            }
            (def.num_params as usize, def.is_vararg, def.stack_size as usize, bad)
        };
        if let Some((i, kind)) = masks_ok_index {
            return Err(self.type_error(format!(
                "parameter {} does not accept a {}",
                i,
                kind.name()
            )));
        }

        let args: Vec<Value> = (0..nargs)
            .map(|i| self.get_slot(tid, func_slot + 1 + i))
            .collect();

        let (base, vararg_base, num_varargs) = if is_vararg && nargs > num_params {
            // Varargs live below the frame base: [func][extras...][params...]
            let extras = nargs - num_params;
            let vararg_base = func_slot + 1;
            let base = vararg_base + extras;
            if let Some(t) = self.pool.thread_mut(tid) {
                for (i, v) in args[num_params..].iter().enumerate() {
                    t.set(vararg_base + i, *v);
                }
                for i in 0..num_params {
                    t.set(base + i, args[i]);
                }
            }
            (base, vararg_base, extras)
        } else {
            let base = func_slot + 1;
            if let Some(t) = self.pool.thread_mut(tid) {
                for i in 0..num_params {
                    t.set(base + i, args.get(i).copied().unwrap_or_default());
                }
            }
            (base, func_slot + 1, 0)
        };

        if let Some(t) = self.pool.thread_mut(tid) {
            let saved_top = func_slot;
            let try_base = t.try_records.len();
            let mut ar =
                ActRecord::new_script(fid, base, func_slot, saved_top, expected, try_base);
            ar.vararg_base = vararg_base;
            ar.num_varargs = num_varargs;
            ar.num_tailcalls = tailcalls;
            t.act_records.push(ar);
            t.set_top(base + stack_size);
        }

        self.fire_hook(tid, HookEvent::Call, 0)?;
        Ok(())
    }

    /// Complete a return: copy results into the caller's expected window and
    /// pop the frame.
    fn postcall(&mut self, tid: ThreadId, results: Vec<Value>) -> ExecResult<bool> {
        self.fire_hook(tid, HookEvent::Ret, 0)?;

        let Some(ar) = self
            .pool
            .thread_mut(tid)
            .and_then(|t| t.act_records.pop())
        else {
            return Err(self.runtime_error("return with no activation record".into()));
        };

        self.close_upvalues(tid, ar.base);
        if let Some(t) = self.pool.thread_mut(tid) {
            t.try_records.truncate(ar.try_base);
        }

        let n = if ar.expected_results < 0 {
            results.len()
        } else {
            ar.expected_results as usize
        };
        if let Some(t) = self.pool.thread_mut(tid) {
            for i in 0..n {
                t.set(ar.ret_slot + i, results.get(i).copied().unwrap_or_default());
            }
            t.set_top(ar.ret_slot + n);
        }

        let done = self
            .pool
            .thread(tid)
            .map(|t| t.act_records.is_empty())
            .unwrap_or(true);
        if done {
            if let Some(t) = self.pool.thread_mut(tid) {
                t.results = results;
                if t.coro_func.is_some() {
                    t.state = ThreadState::Dead;
                }
            }
        }
        Ok(done)
    }

    /// Pad or truncate call results to the caller's expectation.
    fn adjust_results(&mut self, tid: ThreadId, first: usize, got: usize, expected: i32) {
        if expected < 0 {
            return;
        }
        let want = expected as usize;
        if let Some(t) = self.pool.thread_mut(tid) {
            for i in got..want {
                t.set(first + i, Value::null());
            }
            if want < got || want > got {
                t.set_top(first + want);
            }
        }
    }

    // ============ Upvalues ============

    pub(crate) fn find_or_create_upvalue(&mut self, tid: ThreadId, index: usize) -> UpvalueId {
        let existing = self.pool.thread(tid).and_then(|t| {
            t.open_upvalues
                .iter()
                .copied()
                .find(|&u| self.pool.upvalue(u).and_then(|uv| uv.stack_index()) == Some(index))
        });
        if let Some(u) = existing {
            return u;
        }
        let id = self
            .pool
            .create_upvalue(&mut self.gc, crate::gc::CrocUpvalue::open(tid, index));
        // Keep the list sorted by stack index.
        let pos = self
            .pool
            .thread(tid)
            .map(|t| {
                t.open_upvalues
                    .iter()
                    .position(|&u| {
                        self_stack_index_of(&self.pool, u)
                            .map(|i| i > index)
                            .unwrap_or(true)
                    })
                    .unwrap_or(t.open_upvalues.len())
            })
            .unwrap_or(0);
        if let Some(t) = self.pool.thread_mut(tid) {
            t.open_upvalues.insert(pos, id);
        }
        id
    }

    /// Close every open upvalue at or above `level`, in index order.
    pub(crate) fn close_upvalues(&mut self, tid: ThreadId, level: usize) {
        let to_close: Vec<UpvalueId> = self
            .pool
            .thread(tid)
            .map(|t| {
                t.open_upvalues
                    .iter()
                    .copied()
                    .filter(|&u| {
                        self_stack_index_of(&self.pool, u)
                            .map(|i| i >= level)
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for u in to_close {
            let value = self
                .pool
                .upvalue(u)
                .and_then(|uv| uv.stack_index())
                .map(|i| self.get_slot(tid, i))
                .unwrap_or_default();
            if let Some(uv) = self.pool.upvalue_mut(u) {
                uv.close(value);
            }
            if let Some(t) = self.pool.thread_mut(tid) {
                t.open_upvalues.retain(|&x| x != u);
            }
        }
    }

    pub(crate) fn upvalue_get(&self, tid: ThreadId, u: UpvalueId) -> Value {
        match self.pool.upvalue(u) {
            Some(uv) => match uv.state {
                crate::gc::UpvalueState::Open { thread, index } => self
                    .pool
                    .thread(thread)
                    .map(|t| t.get(index))
                    .unwrap_or_default(),
                crate::gc::UpvalueState::Closed(v) => v,
            },
            None => {
                let _ = tid;
                Value::null()
            }
        }
    }

    pub(crate) fn upvalue_set(&mut self, u: UpvalueId, value: Value) {
        let open_slot = self.pool.upvalue(u).and_then(|uv| match uv.state {
            crate::gc::UpvalueState::Open { thread, index } => Some((thread, index)),
            _ => None,
        });
        match open_slot {
            Some((thread, index)) => {
                if let Some(t) = self.pool.thread_mut(thread) {
                    t.set(index, value);
                }
            }
            None => {
                if let Some(uv) = self.pool.upvalue_mut(u) {
                    uv.close(value);
                }
                self.gc.barrier_back(GcId::Upvalue(u), &mut self.pool);
            }
        }
    }

    // ============ Hooks ============

    fn fire_hook(&mut self, tid: ThreadId, event: HookEvent, line: u32) -> ExecResult<()> {
        let (func, fire) = match self.pool.thread(tid) {
            Some(t) => {
                let h = &t.hook;
                (
                    h.func,
                    !h.in_hook && !h.func.is_null() && (h.mask & event.mask_bit()) != 0,
                )
            }
            None => (Value::null(), false),
        };
        if !fire {
            return Ok(());
        }
        if let Some(t) = self.pool.thread_mut(tid) {
            t.hook.in_hook = true;
        }
        let ev = self.new_string(event.name());
        let r = self.call_value(func, &[ev, Value::int(line as i64)], 0);
        if let Some(t) = self.pool.thread_mut(tid) {
            t.hook.in_hook = false;
        }
        r.map(|_| ())
    }

    // ============ Unwinding ============

    /// Pop frames above `depth` without running handlers (used when a signal
    /// crosses a host call boundary).
    fn unwind_to_depth(&mut self, tid: ThreadId, depth: usize) {
        loop {
            let Some(ar) = self.pool.thread(tid).and_then(|t| {
                if t.act_records.len() > depth {
                    t.act_records.last().cloned()
                } else {
                    None
                }
            }) else {
                return;
            };
            self.close_upvalues(tid, ar.base);
            if let Some(t) = self.pool.thread_mut(tid) {
                t.act_records.pop();
                t.try_records.truncate(ar.try_base);
                t.set_top(ar.ret_slot);
            }
        }
    }

    /// Walk the handler stack for an in-flight exception or halt. Returns
    /// true when a handler took over (pc updated); Err when the signal
    /// escapes this interpreter invocation.
    fn unwind(&mut self, tid: ThreadId, err: ExecError, min_depth: usize) -> ExecResult<bool> {
        let catchable = err == ExecError::Exception;
        if !matches!(err, ExecError::Exception | ExecError::Halt) {
            return Err(err);
        }

        loop {
            let depth = self
                .pool
                .thread(tid)
                .map(|t| t.act_records.len())
                .unwrap_or(0);
            if depth == 0 || depth <= min_depth {
                return Err(err);
            }
            let ar_index = depth - 1;

            let record = self.pool.thread(tid).and_then(|t| {
                t.try_records
                    .last()
                    .copied()
                    .filter(|tr| tr.act_record == ar_index)
            });

            match record {
                Some(tr) => {
                    if let Some(t) = self.pool.thread_mut(tid) {
                        t.try_records.pop();
                    }
                    if tr.is_catch && catchable {
                        let exc = self.exception;
                        self.exception = Value::null();
                        self.is_unwinding = false;
                        if let Some(t) = self.pool.thread_mut(tid) {
                            t.set(tr.slot, exc);
                            if let Some(ar) = t.act_records.last_mut() {
                                ar.pc = tr.pc;
                            }
                        }
                        return Ok(true);
                    }
                    if !tr.is_catch {
                        // Enter the finally; EndFinally re-raises afterwards.
                        if let Some(t) = self.pool.thread_mut(tid) {
                            if let Some(ar) = t.act_records.last_mut() {
                                ar.pc = tr.pc;
                            }
                        }
                        return Ok(true);
                    }
                    // catch record skipped by an uncatchable halt
                    continue;
                }
                None => {
                    // No handler in this frame: tear it down.
                    let ar = self
                        .pool
                        .thread(tid)
                        .and_then(|t| t.act_records.last().cloned());
                    let Some(ar) = ar else { return Err(err) };
                    self.close_upvalues(tid, ar.base);
                    if let Some(t) = self.pool.thread_mut(tid) {
                        t.act_records.pop();
                        t.try_records.truncate(ar.try_base);
                        t.set_top(ar.ret_slot);
                    }
                }
            }
        }
    }

    // ============ The dispatch loop ============

    /// Execute the thread's top frame until the frame stack shrinks back to
    /// `min_depth`. Yields and fatal errors propagate to the caller.
    fn run_interpreter(&mut self, tid: ThreadId, min_depth: usize) -> ExecResult<()> {
        loop {
            let depth = self
                .pool
                .thread(tid)
                .map(|t| t.act_records.len())
                .unwrap_or(0);
            if depth <= min_depth {
                return Ok(());
            }

            match self.dispatch_one(tid) {
                Ok(()) => {}
                Err(e) => {
                    if self.unwind(tid, e, min_depth)? {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Fetch and execute one instruction of the thread's top frame.
    fn dispatch_one(&mut self, tid: ThreadId) -> ExecResult<()> {
        // Frame snapshot.
        let (fid, base, pc) = {
            let t = self.pool.thread(tid).ok_or(ExecError::Fatal)?;
            let ar = t.current_ar().ok_or(ExecError::Fatal)?;
            (ar.func, ar.base, ar.pc)
        };
        let def_id = self
            .pool
            .function(fid)
            .and_then(|f| f.script_def())
            .ok_or(ExecError::Fatal)?;
        let (instr, line) = {
            let def = self.pool.funcdef(def_id).ok_or(ExecError::Fatal)?;
            let Some(&word) = def.code.get(pc) else {
                return Err(self.runtime_error("program counter ran off the end".into()));
            };
            (Instruction(word), def.line_at(pc))
        };

        // Advance pc before executing; jumps are relative to the next
        // instruction.
        if let Some(t) = self.pool.thread_mut(tid) {
            if let Some(ar) = t.current_ar_mut() {
                ar.pc = pc + 1;
            }
        }

        // Periodic duties: delay hook, line hook, GC safe point.
        self.per_instruction_duties(tid, def_id, pc, line)?;

        let a = instr.a();
        let ra = base + a;

        macro_rules! reg {
            ($i:expr) => {
                self.get_slot(tid, base + $i)
            };
        }
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {
                self.set_slot(tid, base + $i, $v)
            };
        }
        macro_rules! konst {
            ($i:expr) => {
                self.pool
                    .funcdef(def_id)
                    .and_then(|d| d.constants.get($i).copied())
                    .unwrap_or_default()
            };
        }
        macro_rules! rk {
            ($i:expr, $k:expr) => {
                if $k {
                    konst!($i)
                } else {
                    reg!($i)
                }
            };
        }

        match instr.op() {
            OpCode::Move => {
                let v = reg!(instr.b());
                set_reg!(a, v);
            }
            OpCode::LoadK => {
                let v = konst!(instr.bx());
                set_reg!(a, v);
            }
            OpCode::LoadBool => {
                set_reg!(a, Value::bool(instr.k()));
            }
            OpCode::LoadNull => {
                for i in 0..instr.b().max(1) {
                    set_reg!(a + i, Value::null());
                }
            }
            OpCode::NewGlobal => {
                let name = konst!(instr.bx());
                let v = reg!(a);
                self.op_new_global(fid, name, v)?;
            }
            OpCode::GetGlobal => {
                let name = konst!(instr.bx());
                let v = self.op_get_global(fid, name)?;
                set_reg!(a, v);
            }
            OpCode::SetGlobal => {
                let name = konst!(instr.bx());
                let v = reg!(a);
                self.op_set_global(fid, name, v)?;
            }
            OpCode::GetUpval => {
                let v = self.op_get_upval(tid, fid, instr.b())?;
                set_reg!(a, v);
            }
            OpCode::SetUpval => {
                let v = reg!(a);
                self.op_set_upval(fid, instr.b(), v)?;
            }
            OpCode::Field => {
                let obj = reg!(instr.b());
                let name = konst!(instr.c());
                let v = field_get(self, obj, name)?;
                set_reg!(a, v);
            }
            OpCode::FieldAssign => {
                let obj = reg!(a);
                let name = konst!(instr.b());
                let v = reg!(instr.c());
                field_set(self, obj, name, v)?;
            }
            OpCode::Method => {
                let obj = reg!(instr.b());
                let name = konst!(instr.c());
                let m = method_of(self, obj, name)?;
                set_reg!(a, m);
                set_reg!(a + 1, obj);
            }
            OpCode::Index => {
                let container = reg!(instr.b());
                let key = rk!(instr.c(), instr.k());
                let v = index_get(self, container, key)?;
                set_reg!(a, v);
            }
            OpCode::IndexAssign => {
                let container = reg!(a);
                let key = reg!(instr.b());
                let v = rk!(instr.c(), instr.k());
                index_set(self, container, key, v)?;
            }
            OpCode::Slice => {
                let b = instr.b();
                let container = reg!(b);
                let lo = reg!(b + 1);
                let hi = reg!(b + 2);
                let v = slice_get(self, container, lo, hi)?;
                set_reg!(a, v);
            }
            OpCode::SliceAssign => {
                let container = reg!(a);
                let lo = reg!(a + 1);
                let hi = reg!(a + 2);
                let v = reg!(instr.b());
                slice_set(self, container, lo, hi, v)?;
            }
            OpCode::NewTable => {
                let v = self.new_table();
                set_reg!(a, v);
            }
            OpCode::NewArray => {
                let n = instr.b();
                let values: Vec<Value> = (0..n).map(|i| reg!(a + i)).collect();
                let v = self.new_array_from(values);
                set_reg!(a, v);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                let lhs = reg!(instr.b());
                let rhs = rk!(instr.c(), instr.k());
                let op = ArithOp::from_opcode(instr.op());
                let v = arith_binary(self, op, lhs, rhs)?;
                set_reg!(a, v);
            }
            OpCode::Neg => {
                let operand = reg!(instr.b());
                let v = arith_unary(self, MetaName::Neg, operand)?;
                set_reg!(a, v);
            }
            OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr | OpCode::UShr => {
                let lhs = reg!(instr.b());
                let rhs = rk!(instr.c(), instr.k());
                let op = ArithOp::from_opcode(instr.op());
                let v = arith_binary(self, op, lhs, rhs)?;
                set_reg!(a, v);
            }
            OpCode::BNot => {
                let operand = reg!(instr.b());
                let v = arith_unary(self, MetaName::Com, operand)?;
                set_reg!(a, v);
            }
            OpCode::Not => {
                let v = reg!(instr.b());
                set_reg!(a, Value::bool(v.is_falsy()));
            }
            OpCode::Cmp3 => {
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                let ord = cmp_values(self, lhs, rhs)?;
                set_reg!(a, Value::int(ord as i64));
            }
            OpCode::JmpEq => {
                // Value types compare by bits (IEEE for floats), reference
                // types strictly by identity; no metamethod is consulted.
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                self.conditional_jump(tid, def_id, lhs.raw_equal(&rhs) == instr.k())?;
            }
            OpCode::JmpLt => {
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                let ord = cmp_values(self, lhs, rhs)?;
                self.conditional_jump(tid, def_id, (ord < 0) == instr.k())?;
            }
            OpCode::JmpLe => {
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                let ord = cmp_values(self, lhs, rhs)?;
                self.conditional_jump(tid, def_id, (ord <= 0) == instr.k())?;
            }
            OpCode::JmpIs => {
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                self.conditional_jump(tid, def_id, lhs.is_identical(&rhs) == instr.k())?;
            }
            OpCode::JmpIn => {
                let (lhs, rhs) = (reg!(instr.b()), reg!(instr.c()));
                let found = in_values(self, lhs, rhs)?;
                self.conditional_jump(tid, def_id, found == instr.k())?;
            }
            OpCode::Test => {
                let truthy = reg!(a).is_truthy();
                self.conditional_jump(tid, def_id, truthy == instr.k())?;
            }
            OpCode::Jmp => {
                self.do_jump(tid, instr.sbx())?;
            }
            OpCode::Switch => {
                let v = reg!(a);
                let offset = self
                    .pool
                    .funcdef(def_id)
                    .and_then(|d| d.switch_tables.get(instr.bx()))
                    .map(|st| st.lookup(&v))
                    .unwrap_or(0);
                self.do_jump(tid, offset)?;
            }
            OpCode::ForPrep => {
                self.op_for_prep(tid, base, a)?;
                self.do_jump(tid, instr.sbx())?;
            }
            OpCode::ForLoop => {
                if self.op_for_loop(tid, base, a)? {
                    self.do_jump(tid, instr.sbx())?;
                }
            }
            OpCode::ForeachCall => {
                let c = instr.c();
                self.op_foreach_call(tid, base, a, c as i32)?;
            }
            OpCode::ForeachLoop => {
                let control = reg!(a + 3);
                if !control.is_null() {
                    set_reg!(a + 2, control);
                    self.do_jump(tid, instr.sbx())?;
                }
            }
            OpCode::Call => {
                self.check_halt(tid)?;
                let b = instr.b();
                let nargs = if b == 0 {
                    self.top(tid).saturating_sub(ra + 1)
                } else {
                    b - 1
                };
                let expected = instr.c() as i32 - 1;
                self.precall(tid, ra, nargs, expected)?;
                self.run_pending_finalizers()?;
            }
            OpCode::TailCall => {
                self.check_halt(tid)?;
                self.fire_hook(tid, HookEvent::TailRet, line)?;
                let b = instr.b();
                let nargs = if b == 0 {
                    self.top(tid).saturating_sub(ra + 1)
                } else {
                    b - 1
                };
                self.op_tailcall(tid, ra, nargs)?;
            }
            OpCode::Ret => {
                self.check_halt(tid)?;
                let b = instr.b();
                let n = if b == 0 {
                    self.top(tid).saturating_sub(ra)
                } else {
                    b - 1
                };
                let results: Vec<Value> = (0..n).map(|i| reg!(a + i)).collect();
                self.postcall(tid, results)?;
                self.run_pending_finalizers()?;
            }
            OpCode::Vararg => {
                let (vbase, vnum) = {
                    let t = self.pool.thread(tid).ok_or(ExecError::Fatal)?;
                    let ar = t.current_ar().ok_or(ExecError::Fatal)?;
                    (ar.vararg_base, ar.num_varargs)
                };
                let b = instr.b();
                let want = if b == 0 { vnum } else { b - 1 };
                for i in 0..want {
                    let v = if i < vnum {
                        self.get_slot(tid, vbase + i)
                    } else {
                        Value::null()
                    };
                    set_reg!(a + i, v);
                }
                if b == 0 {
                    if let Some(t) = self.pool.thread_mut(tid) {
                        t.set_top(ra + want);
                    }
                }
            }
            OpCode::Closure => {
                let v = self.op_closure(tid, fid, def_id, base, instr.bx())?;
                set_reg!(a, v);
            }
            OpCode::CloseUpvals => {
                self.close_upvalues(tid, ra);
            }
            OpCode::Cat => {
                let b = instr.b();
                let n = instr.c();
                let parts: Vec<Value> = (0..n).map(|i| reg!(b + i)).collect();
                let v = cat_values(self, &parts)?;
                set_reg!(a, v);
            }
            OpCode::PushCatch => {
                let handler = (pc as i64 + 1 + instr.sbx() as i64) as usize;
                self.push_try_record(tid, true, ra, handler)?;
            }
            OpCode::PushFinally => {
                let handler = (pc as i64 + 1 + instr.sbx() as i64) as usize;
                self.push_try_record(tid, false, ra, handler)?;
            }
            OpCode::PopHandler => {
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.try_records.pop();
                }
            }
            OpCode::EndFinally => {
                if self.is_unwinding {
                    return Err(ExecError::Exception);
                }
                let halting = self
                    .pool
                    .thread(tid)
                    .map(|t| t.pending_halt)
                    .unwrap_or(false);
                if halting {
                    return Err(ExecError::Halt);
                }
            }
            OpCode::Throw => {
                let v = reg!(a);
                return Err(self.throw_value(v));
            }
            OpCode::Yield => {
                let b = instr.b();
                let n = if b == 0 {
                    self.top(tid).saturating_sub(ra)
                } else {
                    b - 1
                };
                let expected = instr.c() as i32 - 1;
                return self.op_yield(tid, ra, n, expected);
            }
        }

        Ok(())
    }

    // ============ Opcode helpers ============

    fn per_instruction_duties(
        &mut self,
        tid: ThreadId,
        def_id: FuncDefId,
        pc: usize,
        line: u32,
    ) -> ExecResult<()> {
        // Delay hook.
        let delay_due = {
            match self.pool.thread_mut(tid) {
                Some(t) if t.hook.delay > 0 && (t.hook.mask & hook_bits::DELAY) != 0 => {
                    if t.hook.counter <= 1 {
                        t.hook.counter = t.hook.delay;
                        true
                    } else {
                        t.hook.counter -= 1;
                        false
                    }
                }
                _ => false,
            }
        };
        if delay_due {
            self.fire_hook(tid, HookEvent::Delay, line)?;
        }

        // Line hook fires when the source line changes.
        let line_due = {
            let prev = self
                .pool
                .funcdef(def_id)
                .map(|d| d.line_at(pc.wrapping_sub(1)))
                .unwrap_or(0);
            pc == 0 || line != prev
        };
        if line_due {
            self.fire_hook(tid, HookEvent::Line, line)?;
        }

        // GC safe point.
        self.gc_check_counter += 1;
        if self.gc_check_counter >= self.options.gc_check_interval {
            self.gc_check_counter = 0;
            self.maybe_gc_step()?;
        }
        Ok(())
    }

    /// Halt is honored at calls, returns and back-branches.
    fn check_halt(&mut self, tid: ThreadId) -> ExecResult<()> {
        let halting = self
            .pool
            .thread(tid)
            .map(|t| t.pending_halt)
            .unwrap_or(false);
        if halting {
            Err(ExecError::Halt)
        } else {
            Ok(())
        }
    }

    fn do_jump(&mut self, tid: ThreadId, offset: i32) -> ExecResult<()> {
        if offset < 0 {
            self.check_halt(tid)?;
        }
        if let Some(t) = self.pool.thread_mut(tid) {
            if let Some(ar) = t.current_ar_mut() {
                ar.pc = (ar.pc as i64 + offset as i64) as usize;
            }
        }
        Ok(())
    }

    /// The Jmp that must follow a conditional test: run it or skip it.
    fn conditional_jump(&mut self, tid: ThreadId, def_id: FuncDefId, take: bool) -> ExecResult<()> {
        if take {
            // Execute the following Jmp now.
            let (pc, word) = {
                let t = self.pool.thread(tid).ok_or(ExecError::Fatal)?;
                let ar = t.current_ar().ok_or(ExecError::Fatal)?;
                let def = self.pool.funcdef(def_id).ok_or(ExecError::Fatal)?;
                (ar.pc, def.code.get(ar.pc).copied())
            };
            let Some(word) = word else {
                return Err(self.runtime_error("conditional with no jump target".into()));
            };
            let jmp = Instruction(word);
            if jmp.op() != OpCode::Jmp {
                return Err(self.runtime_error("conditional not followed by a jump".into()));
            }
            if let Some(t) = self.pool.thread_mut(tid) {
                if let Some(ar) = t.current_ar_mut() {
                    ar.pc = pc + 1;
                }
            }
            self.do_jump(tid, jmp.sbx())
        } else {
            // Skip the following Jmp.
            if let Some(t) = self.pool.thread_mut(tid) {
                if let Some(ar) = t.current_ar_mut() {
                    ar.pc += 1;
                }
            }
            Ok(())
        }
    }

    fn push_try_record(
        &mut self,
        tid: ThreadId,
        is_catch: bool,
        slot: usize,
        pc: usize,
    ) -> ExecResult<()> {
        if let Some(t) = self.pool.thread_mut(tid) {
            let ar_index = t.act_records.len().saturating_sub(1);
            t.try_records.push(TryRecord {
                is_catch,
                slot,
                act_record: ar_index,
                pc,
            });
        }
        Ok(())
    }

    fn op_yield(&mut self, tid: ThreadId, first: usize, n: usize, expected: i32) -> ExecResult<()> {
        let (is_coro, yield_allowed, native_depth, saved_depth) = match self.pool.thread(tid) {
            Some(t) => (
                t.coro_func.is_some(),
                t.yield_allowed,
                t.native_call_depth,
                t.saved_native_depth,
            ),
            None => return Err(ExecError::Fatal),
        };
        if !is_coro {
            return Err(self.state_error("cannot yield the main thread".into()));
        }
        if !yield_allowed {
            return Err(self.state_error("cannot yield inside serialization".into()));
        }
        if native_depth > saved_depth {
            return Err(self.state_error("cannot yield across a native frame".into()));
        }

        let values: Vec<Value> = (0..n).map(|i| self.get_slot(tid, first + i)).collect();
        if let Some(t) = self.pool.thread_mut(tid) {
            t.transfer = values;
            t.yield_ret = Some((first, expected));
            t.state = ThreadState::Suspended;
            t.num_yields += 1;
        }
        Err(ExecError::Yield)
    }

    fn op_tailcall(&mut self, tid: ThreadId, func_slot: usize, nargs: usize) -> ExecResult<()> {
        // Capture the callee and arguments, then replace the current frame.
        let func = self.get_slot(tid, func_slot);
        let args: Vec<Value> = (0..nargs)
            .map(|i| self.get_slot(tid, func_slot + 1 + i))
            .collect();

        let ar = self
            .pool
            .thread(tid)
            .and_then(|t| t.act_records.last().cloned())
            .ok_or(ExecError::Fatal)?;
        self.close_upvalues(tid, ar.base);
        if let Some(t) = self.pool.thread_mut(tid) {
            t.act_records.pop();
            t.try_records.truncate(ar.try_base);
        }

        let new_slot = ar.ret_slot;
        if let Some(t) = self.pool.thread_mut(tid) {
            t.set(new_slot, func);
            for (i, v) in args.iter().enumerate() {
                t.set(new_slot + 1 + i, *v);
            }
            t.set_top(new_slot + 1 + args.len());
        }

        // A native or non-function callee completes immediately, which ends
        // this frame's story exactly like a return.
        match self.resolve_tail_callee(tid, new_slot, nargs, &ar)? {
            CallKind::Done => {
                // If that was the thread's last frame, the results are its
                // final results.
                let empty = self
                    .pool
                    .thread(tid)
                    .map(|t| t.act_records.is_empty())
                    .unwrap_or(false);
                if empty {
                    let top = self.top(tid);
                    let results: Vec<Value> =
                        (new_slot..top).map(|i| self.get_slot(tid, i)).collect();
                    if let Some(t) = self.pool.thread_mut(tid) {
                        t.results = results;
                        if t.coro_func.is_some() {
                            t.state = ThreadState::Dead;
                        }
                    }
                }
                Ok(())
            }
            CallKind::Script => {
                if let Some(t) = self.pool.thread_mut(tid) {
                    if let Some(new_ar) = t.act_records.last_mut() {
                        new_ar.num_tailcalls = ar.num_tailcalls + 1;
                        new_ar.saved_top = ar.saved_top;
                    }
                }
                Ok(())
            }
        }
    }

    fn resolve_tail_callee(
        &mut self,
        tid: ThreadId,
        func_slot: usize,
        nargs: usize,
        old: &ActRecord,
    ) -> ExecResult<CallKind> {
        let callee = self.get_slot(tid, func_slot);
        if callee.is_function() {
            let fid = callee.as_function_id().expect("kind checked");
            if self.pool.function(fid).map(|f| f.is_native()).unwrap_or(false) {
                self.call_native(tid, fid, func_slot, nargs, old.expected_results)?;
                return Ok(CallKind::Done);
            }
            self.push_script_frame(
                tid,
                fid,
                func_slot,
                nargs,
                old.expected_results,
                old.num_tailcalls + 1,
            )?;
            return Ok(CallKind::Script);
        }
        self.precall(tid, func_slot, nargs, old.expected_results)
    }

    fn op_for_prep(&mut self, tid: ThreadId, base: usize, a: usize) -> ExecResult<()> {
        let idx = self.get_slot(tid, base + a);
        let limit = self.get_slot(tid, base + a + 1);
        let step = self.get_slot(tid, base + a + 2);

        for (name, v) in [("index", idx), ("limit", limit), ("step", step)] {
            if !v.is_number() {
                return Err(self.type_error(format!(
                    "numeric for {} must be int or float, not {}",
                    name,
                    v.kind().name()
                )));
            }
        }
        if step.as_int() == Some(0) || step.as_float() == Some(0.0) {
            return Err(self.value_error("numeric for step is zero".into()));
        }

        // All-int stays int; otherwise everything promotes to float.
        let all_int = idx.is_int() && limit.is_int() && step.is_int();
        let (idx, limit, step) = if all_int {
            (idx, limit, step)
        } else {
            (
                Value::float(idx.as_number().expect("checked")),
                Value::float(limit.as_number().expect("checked")),
                Value::float(step.as_number().expect("checked")),
            )
        };

        // Pre-decrement so the first ForLoop lands on the start value.
        let started = if all_int {
            Value::int(
                idx.as_int()
                    .expect("int")
                    .wrapping_sub(step.as_int().expect("int")),
            )
        } else {
            Value::float(idx.as_float().expect("float") - step.as_float().expect("float"))
        };

        if let Some(t) = self.pool.thread_mut(tid) {
            t.set(base + a, started);
            t.set(base + a + 1, limit);
            t.set(base + a + 2, step);
        }
        Ok(())
    }

    /// Advance the loop; true means take the back-jump. The bound is
    /// exclusive.
    fn op_for_loop(&mut self, tid: ThreadId, base: usize, a: usize) -> ExecResult<bool> {
        let idx = self.get_slot(tid, base + a);
        let limit = self.get_slot(tid, base + a + 1);
        let step = self.get_slot(tid, base + a + 2);

        if idx.is_int() {
            let next = idx.as_int().expect("int").wrapping_add(step.as_int().unwrap_or(1));
            let lim = limit.as_int().unwrap_or(0);
            let cont = if step.as_int().unwrap_or(1) > 0 {
                next < lim
            } else {
                next > lim
            };
            if cont {
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set(base + a, Value::int(next));
                    t.set(base + a + 3, Value::int(next));
                }
            }
            Ok(cont)
        } else {
            let next = idx.as_float().unwrap_or(0.0) + step.as_float().unwrap_or(1.0);
            let lim = limit.as_float().unwrap_or(0.0);
            let cont = if step.as_float().unwrap_or(1.0) > 0.0 {
                next < lim
            } else {
                next > lim
            };
            if cont {
                if let Some(t) = self.pool.thread_mut(tid) {
                    t.set(base + a, Value::float(next));
                    t.set(base + a + 3, Value::float(next));
                }
            }
            Ok(cont)
        }
    }

    fn op_foreach_call(&mut self, tid: ThreadId, base: usize, a: usize, c: i32) -> ExecResult<()> {
        let iter = self.get_slot(tid, base + a);

        // Non-callable containers provide their iterator through opApply.
        if !iter.is_function() && !iter.is_thread() {
            let Some(mm) = self.get_metamethod(&iter, MetaName::Apply) else {
                return Err(self.type_error(format!(
                    "cannot iterate a {} without opApply",
                    iter.kind().name()
                )));
            };
            let state = self.get_slot(tid, base + a + 1);
            let triple = self.call_value(mm, &[iter, state], 3)?;
            if let Some(t) = self.pool.thread_mut(tid) {
                for i in 0..3 {
                    t.set(base + a + i, triple.get(i).copied().unwrap_or_default());
                }
            }
        }

        let func_slot = base + a + 3;
        let (f, s, ctl) = (
            self.get_slot(tid, base + a),
            self.get_slot(tid, base + a + 1),
            self.get_slot(tid, base + a + 2),
        );
        if let Some(t) = self.pool.thread_mut(tid) {
            t.set(func_slot, f);
            t.set(func_slot + 1, s);
            t.set(func_slot + 2, ctl);
            t.set_top(func_slot + 3);
        }
        self.precall(tid, func_slot, 2, c)?;
        Ok(())
    }

    fn op_closure(
        &mut self,
        tid: ThreadId,
        fid: FunctionId,
        def_id: FuncDefId,
        base: usize,
        inner_index: usize,
    ) -> ExecResult<Value> {
        let inner = self
            .pool
            .funcdef(def_id)
            .and_then(|d| d.inner_defs.get(inner_index).copied())
            .ok_or_else(|| self.runtime_error("closure of unknown inner funcdef".into()))?;

        let (cacheable, cached, name, num_params, descs) = {
            let def = self.pool.funcdef(inner).ok_or(ExecError::Fatal)?;
            (
                def.cacheable,
                def.cached_func,
                def.name,
                def.num_params,
                def.upvals.clone(),
            )
        };
        if let Some(f) = cached {
            return Ok(Value::function(f));
        }

        let env = self
            .pool
            .function(fid)
            .map(|f| f.env)
            .ok_or(ExecError::Fatal)?;

        let mut upvals = Vec::with_capacity(descs.len());
        for d in &descs {
            match *d {
                UpvalDesc::Local(slot) => {
                    upvals.push(self.find_or_create_upvalue(tid, base + slot as usize));
                }
                UpvalDesc::Upval(i) => {
                    let u = self
                        .pool
                        .function(fid)
                        .and_then(|f| match &f.body {
                            FuncBody::Script { upvals, .. } => upvals.get(i as usize).copied(),
                            _ => None,
                        })
                        .ok_or_else(|| {
                            self.runtime_error("closure captures a missing upvalue".into())
                        })?;
                    upvals.push(u);
                }
            }
        }

        let func = CrocFunction::script(name, env, num_params, inner, upvals);
        let new_fid = self.pool.create_function(&mut self.gc, func);
        if cacheable {
            if let Some(def) = self.pool.funcdef_mut(inner) {
                def.cached_func = Some(new_fid);
            }
        }
        Ok(Value::function(new_fid))
    }

    fn op_get_upval(&mut self, tid: ThreadId, fid: FunctionId, index: usize) -> ExecResult<Value> {
        let u = self
            .pool
            .function(fid)
            .and_then(|f| match &f.body {
                FuncBody::Script { upvals, .. } => upvals.get(index).copied(),
                _ => None,
            })
            .ok_or_else(|| self.runtime_error(format!("no upvalue {}", index)))?;
        Ok(self.upvalue_get(tid, u))
    }

    fn op_set_upval(&mut self, fid: FunctionId, index: usize, value: Value) -> ExecResult<()> {
        let u = self
            .pool
            .function(fid)
            .and_then(|f| match &f.body {
                FuncBody::Script { upvals, .. } => upvals.get(index).copied(),
                _ => None,
            })
            .ok_or_else(|| self.runtime_error(format!("no upvalue {}", index)))?;
        self.upvalue_set(u, value);
        Ok(())
    }

    // ============ Globals through the environment chain ============

    fn env_of(&self, fid: FunctionId) -> Option<NamespaceId> {
        self.pool.function(fid).map(|f| f.env)
    }

    fn op_new_global(&mut self, fid: FunctionId, name: Value, value: Value) -> ExecResult<()> {
        let Some(key) = name.as_string_id() else {
            return Err(self.type_error("global name must be a string".into()));
        };
        let env = self.env_of(fid).ok_or(ExecError::Fatal)?;
        let exists = self
            .pool
            .namespace(env)
            .map(|ns| ns.contains(key))
            .unwrap_or(false);
        if exists {
            let n = self.pool.str_of(key).to_string();
            return Err(self.runtime_error(format!("global '{}' already exists", n)));
        }
        self.namespace_set(env, key, value);
        Ok(())
    }

    fn op_get_global(&mut self, fid: FunctionId, name: Value) -> ExecResult<Value> {
        let Some(key) = name.as_string_id() else {
            return Err(self.type_error("global name must be a string".into()));
        };
        let mut cur = self.env_of(fid);
        while let Some(ns_id) = cur {
            let ns = match self.pool.namespace(ns_id) {
                Some(ns) => ns,
                None => break,
            };
            if let Some(v) = ns.get(key) {
                return Ok(v);
            }
            cur = ns.parent;
        }
        let n = self.pool.str_of(key).to_string();
        Err(self.lookup_error(format!("global '{}' does not exist", n)))
    }

    fn op_set_global(&mut self, fid: FunctionId, name: Value, value: Value) -> ExecResult<()> {
        let Some(key) = name.as_string_id() else {
            return Err(self.type_error("global name must be a string".into()));
        };
        let mut cur = self.env_of(fid);
        while let Some(ns_id) = cur {
            let (has, parent) = match self.pool.namespace(ns_id) {
                Some(ns) => (ns.contains(key), ns.parent),
                None => break,
            };
            if has {
                self.namespace_set(ns_id, key, value);
                return Ok(());
            }
            cur = parent;
        }
        let n = self.pool.str_of(key).to_string();
        Err(self.lookup_error(format!("global '{}' does not exist", n)))
    }
}

/// Stack index of an open upvalue, free function to dodge borrow tangles.
fn self_stack_index_of(pool: &crate::gc::ObjectPool, u: UpvalueId) -> Option<usize> {
    pool.upvalue(u).and_then(|uv| uv.stack_index())
}

// Global VM state.
//
// One CrocVm owns the object pool, the collector, the globals and registry
// namespaces, the per-type metatables, the host pin table and every thread.
// A VM is single-writer: exactly one host thread may call into it at a time.

mod call_info;
mod error;
mod exceptions;
pub mod execute;
mod metamethod;
mod opcode;
mod ref_table;

pub use call_info::{ActRecord, TryRecord};
pub use error::{ExecError, ExecResult};
pub use exceptions::ExceptionClasses;
pub use metamethod::{MetaName, NUM_METAMETHODS};
pub use opcode::{Instruction, OpCode, NUM_OPCODES};
pub use ref_table::{PinRef, RefTable};

use crate::gc::{Gc, GcId, GcStats, ObjectPool};
use crate::serialize;
use crate::value::*;
use exceptions::ThrowableFields;
use std::collections::VecDeque;

pub use crate::value::NativeFn;

/// VM construction options.
#[derive(Clone)]
pub struct VmOptions {
    /// Scrub freed payloads (debug aid).
    pub stomp_freed: bool,
    /// Interpreter instructions between GC safe-point checks.
    pub gc_check_interval: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stomp_freed: false,
            gc_check_interval: 64,
        }
    }
}

pub struct CrocVm {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: Gc,

    pub(crate) globals: NamespaceId,
    pub(crate) registry: NamespaceId,

    /// Per-primitive-type metatables (namespaces keyed by metamethod name).
    pub(crate) type_metatables: [Option<NamespaceId>; NUM_KINDS],
    /// Interned metamethod name strings, indexed by MetaName.
    pub(crate) metamethod_names: Vec<StringId>,

    pub(crate) main_thread: ThreadId,
    pub(crate) current_thread: ThreadId,

    /// The currently-thrown value; null when nothing is in flight.
    pub(crate) exception: Value,
    pub(crate) is_unwinding: bool,
    pub(crate) fatal_message: String,

    pub(crate) exc: ExceptionClasses,
    pub(crate) throwable_fields: ThrowableFields,

    pub(crate) refs: RefTable,

    pub(crate) pending_finalizers: VecDeque<InstanceId>,
    pub(crate) in_finalizer: bool,

    /// In-progress (de)serialization, reachable by the opSerialize /
    /// opDeserialize native callbacks.
    pub(crate) active_ser: Option<serialize::WriteState>,
    pub(crate) active_deser: Option<serialize::ReadState>,

    pub(crate) options: VmOptions,
    pub(crate) gc_check_counter: u32,
}

impl CrocVm {
    pub fn new(options: VmOptions) -> CrocVm {
        let mut pool = ObjectPool::new();
        pool.stomp_freed = options.stomp_freed;
        let mut gc = Gc::new();

        let empty = pool.create_string(&mut gc, "");
        pool.fix(GcId::String(empty));
        let globals = pool.create_namespace(&mut gc, empty, None);
        pool.fix(GcId::Namespace(globals));

        let reg_name = pool.create_string(&mut gc, "registry");
        pool.fix(GcId::String(reg_name));
        let registry = pool.create_namespace(&mut gc, reg_name, None);
        pool.fix(GcId::Namespace(registry));

        let main_thread = pool.create_thread(&mut gc, CrocThread::new(None));
        pool.fix(GcId::Thread(main_thread));

        let mut metamethod_names = Vec::with_capacity(NUM_METAMETHODS);
        for m in MetaName::all() {
            let id = pool.create_string(&mut gc, m.name());
            pool.fix(GcId::String(id));
            metamethod_names.push(id);
        }

        let mut vm = CrocVm {
            pool,
            gc,
            globals,
            registry,
            type_metatables: [None; NUM_KINDS],
            metamethod_names,
            main_thread,
            current_thread: main_thread,
            exception: Value::null(),
            is_unwinding: false,
            fatal_message: String::new(),
            exc: ExceptionClasses::default(),
            throwable_fields: ThrowableFields {
                msg: empty,
                value: empty,
                cause: empty,
                location: empty,
            },
            refs: RefTable::new(),
            pending_finalizers: VecDeque::new(),
            in_finalizer: false,
            active_ser: None,
            active_deser: None,
            options,
            gc_check_counter: 0,
        };

        vm.install_exception_classes();
        vm.gc.reset_debt();
        vm
    }

    // ============ Handles ============

    #[inline(always)]
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    #[inline(always)]
    pub fn current_thread(&self) -> ThreadId {
        self.current_thread
    }

    #[inline(always)]
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    // ============ Value creation ============

    pub fn intern(&mut self, s: &str) -> StringId {
        self.pool.create_string(&mut self.gc, s)
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::string(self.intern(s))
    }

    pub fn new_table(&mut self) -> Value {
        Value::table(self.pool.create_table(&mut self.gc))
    }

    pub fn new_array(&mut self, len: usize) -> Value {
        Value::array(self.pool.create_array(&mut self.gc, len))
    }

    pub fn new_array_from(&mut self, values: Vec<Value>) -> Value {
        Value::array(self.pool.create_array_from(&mut self.gc, values))
    }

    pub fn new_memblock(&mut self, len: usize) -> Value {
        Value::memblock(self.pool.create_memblock(&mut self.gc, CrocMemblock::new(len)))
    }

    pub fn new_memblock_from(&mut self, data: Vec<u8>) -> Value {
        Value::memblock(
            self.pool
                .create_memblock(&mut self.gc, CrocMemblock::from_vec(data)),
        )
    }

    /// Borrowed view over host bytes; not serializable, not resizable.
    pub fn new_memblock_view(&mut self, data: &[u8]) -> Value {
        Value::memblock(self.pool.create_memblock(&mut self.gc, CrocMemblock::view(data)))
    }

    pub fn new_namespace(&mut self, name: &str, parent: Option<NamespaceId>) -> Value {
        let name_id = self.intern(name);
        let parent = parent.or(Some(self.globals));
        Value::namespace(self.pool.create_namespace(&mut self.gc, name_id, parent))
    }

    pub fn new_funcdef(&mut self, def: FuncDef) -> FuncDefId {
        self.pool.create_funcdef(&mut self.gc, def)
    }

    /// Close a FuncDef over an environment. Cacheable defs close once and
    /// hand out the cached Function afterwards.
    pub fn new_function(&mut self, def_id: FuncDefId, env: Option<NamespaceId>) -> ExecResult<Value> {
        let env = env.unwrap_or(self.globals);
        let (cacheable, cached, name, num_params, has_upvals) = match self.pool.funcdef(def_id) {
            Some(def) => (
                def.cacheable,
                def.cached_func,
                def.name,
                def.num_params,
                !def.upvals.is_empty(),
            ),
            None => return Err(self.value_error("dangling funcdef".into())),
        };
        if cacheable && has_upvals {
            return Err(self.value_error("cacheable funcdef has free upvalues".into()));
        }
        if let Some(f) = cached {
            return Ok(Value::function(f));
        }
        let func = CrocFunction::script(name, env, num_params, def_id, Vec::new());
        let fid = self.pool.create_function(&mut self.gc, func);
        if cacheable {
            if let Some(def) = self.pool.funcdef_mut(def_id) {
                def.cached_func = Some(fid);
            }
        }
        Ok(Value::function(fid))
    }

    pub fn new_native_function(&mut self, name: &str, max_params: u32, f: NativeFn) -> Value {
        let name_id = self.intern(name);
        let env = self.globals;
        let func = CrocFunction::native(name_id, env, max_params, f);
        Value::function(self.pool.create_function(&mut self.gc, func))
    }

    /// Native function closed over inline upvalues.
    pub fn new_native_closure(&mut self, name: &str, f: NativeFn, upvals: Vec<Value>) -> Value {
        let name_id = self.intern(name);
        let env = self.globals;
        let mut func = CrocFunction::native(name_id, env, 0, f);
        if let FuncBody::Native { upvals: slot, .. } = &mut func.body {
            *slot = upvals;
        }
        Value::function(self.pool.create_function(&mut self.gc, func))
    }

    /// The unique weak reference for a referent, creating it on first use.
    pub fn new_weakref(&mut self, referent: Value) -> ExecResult<Value> {
        let Some(id) = GcId::of_value(&referent) else {
            return Err(self.type_error(format!(
                "cannot weakly reference a {}",
                referent.kind().name()
            )));
        };
        Ok(Value::weakref(self.pool.create_weakref(&mut self.gc, id)))
    }

    /// Dereference a weak ref: null once the referent has been collected.
    pub fn weakref_deref(&self, wr: Value) -> Value {
        let Some(id) = wr.as_weakref_id() else {
            return Value::null();
        };
        match self.pool.weakref(id).and_then(|w| w.referent) {
            Some(GcId::String(i)) => Value::string(i),
            Some(GcId::Table(i)) => Value::table(i),
            Some(GcId::Namespace(i)) => Value::namespace(i),
            Some(GcId::Array(i)) => Value::array(i),
            Some(GcId::Memblock(i)) => Value::memblock(i),
            Some(GcId::Function(i)) => Value::function(i),
            Some(GcId::FuncDef(i)) => Value::funcdef(i),
            Some(GcId::Class(i)) => Value::class(i),
            Some(GcId::Instance(i)) => Value::instance(i),
            Some(GcId::Thread(i)) => Value::thread(i),
            Some(GcId::Upvalue(i)) => Value::upvalue(i),
            Some(GcId::WeakRef(i)) => Value::weakref(i),
            Some(GcId::NativeObj(i)) => Value::nativeobj(i),
            None => Value::null(),
        }
    }

    pub fn new_nativeobj(&mut self, data: Box<dyn std::any::Any>) -> Value {
        Value::nativeobj(self.pool.create_nativeobj(&mut self.gc, data))
    }

    // ============ Classes ============

    pub fn new_class(&mut self, name: &str, parent: Option<ClassId>) -> ExecResult<Value> {
        if let Some(pid) = parent {
            // Deriving freezes the parent.
            match self.pool.class_mut(pid) {
                Some(p) => p.freeze(),
                None => return Err(self.value_error("dangling parent class".into())),
            }
        }
        let name_id = self.intern(name);
        let class = CrocClass::new(name_id, parent);
        Ok(Value::class(self.pool.create_class(&mut self.gc, class)))
    }

    pub fn class_set_method(&mut self, class: ClassId, name: &str, value: Value) -> ExecResult<()> {
        let name_id = self.intern(name);
        match self.pool.class_mut(class) {
            Some(c) if c.is_frozen() => Err(self.state_error("cannot modify a frozen class".into())),
            Some(c) => {
                c.set_method(name_id, value);
                self.gc.barrier_back(GcId::Class(class), &mut self.pool);
                Ok(())
            }
            None => Err(self.value_error("dangling class".into())),
        }
    }

    pub fn class_set_field(&mut self, class: ClassId, name: &str, value: Value) -> ExecResult<()> {
        let name_id = self.intern(name);
        match self.pool.class_mut(class) {
            Some(c) if c.is_frozen() => Err(self.state_error("cannot modify a frozen class".into())),
            Some(c) => {
                c.set_field(name_id, value);
                self.gc.barrier_back(GcId::Class(class), &mut self.pool);
                Ok(())
            }
            None => Err(self.value_error("dangling class".into())),
        }
    }

    pub fn class_set_hidden_field(
        &mut self,
        class: ClassId,
        name: &str,
        value: Value,
    ) -> ExecResult<()> {
        let name_id = self.intern(name);
        match self.pool.class_mut(class) {
            Some(c) if c.is_frozen() => Err(self.state_error("cannot modify a frozen class".into())),
            Some(c) => {
                c.set_hidden_field(name_id, value);
                self.gc.barrier_back(GcId::Class(class), &mut self.pool);
                Ok(())
            }
            None => Err(self.value_error("dangling class".into())),
        }
    }

    pub fn class_set_constructor(&mut self, class: ClassId, ctor: Value) -> ExecResult<()> {
        match self.pool.class_mut(class) {
            Some(c) if c.is_frozen() => Err(self.state_error("cannot modify a frozen class".into())),
            Some(c) => {
                c.constructor = Some(ctor);
                self.gc.barrier_back(GcId::Class(class), &mut self.pool);
                Ok(())
            }
            None => Err(self.value_error("dangling class".into())),
        }
    }

    pub fn class_set_finalizer(&mut self, class: ClassId, fin: Value) -> ExecResult<()> {
        match self.pool.class_mut(class) {
            Some(c) if c.is_frozen() => Err(self.state_error("cannot modify a frozen class".into())),
            Some(c) => {
                c.finalizer = Some(fin);
                self.gc.barrier_back(GcId::Class(class), &mut self.pool);
                Ok(())
            }
            None => Err(self.value_error("dangling class".into())),
        }
    }

    /// Allocate an instance: freezes the class and copies the field set down
    /// the chain (derived-before-base). The constructor is NOT run here.
    pub fn instantiate(&mut self, class: ClassId) -> ExecResult<Value> {
        if self.pool.class(class).is_none() {
            return Err(self.value_error("dangling class".into()));
        }
        if let Some(c) = self.pool.class_mut(class) {
            c.freeze();
        }
        let (fields, hidden) = self.class_field_layout(class);
        let inst = CrocInstance::new(class, fields, hidden);
        Ok(Value::instance(self.pool.create_instance(&mut self.gc, inst)))
    }

    /// Field defaults an instance of `class` starts with, walking the chain
    /// derived-before-base.
    pub(crate) fn class_field_layout(
        &self,
        class: ClassId,
    ) -> (Vec<(StringId, Value)>, Vec<(StringId, Value)>) {
        let mut fields: Vec<(StringId, Value)> = Vec::new();
        let mut hidden: Vec<(StringId, Value)> = Vec::new();
        let mut cur = Some(class);
        while let Some(cid) = cur {
            let Some(c) = self.pool.class(cid) else { break };
            for (k, v) in c.fields() {
                if !fields.iter().any(|(fk, _)| *fk == k) {
                    fields.push((k, v));
                }
            }
            for (k, v) in c.hidden_fields() {
                if !hidden.iter().any(|(fk, _)| *fk == k) {
                    hidden.push((k, v));
                }
            }
            cur = c.parent;
        }
        (fields, hidden)
    }

    /// Method resolution: walk the class chain, derived before base.
    pub(crate) fn find_method(&self, class: ClassId, name: StringId) -> Option<Value> {
        let mut cur = Some(class);
        while let Some(cid) = cur {
            let c = self.pool.class(cid)?;
            if let Some(m) = c.get_method(name) {
                return Some(m);
            }
            cur = c.parent;
        }
        None
    }

    /// Class-side field default lookup along the chain.
    pub(crate) fn find_class_field(&self, class: ClassId, name: StringId) -> Option<Value> {
        let mut cur = Some(class);
        while let Some(cid) = cur {
            let c = self.pool.class(cid)?;
            if let Some(v) = c.get_field(name) {
                return Some(v);
            }
            cur = c.parent;
        }
        None
    }

    /// Hidden-field lookup along the chain; callers gate this on privilege.
    pub(crate) fn find_class_hidden_field(&self, class: ClassId, name: StringId) -> Option<Value> {
        let mut cur = Some(class);
        while let Some(cid) = cur {
            let c = self.pool.class(cid)?;
            if let Some(v) = c.get_hidden_field(name) {
                return Some(v);
            }
            cur = c.parent;
        }
        None
    }

    /// The function whose frame is currently executing, if any.
    pub(crate) fn current_function(&self) -> Option<FunctionId> {
        self.pool
            .thread(self.current_thread)?
            .current_ar()
            .map(|ar| ar.func)
    }

    /// Privileged access means the accessing code belongs to the instance's
    /// own class chain: it is a method, the constructor or the finalizer of
    /// the class or one of its ancestors. Only privileged code sees hidden
    /// fields.
    pub(crate) fn is_privileged_for(&self, class: ClassId, func: FunctionId) -> bool {
        let fv = Value::function(func);
        let mut cur = Some(class);
        while let Some(cid) = cur {
            let Some(c) = self.pool.class(cid) else { return false };
            if c.methods().any(|(_, m)| m.is_identical(&fv))
                || c.constructor.map(|v| v.is_identical(&fv)).unwrap_or(false)
                || c.finalizer.map(|v| v.is_identical(&fv)).unwrap_or(false)
            {
                return true;
            }
            cur = c.parent;
        }
        false
    }

    // ============ Metamethods ============

    pub fn set_type_metatable(&mut self, kind: ValueKind, ns: Option<NamespaceId>) {
        self.type_metatables[kind as usize] = ns;
    }

    pub(crate) fn metamethod_name(&self, m: MetaName) -> StringId {
        self.metamethod_names[m as usize]
    }

    /// Non-recursive metamethod lookup for a value.
    pub(crate) fn get_metamethod(&self, value: &Value, m: MetaName) -> Option<Value> {
        let name = self.metamethod_name(m);
        if let Some(iid) = value.as_instance_id() {
            let inst = self.pool.instance(iid)?;
            return self.find_method(inst.class, name);
        }
        let ns_id = self.type_metatables[value.kind() as usize]?;
        self.pool.namespace(ns_id)?.get(name)
    }

    // ============ Globals ============

    pub fn globals(&self) -> NamespaceId {
        self.globals
    }

    pub fn registry(&self) -> NamespaceId {
        self.registry
    }

    /// Host-level define-or-assign in the globals namespace.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.intern(name);
        let g = self.globals;
        if let Some(ns) = self.pool.namespace_mut(g) {
            ns.set(key, value);
        }
        self.gc.barrier_back(GcId::Namespace(g), &mut self.pool);
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = self.intern(name);
        self.pool.namespace(self.globals)?.get(key)
    }

    pub fn registry_set(&mut self, name: &str, value: Value) {
        let key = self.intern(name);
        let r = self.registry;
        if let Some(ns) = self.pool.namespace_mut(r) {
            ns.set(key, value);
        }
        self.gc.barrier_back(GcId::Namespace(r), &mut self.pool);
    }

    pub fn registry_get(&mut self, name: &str) -> Option<Value> {
        let key = self.intern(name);
        self.pool.namespace(self.registry)?.get(key)
    }

    // ============ Pinning ============

    pub fn pin(&mut self, value: Value) -> PinRef {
        self.refs.pin(value)
    }

    pub fn unpin(&mut self, r: PinRef) -> Option<Value> {
        self.refs.unpin(r)
    }

    pub fn pinned(&self, r: PinRef) -> Option<Value> {
        self.refs.get(r)
    }

    // ============ Threads ============

    pub fn new_thread(&mut self, func: Value) -> ExecResult<Value> {
        let Some(fid) = func.as_function_id() else {
            return Err(self.type_error(format!(
                "coroutine body must be a function, not {}",
                func.kind().name()
            )));
        };
        if self
            .pool
            .function(fid)
            .map(|f| f.is_native())
            .unwrap_or(true)
        {
            return Err(self.value_error("coroutine body must be a script function".into()));
        }
        let t = CrocThread::new(Some(fid));
        Ok(Value::thread(self.pool.create_thread(&mut self.gc, t)))
    }

    pub fn thread_state(&self, t: Value) -> Option<ThreadState> {
        self.pool.thread(t.as_thread_id()?).map(|t| t.state)
    }

    /// Mark a thread for halting; honored at the next safe point.
    pub fn halt(&mut self, thread: ThreadId) {
        if let Some(t) = self.pool.thread_mut(thread) {
            t.pending_halt = true;
        }
    }

    // ============ Exceptions (host side) ============

    /// Take the in-flight exception, clearing the throwing state.
    pub fn catch_exception(&mut self) -> Option<Value> {
        if self.exception.is_null() {
            return None;
        }
        let e = self.exception;
        self.exception = Value::null();
        self.is_unwinding = false;
        Some(e)
    }

    pub fn fatal_message(&self) -> &str {
        &self.fatal_message
    }

    /// Read a field of an exception instance (or any instance) by name.
    pub fn instance_field(&mut self, inst: Value, name: &str) -> Option<Value> {
        let iid = inst.as_instance_id()?;
        let key = self.intern(name);
        let i = self.pool.instance(iid)?;
        i.get_field(key)
            .or_else(|| self.find_class_field(i.class, key))
    }

    // ============ GC driving ============

    pub(crate) fn collect_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(64);
        roots.push(Value::namespace(self.globals));
        roots.push(Value::namespace(self.registry));
        for mt in self.type_metatables.iter().flatten() {
            roots.push(Value::namespace(*mt));
        }
        for s in &self.metamethod_names {
            roots.push(Value::string(*s));
        }
        roots.push(self.exception);
        roots.extend(self.refs.values());
        roots.push(Value::thread(self.main_thread));
        roots.push(Value::thread(self.current_thread));
        for &iid in &self.pending_finalizers {
            roots.push(Value::instance(iid));
        }
        if let Some(ws) = &self.active_ser {
            roots.extend(ws.roots());
        }
        if let Some(rs) = &self.active_deser {
            roots.extend(rs.roots());
        }
        roots
    }

    /// Incremental safe-point check; called by the interpreter.
    pub(crate) fn maybe_gc_step(&mut self) -> ExecResult<()> {
        if self.in_finalizer || !self.gc.should_collect() {
            return Ok(());
        }
        let roots = self.collect_roots();
        let r = self.gc.step(&roots, &mut self.pool);
        if r.fatal_finalizable_cycle {
            return Err(self.fatal("finalizable instance caught in a reference cycle".into()));
        }
        self.pending_finalizers.extend(r.to_finalize);
        Ok(())
    }

    /// Full collection plus finalizer draining.
    pub fn collect_garbage(&mut self) -> ExecResult<()> {
        let roots = self.collect_roots();
        let r = self.gc.collect_full(&roots, &mut self.pool);
        if r.fatal_finalizable_cycle {
            return Err(self.fatal("finalizable instance caught in a reference cycle".into()));
        }
        self.pending_finalizers.extend(r.to_finalize);
        self.run_pending_finalizers()
    }

    /// Finalizers run serialized, never while the GC itself is running, and
    /// each instance is finalized exactly once.
    pub(crate) fn run_pending_finalizers(&mut self) -> ExecResult<()> {
        if self.in_finalizer {
            return Ok(());
        }
        while let Some(iid) = self.pending_finalizers.pop_front() {
            let finalizer = self
                .pool
                .instance(iid)
                .and_then(|i| self.pool.class(i.class))
                .and_then(|c| c.finalizer);
            let Some(fin) = finalizer else { continue };

            self.in_finalizer = true;
            let result = self.call_value(fin, &[Value::instance(iid)], 0);
            self.in_finalizer = false;

            if let Some(h) = self.pool.instances.get_mut(iid.0).map(|o| &mut o.header) {
                h.set_finalized();
                h.clear_finalize_pending();
            }

            match result {
                Ok(_) => {}
                Err(ExecError::Exception) => {
                    // A throwing finalizer does not stop the queue; drop the
                    // exception and keep draining.
                    self.catch_exception();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Tear the VM down: every live finalizable instance that has not yet
    /// been finalized gets its finalizer run, reachable or not, and the VM
    /// is consumed.
    pub fn close(mut self) -> ExecResult<()> {
        let mut leftovers: Vec<InstanceId> = Vec::new();
        for (i, obj) in self.pool.instances.iter() {
            if obj.header.is_finalized() {
                continue;
            }
            let finalizable = self
                .pool
                .class(obj.data.class)
                .map(|c| c.finalizer.is_some())
                .unwrap_or(false);
            if finalizable {
                leftovers.push(InstanceId(i));
            }
        }
        self.pending_finalizers.extend(leftovers);
        self.run_pending_finalizers()
    }

    // ============ Serialization entry points ============

    pub fn serialize_graph(&mut self, root: Value, transients: Option<TableId>) -> ExecResult<Vec<u8>> {
        serialize::serialize_graph(self, root, transients)
    }

    pub fn deserialize_graph(
        &mut self,
        bytes: &[u8],
        transients: Option<TableId>,
    ) -> ExecResult<Value> {
        serialize::deserialize_graph(self, bytes, transients)
    }

    pub fn serialize_module(&mut self, name: &str, def: FuncDefId) -> ExecResult<Vec<u8>> {
        serialize::serialize_module(self, name, def)
    }

    pub fn deserialize_module(&mut self, bytes: &[u8]) -> ExecResult<(StringId, FuncDefId)> {
        serialize::deserialize_module(self, bytes)
    }

    // ============ Hooks ============

    /// Install (or clear) the hook function on a thread.
    pub fn set_hook(&mut self, thread: ThreadId, func: Value, mask: u8, delay: u32) {
        if let Some(t) = self.pool.thread_mut(thread) {
            t.hook.func = func;
            t.hook.mask = mask;
            t.hook.delay = delay;
            t.hook.counter = delay;
        }
    }

    // ============ Container operations with write barriers ============

    pub fn table_get(&mut self, table: Value, key: Value) -> ExecResult<Value> {
        let Some(tid) = table.as_table_id() else {
            return Err(self.type_error(format!("cannot index a {}", table.kind().name())));
        };
        let Some(t) = self.pool.table(tid) else {
            return Err(self.value_error("dangling table".into()));
        };
        match t.get(&key) {
            Ok(v) => Ok(v.unwrap_or_default()),
            Err(_) => Err(self.value_error(format!("invalid table key: {:?}", key))),
        }
    }

    pub fn table_set(&mut self, table: Value, key: Value, value: Value) -> ExecResult<()> {
        let Some(tid) = table.as_table_id() else {
            return Err(self.type_error(format!("cannot index a {}", table.kind().name())));
        };
        let Some(t) = self.pool.table_mut(tid) else {
            return Err(self.value_error("dangling table".into()));
        };
        match t.set(key, value) {
            Ok(()) => {
                self.gc.barrier_back(GcId::Table(tid), &mut self.pool);
                Ok(())
            }
            Err(_) => Err(self.value_error(format!("invalid table key: {:?}", key))),
        }
    }

    pub fn array_set(&mut self, arr: ArrayId, index: usize, value: Value) -> bool {
        let ok = self
            .pool
            .array_mut(arr)
            .map(|a| a.set(index, value))
            .unwrap_or(false);
        if ok {
            self.gc.barrier_back(GcId::Array(arr), &mut self.pool);
        }
        ok
    }

    pub fn namespace_set(&mut self, ns: NamespaceId, name: StringId, value: Value) {
        if let Some(n) = self.pool.namespace_mut(ns) {
            n.set(name, value);
        }
        self.gc.barrier_back(GcId::Namespace(ns), &mut self.pool);
    }

    // ============ Slot-based host stack API ============
    // These operate on a thread's logical stack top, the window native
    // functions and the host both see.

    pub fn push(&mut self, thread: ThreadId, value: Value) {
        if let Some(t) = self.pool.thread_mut(thread) {
            t.push(value);
        }
    }

    pub fn pop(&mut self, thread: ThreadId) -> Value {
        self.pool
            .thread_mut(thread)
            .map(|t| t.pop())
            .unwrap_or_default()
    }

    pub fn top(&self, thread: ThreadId) -> usize {
        self.pool.thread(thread).map(|t| t.stack_top).unwrap_or(0)
    }

    pub fn get_slot(&self, thread: ThreadId, slot: usize) -> Value {
        self.pool
            .thread(thread)
            .map(|t| t.get(slot))
            .unwrap_or_default()
    }

    pub fn set_slot(&mut self, thread: ThreadId, slot: usize, value: Value) {
        if let Some(t) = self.pool.thread_mut(thread) {
            t.set(slot, value);
        }
    }

    /// Argument accessor for native functions: index within the current
    /// native frame window.
    pub fn arg(&self, thread: ThreadId, index: usize) -> Value {
        let Some(t) = self.pool.thread(thread) else {
            return Value::null();
        };
        let Some(ar) = t.current_ar() else {
            return Value::null();
        };
        t.get(ar.base + index)
    }

    /// String payload of an argument, if it is a string.
    pub fn arg_str(&self, thread: ThreadId, index: usize) -> Option<&str> {
        let v = self.arg(thread, index);
        Some(self.pool.str_of(v.as_string_id()?))
    }
}

impl Default for CrocVm {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}

// Graph writer.

use crate::gc::GcId;
use crate::serialize::{write_varint, TAG_BACKREF, TAG_TRANSIENT};
use crate::value::*;
use crate::vm::{CrocVm, ExecResult, MetaName};
use ahash::RandomState;
use std::collections::HashMap;

pub(crate) struct WriteState {
    pub(crate) buf: Vec<u8>,
    ids: HashMap<GcId, u32, RandomState>,
    next_id: u32,
    transients: Option<TableId>,
}

impl WriteState {
    pub(crate) fn new(transients: Option<TableId>) -> Self {
        WriteState {
            buf: Vec::with_capacity(256),
            ids: HashMap::with_hasher(RandomState::new()),
            next_id: 0,
            transients,
        }
    }

    /// Values the GC must keep alive while this write is in flight.
    pub(crate) fn roots(&self) -> Vec<Value> {
        self.transients.map(Value::table).into_iter().collect()
    }
}

fn st(vm: &mut CrocVm) -> &mut WriteState {
    vm.active_ser.as_mut().expect("writer state present")
}

fn w8(vm: &mut CrocVm, b: u8) {
    st(vm).buf.push(b);
}

fn wint(vm: &mut CrocVm, v: i64) {
    write_varint(&mut st(vm).buf, v);
}

fn wbytes(vm: &mut CrocVm, bytes: &[u8]) {
    st(vm).buf.extend_from_slice(bytes);
}

fn wtag(vm: &mut CrocVm, kind: ValueKind) {
    w8(vm, kind as u8);
}

/// Back-reference protocol: true means a backref was emitted and the caller
/// is done; false means the ID was just assigned and the body must follow.
fn ser_ref(vm: &mut CrocVm, id: GcId) -> bool {
    let existing = st(vm).ids.get(&id).copied();
    if let Some(n) = existing {
        w8(vm, TAG_BACKREF);
        wint(vm, n as i64);
        true
    } else {
        let s = st(vm);
        let n = s.next_id;
        s.next_id += 1;
        s.ids.insert(id, n);
        false
    }
}

/// Transients substitution: true means the value was rewritten and emitted.
fn ser_transient(vm: &mut CrocVm, v: Value) -> ExecResult<bool> {
    let Some(tid) = st(vm).transients else {
        return Ok(false);
    };
    let replacement = vm
        .pool
        .table(tid)
        .and_then(|t| t.get(&v).ok())
        .flatten();
    match replacement {
        Some(r) => {
            w8(vm, TAG_TRANSIENT);
            ser_value(vm, r)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn ser_value(vm: &mut CrocVm, v: Value) -> ExecResult<()> {
    if ser_transient(vm, v)? {
        return Ok(());
    }

    match v.kind() {
        ValueKind::Null => {
            wtag(vm, ValueKind::Null);
            Ok(())
        }
        ValueKind::Bool => {
            wtag(vm, ValueKind::Bool);
            w8(vm, v.as_bool().expect("bool") as u8);
            Ok(())
        }
        ValueKind::Int => {
            wtag(vm, ValueKind::Int);
            wint(vm, v.as_int().expect("int"));
            Ok(())
        }
        ValueKind::Float => {
            wtag(vm, ValueKind::Float);
            let bits = v.as_float().expect("float").to_ne_bytes();
            wbytes(vm, &bits);
            Ok(())
        }
        ValueKind::String => ser_string(vm, v.as_string_id().expect("string")),
        ValueKind::WeakRef => ser_weakref(vm, v.as_weakref_id().expect("weakref")),
        ValueKind::Table => ser_table(vm, v.as_table_id().expect("table")),
        ValueKind::Namespace => ser_namespace(vm, v.as_namespace_id().expect("namespace")),
        ValueKind::Array => ser_array(vm, v.as_array_id().expect("array")),
        ValueKind::Memblock => ser_memblock(vm, v.as_memblock_id().expect("memblock")),
        ValueKind::Function => ser_function(vm, v.as_function_id().expect("function")),
        ValueKind::FuncDef => ser_funcdef(vm, v.as_funcdef_id().expect("funcdef")),
        ValueKind::Class => ser_class(vm, v.as_class_id().expect("class")),
        ValueKind::Instance => ser_instance(vm, v.as_instance_id().expect("instance")),
        ValueKind::Upvalue => ser_upvalue(vm, v.as_upvalue_id().expect("upvalue")),
        ValueKind::Thread => Err(vm.type_error("cannot serialize a thread".into())),
        ValueKind::NativeObj => Err(vm.type_error("cannot serialize a native object".into())),
    }
}

fn ser_string(vm: &mut CrocVm, id: StringId) -> ExecResult<()> {
    if ser_ref(vm, GcId::String(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::String);
    let bytes = vm.pool.str_of(id).as_bytes().to_vec();
    wint(vm, bytes.len() as i64);
    wbytes(vm, &bytes);
    Ok(())
}

fn ser_weakref(vm: &mut CrocVm, id: WeakRefId) -> ExecResult<()> {
    if ser_ref(vm, GcId::WeakRef(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::WeakRef);
    let referent = vm.weakref_deref(Value::weakref(id));
    ser_value(vm, referent)
}

fn ser_table(vm: &mut CrocVm, id: TableId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Table(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::Table);
    let pairs = vm.pool.table(id).map(|t| t.pairs()).unwrap_or_default();
    wint(vm, pairs.len() as i64);
    for (k, val) in pairs {
        ser_value(vm, k)?;
        ser_value(vm, val)?;
    }
    Ok(())
}

fn ser_namespace(vm: &mut CrocVm, id: NamespaceId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Namespace(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::Namespace);
    let (name, parent, pairs) = match vm.pool.namespace(id) {
        Some(ns) => (ns.name, ns.parent, ns.pairs()),
        None => return Err(vm.value_error("dangling namespace".into())),
    };
    ser_string(vm, name)?;
    match parent {
        Some(p) => {
            w8(vm, 1);
            ser_namespace(vm, p)?;
        }
        None => w8(vm, 0),
    }
    wint(vm, pairs.len() as i64);
    for (k, val) in pairs {
        ser_string(vm, k)?;
        ser_value(vm, val)?;
    }
    Ok(())
}

fn ser_array(vm: &mut CrocVm, id: ArrayId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Array(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::Array);
    let values: Vec<Value> = vm
        .pool
        .array(id)
        .map(|a| a.values().collect())
        .unwrap_or_default();
    wint(vm, values.len() as i64);
    for val in values {
        ser_value(vm, val)?;
    }
    Ok(())
}

fn ser_memblock(vm: &mut CrocVm, id: MemblockId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Memblock(id)) {
        return Ok(());
    }
    let (owned, bytes) = match vm.pool.memblock(id) {
        Some(m) => (m.owns_data(), m.as_bytes().to_vec()),
        None => return Err(vm.value_error("dangling memblock".into())),
    };
    if !owned {
        return Err(vm.type_error("cannot serialize a memblock that does not own its data".into()));
    }
    wtag(vm, ValueKind::Memblock);
    wint(vm, bytes.len() as i64);
    wbytes(vm, &bytes);
    Ok(())
}

fn ser_function(vm: &mut CrocVm, id: FunctionId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Function(id)) {
        return Ok(());
    }
    let (name, env, num_params, def, upvals) = match vm.pool.function(id) {
        Some(f) => match &f.body {
            FuncBody::Script { def, upvals } => {
                (f.name, f.env, f.num_params, *def, upvals.clone())
            }
            FuncBody::Native { .. } => {
                return Err(vm.type_error("cannot serialize a native function".into()));
            }
        },
        None => return Err(vm.value_error("dangling function".into())),
    };
    // Open upvalues point into a live stack and cannot leave the VM.
    for u in &upvals {
        if vm.pool.upvalue(*u).map(|uv| uv.is_open()).unwrap_or(false) {
            return Err(vm.type_error("cannot serialize a function with open upvalues".into()));
        }
    }

    wtag(vm, ValueKind::Function);
    ser_string(vm, name)?;
    wint(vm, num_params as i64);
    if env == vm.globals {
        // The reading VM substitutes its own globals.
        w8(vm, 0);
    } else {
        w8(vm, 1);
        ser_namespace(vm, env)?;
    }
    ser_funcdef(vm, def)?;
    wint(vm, upvals.len() as i64);
    for u in upvals {
        ser_upvalue(vm, u)?;
    }
    Ok(())
}

fn ser_upvalue(vm: &mut CrocVm, id: UpvalueId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Upvalue(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::Upvalue);
    let value = match vm.pool.upvalue(id).and_then(|u| u.closed_value()) {
        Some(v) => v,
        None => {
            return Err(vm.type_error("cannot serialize an open upvalue".into()));
        }
    };
    ser_value(vm, value)
}

fn ser_funcdef(vm: &mut CrocVm, id: FuncDefId) -> ExecResult<()> {
    if ser_ref(vm, GcId::FuncDef(id)) {
        return Ok(());
    }
    wtag(vm, ValueKind::FuncDef);

    let (name, num_params, param_masks, is_vararg, stack_size, code, constants, inner, upvals, switches, line_info, locals, cacheable) = {
        let def = match vm.pool.funcdef(id) {
            Some(d) => d,
            None => return Err(vm.value_error("dangling funcdef".into())),
        };
        (
            def.name,
            def.num_params,
            def.param_masks.clone(),
            def.is_vararg,
            def.stack_size,
            def.code.clone(),
            def.constants.clone(),
            def.inner_defs.clone(),
            def.upvals.clone(),
            def.switch_tables
                .iter()
                .map(|st| {
                    let mut cases: Vec<(Value, i32)> =
                        st.offsets.iter().map(|(k, v)| (*k, *v)).collect();
                    cases.sort_by_key(|(_, off)| *off);
                    (cases, st.default_offset)
                })
                .collect::<Vec<_>>(),
            def.line_info.clone(),
            def.locals
                .iter()
                .map(|l| (l.name, l.pc_start, l.pc_end, l.slot))
                .collect::<Vec<_>>(),
            def.cacheable,
        )
    };

    ser_string(vm, name)?;
    wint(vm, num_params as i64);
    wint(vm, param_masks.len() as i64);
    for m in &param_masks {
        wint(vm, *m as i64);
    }
    w8(vm, is_vararg as u8);
    wint(vm, stack_size as i64);

    wint(vm, code.len() as i64);
    for word in &code {
        wint(vm, *word as i64);
    }

    wint(vm, constants.len() as i64);
    for c in constants {
        ser_value(vm, c)?;
    }

    wint(vm, inner.len() as i64);
    for d in inner {
        ser_funcdef(vm, d)?;
    }

    wint(vm, upvals.len() as i64);
    for u in &upvals {
        match u {
            UpvalDesc::Local(slot) => {
                w8(vm, 0);
                wint(vm, *slot as i64);
            }
            UpvalDesc::Upval(i) => {
                w8(vm, 1);
                wint(vm, *i as i64);
            }
        }
    }

    wint(vm, switches.len() as i64);
    for (cases, default_offset) in switches {
        wint(vm, cases.len() as i64);
        for (case, offset) in cases {
            ser_value(vm, case)?;
            wint(vm, offset as i64);
        }
        wint(vm, default_offset as i64);
    }

    wint(vm, line_info.len() as i64);
    for l in &line_info {
        wint(vm, *l as i64);
    }

    wint(vm, locals.len() as i64);
    for (lname, pc_start, pc_end, slot) in locals {
        ser_string(vm, lname)?;
        wint(vm, pc_start as i64);
        wint(vm, pc_end as i64);
        wint(vm, slot as i64);
    }

    w8(vm, cacheable as u8);
    Ok(())
}

fn ser_class(vm: &mut CrocVm, id: ClassId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Class(id)) {
        return Ok(());
    }
    let (name, parent, frozen, methods, fields, hidden, ctor, finalizer) =
        match vm.pool.class(id) {
            Some(c) => (
                c.name,
                c.parent,
                c.is_frozen(),
                c.methods().collect::<Vec<_>>(),
                c.fields().collect::<Vec<_>>(),
                c.hidden_fields().collect::<Vec<_>>(),
                c.constructor,
                c.finalizer,
            ),
            None => return Err(vm.value_error("dangling class".into())),
        };
    if finalizer.is_some() {
        return Err(vm.type_error("cannot serialize a class with a finalizer".into()));
    }

    wtag(vm, ValueKind::Class);
    ser_string(vm, name)?;
    match parent {
        Some(p) => {
            w8(vm, 1);
            ser_class(vm, p)?;
        }
        None => w8(vm, 0),
    }
    w8(vm, frozen as u8);

    for group in [&methods, &fields, &hidden] {
        wint(vm, group.len() as i64);
        for (k, val) in group {
            ser_string(vm, *k)?;
            ser_value(vm, *val)?;
        }
    }

    match ctor {
        Some(c) => {
            w8(vm, 1);
            ser_value(vm, c)?;
        }
        None => w8(vm, 0),
    }
    Ok(())
}

fn ser_instance(vm: &mut CrocVm, id: InstanceId) -> ExecResult<()> {
    if ser_ref(vm, GcId::Instance(id)) {
        return Ok(());
    }
    let class = match vm.pool.instance(id) {
        Some(i) => i.class,
        None => return Err(vm.value_error("dangling instance".into())),
    };
    let has_finalizer = vm
        .pool
        .class(class)
        .map(|c| c.finalizer.is_some())
        .unwrap_or(false);
    if has_finalizer {
        return Err(vm.type_error("cannot serialize an instance with a finalizer".into()));
    }

    wtag(vm, ValueKind::Instance);
    ser_value(vm, Value::class(class))?;

    let inst_value = Value::instance(id);
    let custom = vm.get_metamethod(&inst_value, MetaName::Serialize);
    match custom {
        Some(hook) => {
            w8(vm, 1);
            // The hook writes its own payload through the emit callback.
            let stream = vm.new_nativeobj(Box::new(()));
            let emit = vm.new_native_function("serialize.emit", 1, native_emit);
            vm.call_value(hook, &[inst_value, stream, emit], 0)?;
        }
        None => {
            w8(vm, 0);
            let (fields, hidden) = match vm.pool.instance(id) {
                Some(i) => (
                    i.fields().collect::<Vec<_>>(),
                    i.hidden_fields().collect::<Vec<_>>(),
                ),
                None => (Vec::new(), Vec::new()),
            };
            for group in [fields, hidden] {
                wint(vm, group.len() as i64);
                for (k, val) in group {
                    ser_string(vm, k)?;
                    ser_value(vm, val)?;
                }
            }
        }
    }
    Ok(())
}

/// The emit callback handed to opSerialize: serializes its argument into
/// the active stream.
fn native_emit(vm: &mut CrocVm, tid: ThreadId, _nargs: usize) -> ExecResult<usize> {
    let v = vm.arg(tid, 0);
    if vm.active_ser.is_none() {
        return Err(vm.state_error("emit called outside serialization".into()));
    }
    ser_value(vm, v)?;
    Ok(0)
}

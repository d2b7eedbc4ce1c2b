// Graph reader.
//
// Back-reference IDs were assigned on write, in first-encounter order, so
// the reader registers a shell for every reference object at the same
// point and fills its fields afterwards. That is what allows a table to
// hold a back-edge to itself before its body has finished reading.

use crate::gc::{CrocWeakRef, GcBox, GcId};
use crate::serialize::{read_varint, TAG_BACKREF, TAG_TRANSIENT};
use crate::value::*;
use crate::vm::{CrocVm, ExecError, ExecResult, MetaName};

pub(crate) struct ReadState {
    data: Vec<u8>,
    pos: usize,
    /// Back-reference ID -> restored value, in registration order.
    objects: Vec<Value>,
    transients: Option<TableId>,
}

impl ReadState {
    pub(crate) fn new(data: Vec<u8>, transients: Option<TableId>) -> Self {
        ReadState {
            data,
            pos: 0,
            objects: Vec::new(),
            transients,
        }
    }

    /// Everything restored so far plus the transients table; the GC must
    /// not reclaim half-built shells.
    pub(crate) fn roots(&self) -> Vec<Value> {
        let mut r = self.objects.clone();
        if let Some(t) = self.transients {
            r.push(Value::table(t));
        }
        r
    }
}

fn st(vm: &mut CrocVm) -> &mut ReadState {
    vm.active_deser.as_mut().expect("reader state present")
}

fn eof(vm: &mut CrocVm) -> ExecError {
    let c = vm.exc.eof_error;
    vm.throw_class(c, "unexpected end of serialized stream".into())
}

fn malformed(vm: &mut CrocVm, what: &str) -> ExecError {
    let c = vm.exc.value_error;
    vm.throw_class(c, format!("malformed serialized stream: {}", what))
}

fn r8(vm: &mut CrocVm) -> ExecResult<u8> {
    let s = st(vm);
    match s.data.get(s.pos) {
        Some(&b) => {
            s.pos += 1;
            Ok(b)
        }
        None => Err(eof(vm)),
    }
}

fn rint(vm: &mut CrocVm) -> ExecResult<i64> {
    let s = st(vm);
    match read_varint(&s.data, &mut s.pos) {
        Some(v) => Ok(v),
        None => Err(eof(vm)),
    }
}

fn rlen(vm: &mut CrocVm) -> ExecResult<usize> {
    let v = rint(vm)?;
    if v < 0 {
        return Err(malformed(vm, "negative length"));
    }
    Ok(v as usize)
}

fn rbytes(vm: &mut CrocVm, n: usize) -> ExecResult<Vec<u8>> {
    let s = st(vm);
    if s.pos + n > s.data.len() {
        return Err(eof(vm));
    }
    let out = s.data[s.pos..s.pos + n].to_vec();
    s.pos += n;
    Ok(out)
}

/// Reserve the next back-reference slot for a shell.
fn register(vm: &mut CrocVm, v: Value) -> usize {
    let s = st(vm);
    s.objects.push(v);
    s.objects.len() - 1
}

pub(crate) fn deser_value(vm: &mut CrocVm) -> ExecResult<Value> {
    let tag = r8(vm)?;

    if tag == TAG_BACKREF {
        let id = rint(vm)?;
        let v = st(vm).objects.get(id as usize).copied();
        return v.ok_or_else(|| malformed(vm, "back-reference to an unknown object"));
    }
    if tag == TAG_TRANSIENT {
        let replacement = deser_value(vm)?;
        return restore_transient(vm, replacement);
    }

    let Some(kind) = ValueKind::from_u8(tag) else {
        return Err(malformed(vm, "unknown value tag"));
    };
    match kind {
        ValueKind::Null => Ok(Value::null()),
        ValueKind::Bool => Ok(Value::bool(r8(vm)? != 0)),
        ValueKind::Int => Ok(Value::int(rint(vm)?)),
        ValueKind::Float => {
            let bytes = rbytes(vm, 8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&bytes);
            Ok(Value::float(f64::from_ne_bytes(arr)))
        }
        ValueKind::String => deser_string(vm),
        ValueKind::WeakRef => deser_weakref(vm),
        ValueKind::Table => deser_table(vm),
        ValueKind::Namespace => deser_namespace(vm),
        ValueKind::Array => deser_array(vm),
        ValueKind::Memblock => deser_memblock(vm),
        ValueKind::Function => deser_function(vm),
        ValueKind::FuncDef => deser_funcdef(vm),
        ValueKind::Class => deser_class(vm),
        ValueKind::Instance => deser_instance(vm),
        ValueKind::Upvalue => deser_upvalue(vm),
        ValueKind::Thread | ValueKind::NativeObj => {
            Err(malformed(vm, "unserializable type in stream"))
        }
    }
}

/// Invert the read-side transients map: find the key whose replacement
/// equals the value we just read.
fn restore_transient(vm: &mut CrocVm, replacement: Value) -> ExecResult<Value> {
    let Some(tid) = st(vm).transients else {
        return Err(malformed(vm, "transient value with no transients map"));
    };
    let original = vm
        .pool
        .table(tid)
        .and_then(|t| t.iter().find(|(_, v)| v.raw_equal(&replacement)).map(|(k, _)| *k));
    original.ok_or_else(|| malformed(vm, "transient value with no inverse mapping"))
}

fn deser_string(vm: &mut CrocVm) -> ExecResult<Value> {
    let len = rlen(vm)?;
    let bytes = rbytes(vm, len)?;
    let s = String::from_utf8(bytes).map_err(|_| malformed(vm, "string is not UTF-8"))?;
    // Interning re-uniques the string in this VM.
    let v = vm.new_string(&s);
    register(vm, v);
    Ok(v)
}

fn deser_weakref(vm: &mut CrocVm) -> ExecResult<Value> {
    let id = WeakRefId(vm.pool.weakrefs.alloc(GcBox::new(CrocWeakRef { referent: None })));
    let v = Value::weakref(id);
    register(vm, v);
    let referent = deser_value(vm)?;
    if let Some(rid) = GcId::of_value(&referent) {
        if let Some(w) = vm.pool.weakrefs.get_mut(id.0) {
            w.data.referent = Some(rid);
        }
        vm.pool.weakref_table.entry(rid).or_insert(id);
    }
    Ok(v)
}

fn deser_table(vm: &mut CrocVm) -> ExecResult<Value> {
    let v = vm.new_table();
    register(vm, v);
    let count = rlen(vm)?;
    for _ in 0..count {
        let k = deser_value(vm)?;
        let val = deser_value(vm)?;
        vm.table_set(v, k, val)?;
    }
    Ok(v)
}

fn deser_namespace(vm: &mut CrocVm) -> ExecResult<Value> {
    let v = vm.new_namespace("", None);
    let nid = v.as_namespace_id().expect("namespace");
    // Shell first; the parent link set below replaces the default.
    if let Some(ns) = vm.pool.namespace_mut(nid) {
        ns.parent = None;
    }
    register(vm, v);

    let name = deser_value(vm)?;
    let Some(name_id) = name.as_string_id() else {
        return Err(malformed(vm, "namespace name must be a string"));
    };
    let parent = if r8(vm)? != 0 {
        let p = deser_value(vm)?;
        match p.as_namespace_id() {
            Some(pid) => Some(pid),
            None => return Err(malformed(vm, "namespace parent must be a namespace")),
        }
    } else {
        None
    };
    if let Some(ns) = vm.pool.namespace_mut(nid) {
        ns.name = name_id;
        ns.parent = parent;
    }

    let count = rlen(vm)?;
    for _ in 0..count {
        let k = deser_value(vm)?;
        let Some(key) = k.as_string_id() else {
            return Err(malformed(vm, "namespace key must be a string"));
        };
        let val = deser_value(vm)?;
        vm.namespace_set(nid, key, val);
    }
    Ok(v)
}

fn deser_array(vm: &mut CrocVm) -> ExecResult<Value> {
    let v = vm.new_array(0);
    let aid = v.as_array_id().expect("array");
    register(vm, v);
    let len = rlen(vm)?;
    if let Some(a) = vm.pool.array_mut(aid) {
        a.resize(len);
    }
    for i in 0..len {
        let val = deser_value(vm)?;
        vm.array_set(aid, i, val);
    }
    Ok(v)
}

fn deser_memblock(vm: &mut CrocVm) -> ExecResult<Value> {
    let len = rlen(vm)?;
    let bytes = rbytes(vm, len)?;
    let v = vm.new_memblock_from(bytes);
    register(vm, v);
    Ok(v)
}

fn deser_function(vm: &mut CrocVm) -> ExecResult<Value> {
    // Shell first: a closure can reach itself through a closed upvalue.
    let placeholder_name = vm.intern("");
    let globals = vm.globals();
    let shell = CrocFunction::script(
        placeholder_name,
        globals,
        0,
        FuncDefId(u32::MAX),
        Vec::new(),
    );
    let fid = vm.pool.create_function(&mut vm.gc, shell);
    let v = Value::function(fid);
    register(vm, v);

    let name = deser_value(vm)?;
    let Some(name_id) = name.as_string_id() else {
        return Err(malformed(vm, "function name must be a string"));
    };
    let num_params = rint(vm)? as u32;
    let env = if r8(vm)? != 0 {
        let e = deser_value(vm)?;
        match e.as_namespace_id() {
            Some(nid) => nid,
            None => return Err(malformed(vm, "function environment must be a namespace")),
        }
    } else {
        globals
    };
    let def = deser_value(vm)?;
    let Some(def_id) = def.as_funcdef_id() else {
        return Err(malformed(vm, "function body must be a funcdef"));
    };
    let n_upvals = rlen(vm)?;
    let mut upvals = Vec::with_capacity(n_upvals);
    for _ in 0..n_upvals {
        let u = deser_value(vm)?;
        match u.as_upvalue_id() {
            Some(uid) => upvals.push(uid),
            None => return Err(malformed(vm, "function upvalue slot must be an upvalue")),
        }
    }

    if let Some(f) = vm.pool.function_mut(fid) {
        f.name = name_id;
        f.env = env;
        f.num_params = num_params;
        f.max_params = num_params;
        f.body = FuncBody::Script { def: def_id, upvals };
    }
    Ok(v)
}

fn deser_upvalue(vm: &mut CrocVm) -> ExecResult<Value> {
    let id = vm
        .pool
        .create_upvalue(&mut vm.gc, crate::gc::CrocUpvalue::closed(Value::null()));
    let v = Value::upvalue(id);
    register(vm, v);
    let value = deser_value(vm)?;
    if let Some(u) = vm.pool.upvalue_mut(id) {
        u.close(value);
    }
    Ok(v)
}

fn deser_funcdef(vm: &mut CrocVm) -> ExecResult<Value> {
    let placeholder_name = vm.intern("");
    let def_id = vm.new_funcdef(FuncDef::new(placeholder_name, 0, 0));
    let v = Value::funcdef(def_id);
    register(vm, v);

    let name = deser_value(vm)?;
    let Some(name_id) = name.as_string_id() else {
        return Err(malformed(vm, "funcdef name must be a string"));
    };
    let num_params = rint(vm)? as u32;

    let n_masks = rlen(vm)?;
    let mut param_masks = Vec::with_capacity(n_masks);
    for _ in 0..n_masks {
        param_masks.push(rint(vm)? as u32);
    }
    let is_vararg = r8(vm)? != 0;
    let stack_size = rint(vm)? as u32;

    let n_code = rlen(vm)?;
    let mut code = Vec::with_capacity(n_code);
    for _ in 0..n_code {
        code.push(rint(vm)? as u32);
    }

    let n_consts = rlen(vm)?;
    let mut constants = Vec::with_capacity(n_consts);
    for _ in 0..n_consts {
        constants.push(deser_value(vm)?);
    }

    let n_inner = rlen(vm)?;
    let mut inner_defs = Vec::with_capacity(n_inner);
    for _ in 0..n_inner {
        let d = deser_value(vm)?;
        match d.as_funcdef_id() {
            Some(did) => inner_defs.push(did),
            None => return Err(malformed(vm, "inner definition must be a funcdef")),
        }
    }

    let n_upvals = rlen(vm)?;
    let mut upvals = Vec::with_capacity(n_upvals);
    for _ in 0..n_upvals {
        let kind = r8(vm)?;
        let index = rint(vm)? as u32;
        upvals.push(match kind {
            0 => UpvalDesc::Local(index),
            1 => UpvalDesc::Upval(index),
            _ => return Err(malformed(vm, "unknown upvalue descriptor")),
        });
    }

    let n_switch = rlen(vm)?;
    let mut switch_tables = Vec::with_capacity(n_switch);
    for _ in 0..n_switch {
        let n_cases = rlen(vm)?;
        let mut cases = Vec::with_capacity(n_cases);
        for _ in 0..n_cases {
            let case = deser_value(vm)?;
            let offset = rint(vm)? as i32;
            cases.push((case, offset));
        }
        let default_offset = rint(vm)? as i32;
        switch_tables.push(SwitchTable::new(cases, default_offset));
    }

    let n_lines = rlen(vm)?;
    let mut line_info = Vec::with_capacity(n_lines);
    for _ in 0..n_lines {
        line_info.push(rint(vm)? as u32);
    }

    let n_locals = rlen(vm)?;
    let mut locals = Vec::with_capacity(n_locals);
    for _ in 0..n_locals {
        let lname = deser_value(vm)?;
        let Some(lname_id) = lname.as_string_id() else {
            return Err(malformed(vm, "local name must be a string"));
        };
        let pc_start = rint(vm)? as u32;
        let pc_end = rint(vm)? as u32;
        let slot = rint(vm)? as u32;
        locals.push(LocalVarDesc {
            name: lname_id,
            pc_start,
            pc_end,
            slot,
        });
    }

    let cacheable = r8(vm)? != 0;

    if let Some(def) = vm.pool.funcdef_mut(def_id) {
        def.name = name_id;
        def.num_params = num_params;
        def.param_masks = param_masks;
        def.is_vararg = is_vararg;
        def.stack_size = stack_size;
        def.code = code;
        def.constants = constants;
        def.inner_defs = inner_defs;
        def.upvals = upvals;
        def.switch_tables = switch_tables;
        def.line_info = line_info;
        def.locals = locals;
        def.cacheable = cacheable;
        def.cached_func = None;
    }
    Ok(v)
}

fn deser_class(vm: &mut CrocVm) -> ExecResult<Value> {
    let placeholder_name = vm.intern("");
    let class = CrocClass::new(placeholder_name, None);
    let cid = vm.pool.create_class(&mut vm.gc, class);
    let v = Value::class(cid);
    register(vm, v);

    let name = deser_value(vm)?;
    let Some(name_id) = name.as_string_id() else {
        return Err(malformed(vm, "class name must be a string"));
    };
    let parent = if r8(vm)? != 0 {
        let p = deser_value(vm)?;
        match p.as_class_id() {
            Some(pid) => Some(pid),
            None => return Err(malformed(vm, "class parent must be a class")),
        }
    } else {
        None
    };
    let frozen = r8(vm)? != 0;

    if let Some(c) = vm.pool.class_mut(cid) {
        c.name = name_id;
        c.parent = parent;
    }

    for group in 0..3u8 {
        let count = rlen(vm)?;
        for _ in 0..count {
            let k = deser_value(vm)?;
            let Some(key) = k.as_string_id() else {
                return Err(malformed(vm, "class member name must be a string"));
            };
            let val = deser_value(vm)?;
            if let Some(c) = vm.pool.class_mut(cid) {
                match group {
                    0 => c.set_method(key, val),
                    1 => c.set_field(key, val),
                    _ => c.set_hidden_field(key, val),
                }
            }
        }
    }

    if r8(vm)? != 0 {
        let ctor = deser_value(vm)?;
        if let Some(c) = vm.pool.class_mut(cid) {
            c.constructor = Some(ctor);
        }
    }
    if frozen {
        if let Some(c) = vm.pool.class_mut(cid) {
            c.freeze();
        }
    }
    Ok(v)
}

fn deser_instance(vm: &mut CrocVm) -> ExecResult<Value> {
    // Shell first, class after: the stream assigned our ID before the
    // class was written.
    let shell = CrocInstance::new(ClassId(u32::MAX), Vec::new(), Vec::new());
    let iid = vm.pool.create_instance(&mut vm.gc, shell);
    let v = Value::instance(iid);
    register(vm, v);

    let class_value = deser_value(vm)?;
    let Some(class) = class_value.as_class_id() else {
        return Err(malformed(vm, "instance class is not a class"));
    };

    let custom = r8(vm)? != 0;
    if custom {
        // Lay out the default fields, then let opDeserialize pull its own
        // payload.
        let (fields, hidden) = vm.class_field_layout(class);
        if let Some(i) = vm.pool.instance_mut(iid) {
            i.deserialize_fill(class, fields, hidden);
        }
        let Some(hook) = vm.get_metamethod(&v, MetaName::Deserialize) else {
            return Err(malformed(vm, "instance class has no opDeserialize"));
        };
        let stream = vm.new_nativeobj(Box::new(()));
        let pull = vm.new_native_function("deserialize.pull", 0, native_pull);
        vm.call_value(hook, &[v, stream, pull], 0)?;
    } else {
        let mut fields = Vec::new();
        let mut hidden = Vec::new();
        for group in 0..2u8 {
            let count = rlen(vm)?;
            for _ in 0..count {
                let k = deser_value(vm)?;
                let Some(key) = k.as_string_id() else {
                    return Err(malformed(vm, "instance field name must be a string"));
                };
                let val = deser_value(vm)?;
                if group == 0 {
                    fields.push((key, val));
                } else {
                    hidden.push((key, val));
                }
            }
        }
        if let Some(i) = vm.pool.instance_mut(iid) {
            i.deserialize_fill(class, fields, hidden);
        }
    }
    Ok(v)
}

/// The pull callback handed to opDeserialize: reads the next value from
/// the active stream.
fn native_pull(vm: &mut CrocVm, tid: ThreadId, _nargs: usize) -> ExecResult<usize> {
    if vm.active_deser.is_none() {
        return Err(vm.state_error("pull called outside deserialization".into()));
    }
    let v = deser_value(vm)?;
    vm.push(tid, v);
    Ok(1)
}

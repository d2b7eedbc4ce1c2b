// Indexing, slicing, field access and containment.
//
// Index contract: arrays and strings take int indices with negatives
// counting from the end and out-of-range a bounds error; tables yield null
// for missing keys; namespaces raise a field error; instances walk fields,
// then the class chain, then the metamethod.

use crate::gc::GcId;
use crate::value::{StringId, Value, ValueKind};
use crate::vm::{CrocVm, ExecResult, MetaName};

fn norm_element_index(i: i64, len: usize) -> Option<usize> {
    let adj = if i < 0 { i + len as i64 } else { i };
    if adj >= 0 && (adj as usize) < len {
        Some(adj as usize)
    } else {
        None
    }
}

/// Slice bounds accept null (open end) and negatives from the end; the
/// valid range is 0..=len.
fn norm_slice_bound(v: Value, len: usize, default: usize) -> Option<usize> {
    if v.is_null() {
        return Some(default);
    }
    let i = v.as_int()?;
    let adj = if i < 0 { i + len as i64 } else { i };
    if adj >= 0 && (adj as usize) <= len {
        Some(adj as usize)
    } else {
        None
    }
}

pub(crate) fn index_get(vm: &mut CrocVm, container: Value, key: Value) -> ExecResult<Value> {
    match container.kind() {
        ValueKind::Array => {
            let aid = container.as_array_id().expect("kind checked");
            let Some(i) = key.as_int() else {
                return Err(vm.type_error(format!(
                    "array index must be an int, not {}",
                    key.kind().name()
                )));
            };
            let len = vm.pool.array(aid).map(|a| a.len()).unwrap_or(0);
            match norm_element_index(i, len) {
                Some(idx) => Ok(vm.pool.array(aid).and_then(|a| a.get(idx)).unwrap_or_default()),
                None => Err(vm.bounds_error(format!("array index {} out of range (length {})", i, len))),
            }
        }
        ValueKind::String => {
            let sid = container.as_string_id().expect("kind checked");
            let Some(i) = key.as_int() else {
                return Err(vm.type_error(format!(
                    "string index must be an int, not {}",
                    key.kind().name()
                )));
            };
            let len = vm.pool.string(sid).map(|s| s.cp_len()).unwrap_or(0);
            match norm_element_index(i, len) {
                Some(idx) => {
                    let ch = vm.pool.string(sid).and_then(|s| s.char_at(idx));
                    match ch {
                        Some(c) => Ok(vm.new_string(&c.to_string())),
                        None => Ok(Value::null()),
                    }
                }
                None => Err(vm.bounds_error(format!("string index {} out of range (length {})", i, len))),
            }
        }
        ValueKind::Memblock => {
            let mid = container.as_memblock_id().expect("kind checked");
            let Some(i) = key.as_int() else {
                return Err(vm.type_error(format!(
                    "memblock index must be an int, not {}",
                    key.kind().name()
                )));
            };
            let len = vm.pool.memblock(mid).map(|m| m.len()).unwrap_or(0);
            match norm_element_index(i, len) {
                Some(idx) => Ok(Value::int(
                    vm.pool.memblock(mid).and_then(|m| m.get(idx)).unwrap_or(0) as i64,
                )),
                None => Err(vm.bounds_error(format!(
                    "memblock index {} out of range (length {})",
                    i, len
                ))),
            }
        }
        ValueKind::Table => vm.table_get(container, key),
        ValueKind::Namespace => {
            let Some(key_id) = key.as_string_id() else {
                return Err(vm.type_error(format!(
                    "namespace key must be a string, not {}",
                    key.kind().name()
                )));
            };
            let nid = container.as_namespace_id().expect("kind checked");
            match vm.pool.namespace(nid).and_then(|ns| ns.get(key_id)) {
                Some(v) => Ok(v),
                None => {
                    let name = vm.pool.str_of(key_id).to_string();
                    Err(vm.field_error(format!("no member '{}' in namespace", name)))
                }
            }
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&container, MetaName::Index) {
                let r = vm.call_value(mm, &[container, key], 1)?;
                return Ok(r.into_iter().next().unwrap_or_default());
            }
            Err(vm.type_error(format!("cannot index a {}", container.kind().name())))
        }
    }
}

pub(crate) fn index_set(
    vm: &mut CrocVm,
    container: Value,
    key: Value,
    value: Value,
) -> ExecResult<()> {
    match container.kind() {
        ValueKind::Array => {
            let aid = container.as_array_id().expect("kind checked");
            let Some(i) = key.as_int() else {
                return Err(vm.type_error(format!(
                    "array index must be an int, not {}",
                    key.kind().name()
                )));
            };
            let len = vm.pool.array(aid).map(|a| a.len()).unwrap_or(0);
            match norm_element_index(i, len) {
                Some(idx) => {
                    vm.array_set(aid, idx, value);
                    Ok(())
                }
                None => Err(vm.bounds_error(format!("array index {} out of range (length {})", i, len))),
            }
        }
        ValueKind::Memblock => {
            let mid = container.as_memblock_id().expect("kind checked");
            let Some(i) = key.as_int() else {
                return Err(vm.type_error(format!(
                    "memblock index must be an int, not {}",
                    key.kind().name()
                )));
            };
            let Some(byte) = value.as_int().filter(|b| (0..=255).contains(b)) else {
                return Err(vm.range_error("memblock values must be ints in 0..=255".into()));
            };
            let len = vm.pool.memblock(mid).map(|m| m.len()).unwrap_or(0);
            match norm_element_index(i, len) {
                Some(idx) => {
                    if let Some(m) = vm.pool.memblock_mut(mid) {
                        m.set(idx, byte as u8);
                    }
                    Ok(())
                }
                None => Err(vm.bounds_error(format!(
                    "memblock index {} out of range (length {})",
                    i, len
                ))),
            }
        }
        ValueKind::Table => vm.table_set(container, key, value),
        ValueKind::Namespace => {
            let Some(key_id) = key.as_string_id() else {
                return Err(vm.type_error(format!(
                    "namespace key must be a string, not {}",
                    key.kind().name()
                )));
            };
            let nid = container.as_namespace_id().expect("kind checked");
            vm.namespace_set(nid, key_id, value);
            Ok(())
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&container, MetaName::IndexAssign) {
                vm.call_value(mm, &[container, key, value], 0)?;
                return Ok(());
            }
            Err(vm.type_error(format!(
                "cannot index-assign a {}",
                container.kind().name()
            )))
        }
    }
}

pub(crate) fn slice_get(vm: &mut CrocVm, container: Value, lo: Value, hi: Value) -> ExecResult<Value> {
    match container.kind() {
        ValueKind::Array => {
            let aid = container.as_array_id().expect("kind checked");
            let len = vm.pool.array(aid).map(|a| a.len()).unwrap_or(0);
            let (Some(l), Some(h)) = (
                norm_slice_bound(lo, len, 0),
                norm_slice_bound(hi, len, len),
            ) else {
                return Err(vm.bounds_error(format!("invalid array slice bounds (length {})", len)));
            };
            if l > h {
                return Err(vm.bounds_error("slice bounds are reversed".into()));
            }
            let values: Vec<Value> = vm
                .pool
                .array(aid)
                .map(|a| a.values().skip(l).take(h - l).collect())
                .unwrap_or_default();
            Ok(vm.new_array_from(values))
        }
        ValueKind::String => {
            let sid = container.as_string_id().expect("kind checked");
            let len = vm.pool.string(sid).map(|s| s.cp_len()).unwrap_or(0);
            let (Some(l), Some(h)) = (
                norm_slice_bound(lo, len, 0),
                norm_slice_bound(hi, len, len),
            ) else {
                return Err(vm.bounds_error(format!("invalid string slice bounds (length {})", len)));
            };
            if l > h {
                return Err(vm.bounds_error("slice bounds are reversed".into()));
            }
            let piece = vm
                .pool
                .string(sid)
                .and_then(|s| s.slice_cp(l, h))
                .unwrap_or("")
                .to_string();
            Ok(vm.new_string(&piece))
        }
        ValueKind::Memblock => {
            let mid = container.as_memblock_id().expect("kind checked");
            let len = vm.pool.memblock(mid).map(|m| m.len()).unwrap_or(0);
            let (Some(l), Some(h)) = (
                norm_slice_bound(lo, len, 0),
                norm_slice_bound(hi, len, len),
            ) else {
                return Err(vm.bounds_error(format!(
                    "invalid memblock slice bounds (length {})",
                    len
                )));
            };
            if l > h {
                return Err(vm.bounds_error("slice bounds are reversed".into()));
            }
            let bytes = vm
                .pool
                .memblock(mid)
                .map(|m| m.as_bytes()[l..h].to_vec())
                .unwrap_or_default();
            Ok(vm.new_memblock_from(bytes))
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&container, MetaName::Slice) {
                let r = vm.call_value(mm, &[container, lo, hi], 1)?;
                return Ok(r.into_iter().next().unwrap_or_default());
            }
            Err(vm.type_error(format!("cannot slice a {}", container.kind().name())))
        }
    }
}

pub(crate) fn slice_set(
    vm: &mut CrocVm,
    container: Value,
    lo: Value,
    hi: Value,
    value: Value,
) -> ExecResult<()> {
    match container.kind() {
        ValueKind::Array => {
            let aid = container.as_array_id().expect("kind checked");
            let len = vm.pool.array(aid).map(|a| a.len()).unwrap_or(0);
            let (Some(l), Some(h)) = (
                norm_slice_bound(lo, len, 0),
                norm_slice_bound(hi, len, len),
            ) else {
                return Err(vm.bounds_error(format!("invalid array slice bounds (length {})", len)));
            };
            let Some(src) = value.as_array_id() else {
                return Err(vm.type_error(format!(
                    "array slice-assign needs an array, not {}",
                    value.kind().name()
                )));
            };
            let src_values: Vec<Value> = vm
                .pool
                .array(src)
                .map(|a| a.values().collect())
                .unwrap_or_default();
            if src_values.len() != h.saturating_sub(l) {
                return Err(vm.range_error(format!(
                    "slice-assign length mismatch: {} into {}",
                    src_values.len(),
                    h.saturating_sub(l)
                )));
            }
            for (i, v) in src_values.into_iter().enumerate() {
                vm.array_set(aid, l + i, v);
            }
            Ok(())
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&container, MetaName::SliceAssign) {
                vm.call_value(mm, &[container, lo, hi, value], 0)?;
                return Ok(());
            }
            Err(vm.type_error(format!(
                "cannot slice-assign a {}",
                container.kind().name()
            )))
        }
    }
}

/// Field access: `obj.name`.
pub(crate) fn field_get(vm: &mut CrocVm, obj: Value, name: Value) -> ExecResult<Value> {
    let Some(key) = name.as_string_id() else {
        return Err(vm.type_error(format!("field name must be a string, not {}", name.kind().name())));
    };
    match obj.kind() {
        ValueKind::Namespace => {
            let nid = obj.as_namespace_id().expect("kind checked");
            match vm.pool.namespace(nid).and_then(|ns| ns.get(key)) {
                Some(v) => Ok(v),
                None => {
                    let n = vm.pool.str_of(key).to_string();
                    Err(vm.field_error(format!("no member '{}' in namespace", n)))
                }
            }
        }
        ValueKind::Table => vm.table_get(obj, name),
        ValueKind::Instance => instance_field_get(vm, obj, key),
        ValueKind::Class => {
            let cid = obj.as_class_id().expect("kind checked");
            if let Some(m) = vm.find_method(cid, key) {
                return Ok(m);
            }
            if let Some(v) = vm.find_class_field(cid, key) {
                return Ok(v);
            }
            let n = vm.pool.str_of(key).to_string();
            Err(vm.field_error(format!("no member '{}' in class", n)))
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&obj, MetaName::Field) {
                let r = vm.call_value(mm, &[obj, name], 1)?;
                return Ok(r.into_iter().next().unwrap_or_default());
            }
            Err(vm.type_error(format!(
                "cannot access fields of a {}",
                obj.kind().name()
            )))
        }
    }
}

/// The Instance lookup chain: own fields, then hidden fields (privileged
/// access only), then the class chain, then the metamethod.
fn instance_field_get(vm: &mut CrocVm, obj: Value, key: StringId) -> ExecResult<Value> {
    let iid = obj.as_instance_id().expect("instance");
    let (field, class) = match vm.pool.instance(iid) {
        Some(inst) => (inst.get_field(key), inst.class),
        None => return Err(vm.value_error("dangling instance".into())),
    };
    if let Some(v) = field {
        return Ok(v);
    }
    if instance_access_is_privileged(vm, class) {
        let hidden = vm
            .pool
            .instance(iid)
            .and_then(|i| i.get_hidden_field(key))
            .or_else(|| vm.find_class_hidden_field(class, key));
        if let Some(v) = hidden {
            return Ok(v);
        }
    }
    if let Some(m) = vm.find_method(class, key) {
        return Ok(m);
    }
    if let Some(v) = vm.find_class_field(class, key) {
        return Ok(v);
    }
    if let Some(mm) = vm.get_metamethod(&obj, MetaName::Index) {
        let name = Value::string(key);
        let r = vm.call_value(mm, &[obj, name], 1)?;
        return Ok(r.into_iter().next().unwrap_or_default());
    }
    let n = vm.pool.str_of(key).to_string();
    Err(vm.field_error(format!("no field '{}' in instance", n)))
}

fn instance_access_is_privileged(vm: &CrocVm, class: crate::value::ClassId) -> bool {
    vm.current_function()
        .map(|f| vm.is_privileged_for(class, f))
        .unwrap_or(false)
}

/// Field assignment: `obj.name = value`.
pub(crate) fn field_set(vm: &mut CrocVm, obj: Value, name: Value, value: Value) -> ExecResult<()> {
    let Some(key) = name.as_string_id() else {
        return Err(vm.type_error(format!("field name must be a string, not {}", name.kind().name())));
    };
    match obj.kind() {
        ValueKind::Namespace => {
            let nid = obj.as_namespace_id().expect("kind checked");
            vm.namespace_set(nid, key, value);
            Ok(())
        }
        ValueKind::Table => vm.table_set(obj, name, value),
        ValueKind::Instance => {
            let iid = obj.as_instance_id().expect("kind checked");
            let ok = vm
                .pool
                .instance_mut(iid)
                .map(|i| i.set_field(key, value))
                .unwrap_or(false);
            if ok {
                vm.gc.barrier_back(GcId::Instance(iid), &mut vm.pool);
                return Ok(());
            }
            // Privileged code may assign the instance's hidden fields.
            let class = vm.pool.instance(iid).map(|i| i.class);
            if let Some(class) = class {
                if instance_access_is_privileged(vm, class) {
                    let ok = vm
                        .pool
                        .instance_mut(iid)
                        .map(|i| i.set_hidden_field(key, value))
                        .unwrap_or(false);
                    if ok {
                        vm.gc.barrier_back(GcId::Instance(iid), &mut vm.pool);
                        return Ok(());
                    }
                }
            }
            if let Some(mm) = vm.get_metamethod(&obj, MetaName::FieldAssign) {
                vm.call_value(mm, &[obj, name, value], 0)?;
                return Ok(());
            }
            // Instance size is fixed at allocation; unknown fields are
            // errors, not additions.
            let n = vm.pool.str_of(key).to_string();
            Err(vm.field_error(format!("no field '{}' in instance", n)))
        }
        ValueKind::Class => {
            let cid = obj.as_class_id().expect("kind checked");
            let frozen = vm.pool.class(cid).map(|c| c.is_frozen()).unwrap_or(true);
            if frozen {
                return Err(vm.state_error("cannot modify a frozen class".into()));
            }
            if let Some(c) = vm.pool.class_mut(cid) {
                c.set_field(key, value);
            }
            vm.gc.barrier_back(GcId::Class(cid), &mut vm.pool);
            Ok(())
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&obj, MetaName::FieldAssign) {
                vm.call_value(mm, &[obj, name, value], 0)?;
                return Ok(());
            }
            Err(vm.type_error(format!(
                "cannot assign fields of a {}",
                obj.kind().name()
            )))
        }
    }
}

/// Method-vs-field disambiguation for call sites: methods win on instances
/// and classes, everything else degrades to plain field lookup.
pub(crate) fn method_of(vm: &mut CrocVm, obj: Value, name: Value) -> ExecResult<Value> {
    let Some(key) = name.as_string_id() else {
        return Err(vm.type_error(format!(
            "method name must be a string, not {}",
            name.kind().name()
        )));
    };
    match obj.kind() {
        ValueKind::Instance => {
            let iid = obj.as_instance_id().expect("kind checked");
            let class = match vm.pool.instance(iid) {
                Some(i) => i.class,
                None => return Err(vm.value_error("dangling instance".into())),
            };
            if let Some(m) = vm.find_method(class, key) {
                return Ok(m);
            }
            instance_field_get(vm, obj, key)
        }
        ValueKind::Class => {
            let cid = obj.as_class_id().expect("kind checked");
            if let Some(m) = vm.find_method(cid, key) {
                return Ok(m);
            }
            field_get(vm, obj, name)
        }
        _ => field_get(vm, obj, name),
    }
}

/// The `in` operator.
pub(crate) fn in_values(vm: &mut CrocVm, item: Value, container: Value) -> ExecResult<bool> {
    match container.kind() {
        ValueKind::String => {
            let Some(needle) = item.as_string_id() else {
                return Err(vm.type_error(format!(
                    "cannot search a string for a {}",
                    item.kind().name()
                )));
            };
            let sid = container.as_string_id().expect("kind checked");
            let needle_str = vm.pool.str_of(needle).to_string();
            Ok(vm
                .pool
                .string(sid)
                .map(|s| s.contains(&needle_str))
                .unwrap_or(false))
        }
        ValueKind::Array => {
            let aid = container.as_array_id().expect("kind checked");
            Ok(vm.pool.array(aid).map(|a| a.contains(&item)).unwrap_or(false))
        }
        ValueKind::Table => {
            let tid = container.as_table_id().expect("kind checked");
            Ok(vm
                .pool
                .table(tid)
                .and_then(|t| t.contains_key(&item).ok())
                .unwrap_or(false))
        }
        ValueKind::Namespace => {
            let Some(key) = item.as_string_id() else {
                return Ok(false);
            };
            let nid = container.as_namespace_id().expect("kind checked");
            Ok(vm
                .pool
                .namespace(nid)
                .map(|ns| ns.contains(key))
                .unwrap_or(false))
        }
        _ => {
            if let Some(mm) = vm.get_metamethod(&container, MetaName::In) {
                let r = vm.call_value(mm, &[container, item], 1)?;
                return Ok(r.into_iter().next().unwrap_or_default().is_truthy());
            }
            Err(vm.type_error(format!(
                "cannot use 'in' on a {}",
                container.kind().name()
            )))
        }
    }
}

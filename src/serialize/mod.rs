// Object-graph serialization.
//
// A self-describing binary format: a 5-byte signature (endianness, word
// size, int size, float size, version), then a tagged value graph. Each
// reference object is assigned a sequential back-reference ID the first
// time it is written; later encounters emit a backref tag and the ID.
// Back-reference IDs are assigned on write, so the reader builds container
// shells first and fills fields afterwards - that is what lets arbitrary
// cycles round-trip.
//
// The transients map is consulted before every value: a hit writes the
// replacement under a transient tag, and the reader's inverse map restores
// the original. This is also how unserializable values (native objects,
// threads, host handles) are smuggled across.

mod reader;
mod writer;

pub(crate) use reader::ReadState;
pub(crate) use writer::WriteState;

use crate::value::{FuncDefId, StringId, TableId, Value};
use crate::vm::{CrocVm, ExecResult};

/// Serial format version.
pub const FORMAT_VERSION: u8 = 1;

/// Module stream magic.
pub const MODULE_MAGIC: &[u8; 4] = b"Croc";

// Wire tags. Values use their ValueKind discriminant; the two structural
// tags sit above the kind range.
pub(crate) const TAG_BACKREF: u8 = 0x20;
pub(crate) const TAG_TRANSIENT: u8 = 0x21;

// ============ Varints ============
// Signed LEB128: 7 data bits per byte, MSB continuation, sign extension
// taken from bit 0x40 of the final byte.

pub(crate) fn write_varint(buf: &mut Vec<u8>, mut v: i64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn read_varint(data: &[u8], pos: &mut usize) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some(result);
        }
        if shift >= 64 {
            return None;
        }
    }
}

pub(crate) fn signature() -> [u8; 5] {
    let endian = if cfg!(target_endian = "little") { 0 } else { 1 };
    [
        endian,
        std::mem::size_of::<usize>() as u8,
        8, // int size
        8, // float size
        FORMAT_VERSION,
    ]
}

// ============ Entry points ============

pub(crate) fn serialize_graph(
    vm: &mut CrocVm,
    root: Value,
    transients: Option<TableId>,
) -> ExecResult<Vec<u8>> {
    if vm.active_ser.is_some() {
        return Err(vm.state_error("a serialization is already in progress".into()));
    }
    let mut state = WriteState::new(transients);
    state.buf.extend_from_slice(&signature());
    vm.active_ser = Some(state);

    // An opSerialize hook may run script and trigger the collector; the
    // root must stay reachable for the duration.
    let root_pin = vm.pin(root);

    // Yielding with a serializer on the Rust stack is undefined; forbid it.
    let tid = vm.current_thread();
    let prev_yield = set_yield_allowed(vm, tid, false);

    let result = writer::ser_value(vm, root);

    set_yield_allowed(vm, tid, prev_yield);
    vm.unpin(root_pin);
    let state = vm.active_ser.take().expect("serializer state present");
    result?;
    Ok(state.buf)
}

pub(crate) fn deserialize_graph(
    vm: &mut CrocVm,
    bytes: &[u8],
    transients: Option<TableId>,
) -> ExecResult<Value> {
    if vm.active_deser.is_some() {
        return Err(vm.state_error("a deserialization is already in progress".into()));
    }
    if bytes.len() < 5 {
        let c = vm.exc.eof_error;
        return Err(vm.throw_class(c, "truncated serialized stream".into()));
    }
    let sig = signature();
    if bytes[..5] != sig {
        let c = vm.exc.value_error;
        return Err(vm.throw_class(
            c,
            "serialized stream signature does not match this platform".into(),
        ));
    }

    vm.active_deser = Some(ReadState::new(bytes[5..].to_vec(), transients));

    let tid = vm.current_thread();
    let prev_yield = set_yield_allowed(vm, tid, false);

    let result = reader::deser_value(vm);

    set_yield_allowed(vm, tid, prev_yield);
    vm.active_deser = None;
    result
}

/// A module is the ASCII magic `Croc` followed by a graph whose root is the
/// two-element sequence [name, top-level FuncDef]. The FuncDef must be
/// cacheable and not yet cached.
pub(crate) fn serialize_module(vm: &mut CrocVm, name: &str, def: FuncDefId) -> ExecResult<Vec<u8>> {
    let (cacheable, cached) = match vm.pool().funcdef(def) {
        Some(d) => (d.cacheable, d.cached_func.is_some()),
        None => {
            return Err(vm.value_error("dangling funcdef".into()));
        }
    };
    if !cacheable || cached {
        let c = vm.exc.import_error;
        return Err(vm.throw_class(
            c,
            "module top-level funcdef must be cacheable and not yet cached".into(),
        ));
    }

    let name_value = vm.new_string(name);
    let root = vm.new_array_from(vec![name_value, Value::funcdef(def)]);
    let graph = serialize_graph(vm, root, None)?;

    let mut out = Vec::with_capacity(4 + graph.len());
    out.extend_from_slice(MODULE_MAGIC);
    out.extend_from_slice(&graph);
    Ok(out)
}

pub(crate) fn deserialize_module(
    vm: &mut CrocVm,
    bytes: &[u8],
) -> ExecResult<(StringId, FuncDefId)> {
    if bytes.len() < 4 || &bytes[..4] != MODULE_MAGIC {
        let c = vm.exc.import_error;
        return Err(vm.throw_class(c, "not a croc module stream".into()));
    }
    let root = deserialize_graph(vm, &bytes[4..], None)?;

    let bad = |vm: &mut CrocVm| {
        let c = vm.exc.import_error;
        Err(vm.throw_class(c, "module root must be [name, funcdef]".into()))
    };
    let Some(aid) = root.as_array_id() else {
        return bad(vm);
    };
    let (name, def) = {
        let Some(arr) = vm.pool().array(aid) else {
            return bad(vm);
        };
        if arr.len() != 2 {
            return bad(vm);
        }
        (arr.get(0).unwrap_or_default(), arr.get(1).unwrap_or_default())
    };
    let (Some(name_id), Some(def_id)) = (name.as_string_id(), def.as_funcdef_id()) else {
        return bad(vm);
    };

    let (cacheable, cached) = match vm.pool().funcdef(def_id) {
        Some(d) => (d.cacheable, d.cached_func.is_some()),
        None => return bad(vm),
    };
    if !cacheable || cached {
        let c = vm.exc.import_error;
        return Err(vm.throw_class(
            c,
            "module top-level funcdef must be cacheable and not yet cached".into(),
        ));
    }
    Ok((name_id, def_id))
}

fn set_yield_allowed(vm: &mut CrocVm, tid: crate::value::ThreadId, allowed: bool) -> bool {
    match vm.pool.thread_mut(tid) {
        Some(t) => {
            let prev = t.yield_allowed;
            t.yield_allowed = allowed;
            prev
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        let cases = [0i64, 1, -1, 63, 64, -64, -65, 127, 128, 300, -300, i64::MAX, i64::MIN];
        for &v in &cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos), Some(v), "value {}", v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn varint_single_byte_boundaries() {
        for &(v, len) in &[(0i64, 1usize), (63, 1), (-64, 1), (64, 2), (-65, 2)] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(buf.len(), len, "value {}", v);
        }
    }
}

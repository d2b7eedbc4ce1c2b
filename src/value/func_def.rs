// FuncDef: immutable compiled function definition produced by the bytecode
// emitter. Constants, code, inner definitions, upvalue descriptors, switch
// tables and debug info.

use crate::value::{FuncDefId, FunctionId, StringId, Value};
use ahash::RandomState;
use std::collections::HashMap;

/// Where an inner function's upvalue comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalDesc {
    /// Captures a local slot of the enclosing frame.
    Local(u32),
    /// Captures an upvalue of the enclosing function.
    Upval(u32),
}

/// Compiled switch: case value to jump offset, plus a default offset.
pub struct SwitchTable {
    pub offsets: HashMap<Value, i32, RandomState>,
    pub default_offset: i32,
}

impl SwitchTable {
    pub fn new(cases: Vec<(Value, i32)>, default_offset: i32) -> Self {
        let mut offsets = HashMap::with_hasher(RandomState::new());
        for (v, off) in cases {
            offsets.insert(v.normalized_key(), off);
        }
        SwitchTable { offsets, default_offset }
    }

    pub fn lookup(&self, value: &Value) -> i32 {
        self.offsets
            .get(&value.normalized_key())
            .copied()
            .unwrap_or(self.default_offset)
    }
}

/// Debug record for one local variable.
pub struct LocalVarDesc {
    pub name: StringId,
    pub pc_start: u32,
    pub pc_end: u32,
    pub slot: u32,
}

pub struct FuncDef {
    pub name: StringId,
    pub num_params: u32,
    /// One accepted-type bit set per parameter (bit = ValueKind discriminant).
    pub param_masks: Vec<u32>,
    pub is_vararg: bool,
    /// Register slots this function needs.
    pub stack_size: u32,
    pub constants: Vec<Value>,
    pub code: Vec<u32>,
    pub inner_defs: Vec<FuncDefId>,
    pub upvals: Vec<UpvalDesc>,
    pub switch_tables: Vec<SwitchTable>,
    /// Source line per instruction.
    pub line_info: Vec<u32>,
    pub locals: Vec<LocalVarDesc>,
    /// True when the def has no free upvalues: its closure is computed once
    /// and reused.
    pub cacheable: bool,
    pub cached_func: Option<FunctionId>,
}

impl FuncDef {
    pub fn new(name: StringId, num_params: u32, stack_size: u32) -> Self {
        FuncDef {
            name,
            num_params,
            param_masks: vec![crate::value::TYPE_MASK_ANY; num_params as usize],
            is_vararg: false,
            stack_size,
            constants: Vec::new(),
            code: Vec::new(),
            inner_defs: Vec::new(),
            upvals: Vec::new(),
            switch_tables: Vec::new(),
            line_info: Vec::new(),
            locals: Vec::new(),
            cacheable: true,
            cached_func: None,
        }
    }

    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

// Activation records and try-records.

use crate::value::FunctionId;

/// One frame on a thread's call stack.
#[derive(Clone)]
pub struct ActRecord {
    pub func: FunctionId,
    /// First register slot of this frame (absolute stack index).
    pub base: usize,
    /// Start of the vararg region (absolute); varargs live below base.
    pub vararg_base: usize,
    pub num_varargs: usize,
    /// Where results are copied on return (absolute; the callee slot).
    pub ret_slot: usize,
    /// Caller's logical top, restored after the call completes.
    pub saved_top: usize,
    /// Results the caller expects; -1 means "all".
    pub expected_results: i32,
    pub pc: usize,
    /// Fused tail calls through this record, for diagnostics.
    pub num_tailcalls: u32,
    /// try_records length at frame entry; records above it belong here.
    pub try_base: usize,
    pub is_native: bool,
}

impl ActRecord {
    pub fn new_script(
        func: FunctionId,
        base: usize,
        ret_slot: usize,
        saved_top: usize,
        expected_results: i32,
        try_base: usize,
    ) -> Self {
        ActRecord {
            func,
            base,
            vararg_base: base,
            num_varargs: 0,
            ret_slot,
            saved_top,
            expected_results,
            pc: 0,
            num_tailcalls: 0,
            try_base,
            is_native: false,
        }
    }

    pub fn new_native(
        func: FunctionId,
        base: usize,
        ret_slot: usize,
        saved_top: usize,
        expected_results: i32,
        try_base: usize,
    ) -> Self {
        ActRecord {
            func,
            base,
            vararg_base: base,
            num_varargs: 0,
            ret_slot,
            saved_top,
            expected_results,
            pc: 0,
            num_tailcalls: 0,
            try_base,
            is_native: true,
        }
    }
}

/// One entry on a thread's exception-handler stack.
#[derive(Clone, Copy)]
pub struct TryRecord {
    /// Catch record (lands the exception in a slot) vs finally record.
    pub is_catch: bool,
    /// Absolute stack slot reserved for the caught exception.
    pub slot: usize,
    /// Index of the owning activation record.
    pub act_record: usize,
    /// Handler program counter.
    pub pc: usize,
}

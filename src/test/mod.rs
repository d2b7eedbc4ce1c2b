// Integration tests for the execution core.
// There is no compiler in this crate, so the suites hand-assemble FuncDefs.

mod test_api;
mod test_coroutine;
mod test_exceptions;
mod test_gc;
mod test_serialize;
mod test_values;

use crate::value::FuncDef;
use crate::{CrocVm, Instruction, Value, VmOptions};

pub(crate) fn new_vm() -> CrocVm {
    CrocVm::new(VmOptions::default())
}

/// Assemble a FuncDef from constants and instructions.
pub(crate) fn make_def(
    vm: &mut CrocVm,
    name: &str,
    num_params: u32,
    stack_size: u32,
    constants: Vec<Value>,
    code: Vec<Instruction>,
) -> FuncDef {
    let name_id = vm.intern(name);
    let mut def = FuncDef::new(name_id, num_params, stack_size);
    def.constants = constants;
    def.code = code.into_iter().map(|i| i.0).collect();
    def.line_info = vec![1; def.code.len()];
    def
}

/// Register a def and close it into a callable function.
pub(crate) fn install(vm: &mut CrocVm, def: FuncDef) -> Value {
    let id = vm.new_funcdef(def);
    vm.new_function(id, None).expect("closing funcdef")
}

/// First result as an int, for the common single-int-result shape.
pub(crate) fn int1(results: &[Value]) -> i64 {
    results
        .first()
        .and_then(|v| v.as_int())
        .expect("expected an int result")
}

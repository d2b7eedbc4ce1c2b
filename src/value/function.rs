// Function: a FuncDef closed over upvalues and an environment namespace, or
// a native function with inline upvalue storage.

use crate::value::{FuncDefId, NamespaceId, StringId, ThreadId, UpvalueId, Value};
use crate::vm::{CrocVm, ExecError};

/// Native function: receives the VM, the calling thread and the argument
/// count, reads arguments through the thread's frame window, and returns how
/// many results it left at the bottom of that window.
pub type NativeFn = fn(&mut CrocVm, ThreadId, usize) -> Result<usize, ExecError>;

pub enum FuncBody {
    Script {
        def: FuncDefId,
        upvals: Vec<UpvalueId>,
    },
    Native {
        func: NativeFn,
        upvals: Vec<Value>,
    },
}

pub struct CrocFunction {
    pub name: StringId,
    pub env: NamespaceId,
    pub num_params: u32,
    pub max_params: u32,
    pub body: FuncBody,
}

impl CrocFunction {
    pub fn script(
        name: StringId,
        env: NamespaceId,
        num_params: u32,
        def: FuncDefId,
        upvals: Vec<UpvalueId>,
    ) -> Self {
        CrocFunction {
            name,
            env,
            num_params,
            max_params: num_params,
            body: FuncBody::Script { def, upvals },
        }
    }

    pub fn native(name: StringId, env: NamespaceId, max_params: u32, func: NativeFn) -> Self {
        CrocFunction {
            name,
            env,
            num_params: 0,
            max_params,
            body: FuncBody::Native {
                func,
                upvals: Vec::new(),
            },
        }
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        matches!(self.body, FuncBody::Native { .. })
    }

    #[inline(always)]
    pub fn script_def(&self) -> Option<FuncDefId> {
        match &self.body {
            FuncBody::Script { def, .. } => Some(*def),
            _ => None,
        }
    }
}

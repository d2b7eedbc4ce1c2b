// Croc Runtime Core
// Values, managed heap with incremental GC, bytecode interpreter,
// coroutines and object-graph serialization.

#[cfg(test)]
mod test;

pub mod gc;
pub mod serialize;
pub mod value;
pub mod vm;

pub use gc::{GcId, GcStats, ObjectPool};
pub use value::{
    ArrayId, ClassId, FuncDefId, FunctionId, InstanceId, MemblockId, NamespaceId, NativeObjId,
    StringId, TableId, ThreadId, UpvalueId, Value, ValueKind, WeakRefId,
};
pub use vm::{CrocVm, ExecError, ExecResult, Instruction, NativeFn, OpCode, VmOptions};

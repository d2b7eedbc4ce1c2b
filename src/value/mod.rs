// Value layer: the tagged Value plus every reference-typed data object.

mod array;
mod class;
mod func_def;
mod function;
mod ids;
mod memblock;
mod namespace;
mod string;
mod table;
mod thread;
mod value;

pub use array::{ArraySlot, CrocArray};
pub use class::{CrocClass, CrocInstance};
pub use func_def::{FuncDef, LocalVarDesc, SwitchTable, UpvalDesc};
pub use function::{CrocFunction, FuncBody, NativeFn};
pub use ids::*;
pub use memblock::CrocMemblock;
pub use namespace::CrocNamespace;
pub use string::CrocString;
pub use table::{CrocTable, TableKeyError};
pub use thread::{hook_bits, CrocThread, HookState, ThreadState};
pub use value::{Value, ValueKind, NUM_KINDS, TYPE_MASK_ANY};

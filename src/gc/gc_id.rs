// Unified GC object identifier: a typed u32 arena index.

use crate::value::*;

/// Object type tags for GC-managed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GcType {
    String,
    Table,
    Namespace,
    Array,
    Memblock,
    Function,
    FuncDef,
    Class,
    Instance,
    Thread,
    Upvalue,
    WeakRef,
    NativeObj,
}

impl GcType {
    /// Leaf types hold no traced references and are marked black directly.
    /// They can never participate in a cycle.
    #[inline(always)]
    pub fn is_acyclic(self) -> bool {
        matches!(
            self,
            GcType::String | GcType::Memblock | GcType::WeakRef | GcType::NativeObj
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcId {
    String(StringId),
    Table(TableId),
    Namespace(NamespaceId),
    Array(ArrayId),
    Memblock(MemblockId),
    Function(FunctionId),
    FuncDef(FuncDefId),
    Class(ClassId),
    Instance(InstanceId),
    Thread(ThreadId),
    Upvalue(UpvalueId),
    WeakRef(WeakRefId),
    NativeObj(NativeObjId),
}

impl GcId {
    #[inline(always)]
    pub fn gc_type(self) -> GcType {
        match self {
            GcId::String(_) => GcType::String,
            GcId::Table(_) => GcType::Table,
            GcId::Namespace(_) => GcType::Namespace,
            GcId::Array(_) => GcType::Array,
            GcId::Memblock(_) => GcType::Memblock,
            GcId::Function(_) => GcType::Function,
            GcId::FuncDef(_) => GcType::FuncDef,
            GcId::Class(_) => GcType::Class,
            GcId::Instance(_) => GcType::Instance,
            GcId::Thread(_) => GcType::Thread,
            GcId::Upvalue(_) => GcType::Upvalue,
            GcId::WeakRef(_) => GcType::WeakRef,
            GcId::NativeObj(_) => GcType::NativeObj,
        }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        match self {
            GcId::String(StringId(i)) => i,
            GcId::Table(TableId(i)) => i,
            GcId::Namespace(NamespaceId(i)) => i,
            GcId::Array(ArrayId(i)) => i,
            GcId::Memblock(MemblockId(i)) => i,
            GcId::Function(FunctionId(i)) => i,
            GcId::FuncDef(FuncDefId(i)) => i,
            GcId::Class(ClassId(i)) => i,
            GcId::Instance(InstanceId(i)) => i,
            GcId::Thread(ThreadId(i)) => i,
            GcId::Upvalue(UpvalueId(i)) => i,
            GcId::WeakRef(WeakRefId(i)) => i,
            GcId::NativeObj(NativeObjId(i)) => i,
        }
    }

    /// The GcId of a value, if it is GC-managed.
    pub fn of_value(v: &Value) -> Option<GcId> {
        match v.kind() {
            ValueKind::String => v.as_string_id().map(GcId::String),
            ValueKind::Table => v.as_table_id().map(GcId::Table),
            ValueKind::Namespace => v.as_namespace_id().map(GcId::Namespace),
            ValueKind::Array => v.as_array_id().map(GcId::Array),
            ValueKind::Memblock => v.as_memblock_id().map(GcId::Memblock),
            ValueKind::Function => v.as_function_id().map(GcId::Function),
            ValueKind::FuncDef => v.as_funcdef_id().map(GcId::FuncDef),
            ValueKind::Class => v.as_class_id().map(GcId::Class),
            ValueKind::Instance => v.as_instance_id().map(GcId::Instance),
            ValueKind::Thread => v.as_thread_id().map(GcId::Thread),
            ValueKind::Upvalue => v.as_upvalue_id().map(GcId::Upvalue),
            ValueKind::WeakRef => v.as_weakref_id().map(GcId::WeakRef),
            ValueKind::NativeObj => v.as_nativeobj_id().map(GcId::NativeObj),
            _ => None,
        }
    }
}

// Typed arena storage for all GC-managed objects.
//
// 1. Values store type tag + object ID (no pointers - Vec may relocate)
// 2. Arena uses Vec<Option<T>> with a free list for O(1) alloc/free
// 3. GC headers embedded in objects for mark-sweep
// 4. Every allocation is reported to the collector for byte accounting

use crate::gc::gc_object::*;
use crate::gc::{Gc, GcId, StringInterner};
use crate::value::*;
use ahash::RandomState;
use std::any::Any;
use std::collections::HashMap;

// ============ Arena Storage ============

/// Type-safe arena for GC objects. None marks a free slot.
pub struct Arena<T> {
    storage: Vec<Option<T>>,
    free_list: Vec<u32>,
    count: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            free_list: Vec::new(),
            count: 0,
        }
    }

    /// Allocate a new object and return its index.
    #[inline]
    pub fn alloc(&mut self, value: T) -> u32 {
        self.count += 1;
        if let Some(free_id) = self.free_list.pop() {
            self.storage[free_id as usize] = Some(value);
            free_id
        } else {
            let id = self.storage.len() as u32;
            self.storage.push(Some(value));
            id
        }
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.storage.get(id as usize).and_then(|opt| opt.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.storage
            .get_mut(id as usize)
            .and_then(|opt| opt.as_mut())
    }

    /// Mark a slot free for reuse, dropping its payload.
    #[inline]
    pub fn free(&mut self, id: u32) -> Option<T> {
        let slot = self.storage.get_mut(id as usize)?;
        let taken = slot.take();
        if taken.is_some() {
            self.free_list.push(id);
            self.count -= 1;
        }
        taken
    }

    #[inline(always)]
    pub fn is_valid(&self, id: u32) -> bool {
        matches!(self.storage.get(id as usize), Some(Some(_)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.storage
            .iter()
            .enumerate()
            .filter_map(|(i, opt)| opt.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.storage
            .iter_mut()
            .enumerate()
            .filter_map(|(i, opt)| opt.as_mut().map(|v| (i as u32, v)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Size accounting ============

// Rough per-object sizes for GC debt. Payload bytes are added where they
// dominate (strings, memblocks, arrays).
pub const SIZE_STRING: usize = 64;
pub const SIZE_TABLE: usize = 256;
pub const SIZE_NAMESPACE: usize = 192;
pub const SIZE_ARRAY: usize = 96;
pub const SIZE_MEMBLOCK: usize = 48;
pub const SIZE_FUNCTION: usize = 128;
pub const SIZE_FUNCDEF: usize = 512;
pub const SIZE_CLASS: usize = 320;
pub const SIZE_INSTANCE: usize = 160;
pub const SIZE_THREAD: usize = 1024;
pub const SIZE_UPVALUE: usize = 32;
pub const SIZE_WEAKREF: usize = 24;
pub const SIZE_NATIVEOBJ: usize = 48;

pub fn size_of_type(t: crate::gc::GcType) -> usize {
    use crate::gc::GcType::*;
    match t {
        String => SIZE_STRING,
        Table => SIZE_TABLE,
        Namespace => SIZE_NAMESPACE,
        Array => SIZE_ARRAY,
        Memblock => SIZE_MEMBLOCK,
        Function => SIZE_FUNCTION,
        FuncDef => SIZE_FUNCDEF,
        Class => SIZE_CLASS,
        Instance => SIZE_INSTANCE,
        Thread => SIZE_THREAD,
        Upvalue => SIZE_UPVALUE,
        WeakRef => SIZE_WEAKREF,
        NativeObj => SIZE_NATIVEOBJ,
    }
}

// ============ Object Pool ============

/// All GC objects of one VM, stored in typed arenas and addressed by ID.
pub struct ObjectPool {
    pub strings: Arena<GcBox<CrocString>>,
    pub tables: Arena<GcBox<CrocTable>>,
    pub namespaces: Arena<GcBox<CrocNamespace>>,
    pub arrays: Arena<GcBox<CrocArray>>,
    pub memblocks: Arena<GcBox<CrocMemblock>>,
    pub functions: Arena<GcBox<CrocFunction>>,
    pub funcdefs: Arena<GcBox<FuncDef>>,
    pub classes: Arena<GcBox<CrocClass>>,
    pub instances: Arena<GcBox<CrocInstance>>,
    pub threads: Arena<GcBox<CrocThread>>,
    pub upvalues: Arena<GcBox<CrocUpvalue>>,
    pub weakrefs: Arena<GcBox<CrocWeakRef>>,
    pub nativeobjs: Arena<GcBox<CrocNativeObj>>,

    pub(crate) interner: StringInterner,
    /// Referent identity -> its unique weak ref.
    pub(crate) weakref_table: HashMap<GcId, WeakRefId, RandomState>,

    /// Debug mode: scrub freed payloads.
    pub stomp_freed: bool,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Arena::new(),
            tables: Arena::new(),
            namespaces: Arena::new(),
            arrays: Arena::new(),
            memblocks: Arena::new(),
            functions: Arena::new(),
            funcdefs: Arena::new(),
            classes: Arena::new(),
            instances: Arena::new(),
            threads: Arena::new(),
            upvalues: Arena::new(),
            weakrefs: Arena::new(),
            nativeobjs: Arena::new(),
            interner: StringInterner::new(),
            weakref_table: HashMap::with_hasher(RandomState::new()),
            stomp_freed: false,
        }
    }

    // ============ Creation entry points ============

    /// Intern a string: same content always returns the same id. A condemned
    /// (white, not yet swept) entry is resurrected instead of duplicated.
    pub fn create_string(&mut self, gc: &mut Gc, s: &str) -> StringId {
        let hash = self.interner.hash_str(s);

        let mut found = None;
        for &id in self.interner.candidates(hash) {
            if let Some(obj) = self.strings.get(id.0) {
                if obj.data.as_str() == s {
                    found = Some(id);
                    break;
                }
            }
        }

        if let Some(id) = found {
            if let Some(obj) = self.strings.get_mut(id.0) {
                if obj.header.is_white() {
                    obj.header.make_black();
                }
            }
            return id;
        }

        let size = SIZE_STRING + s.len();
        let id = StringId(
            self.strings
                .alloc(GcBox::new(CrocString::new(s.to_string(), hash))),
        );
        self.interner.insert(hash, id);
        gc.record_allocation(size);
        id
    }

    pub fn create_table(&mut self, gc: &mut Gc) -> TableId {
        gc.record_allocation(SIZE_TABLE);
        TableId(self.tables.alloc(GcBox::new(CrocTable::new())))
    }

    pub fn create_namespace(
        &mut self,
        gc: &mut Gc,
        name: StringId,
        parent: Option<NamespaceId>,
    ) -> NamespaceId {
        gc.record_allocation(SIZE_NAMESPACE);
        NamespaceId(
            self.namespaces
                .alloc(GcBox::new(CrocNamespace::new(name, parent))),
        )
    }

    pub fn create_array(&mut self, gc: &mut Gc, len: usize) -> ArrayId {
        gc.record_allocation(SIZE_ARRAY + len * std::mem::size_of::<Value>());
        ArrayId(self.arrays.alloc(GcBox::new(CrocArray::new(len))))
    }

    pub fn create_array_from(&mut self, gc: &mut Gc, values: Vec<Value>) -> ArrayId {
        gc.record_allocation(SIZE_ARRAY + values.len() * std::mem::size_of::<Value>());
        ArrayId(self.arrays.alloc(GcBox::new(CrocArray::from_values(values))))
    }

    pub fn create_memblock(&mut self, gc: &mut Gc, mb: CrocMemblock) -> MemblockId {
        gc.record_allocation(SIZE_MEMBLOCK + mb.len());
        MemblockId(self.memblocks.alloc(GcBox::new(mb)))
    }

    pub fn create_function(&mut self, gc: &mut Gc, func: CrocFunction) -> FunctionId {
        gc.record_allocation(SIZE_FUNCTION);
        FunctionId(self.functions.alloc(GcBox::new(func)))
    }

    pub fn create_funcdef(&mut self, gc: &mut Gc, def: FuncDef) -> FuncDefId {
        gc.record_allocation(SIZE_FUNCDEF + def.code.len() * 4);
        FuncDefId(self.funcdefs.alloc(GcBox::new(def)))
    }

    pub fn create_class(&mut self, gc: &mut Gc, class: CrocClass) -> ClassId {
        gc.record_allocation(SIZE_CLASS);
        ClassId(self.classes.alloc(GcBox::new(class)))
    }

    pub fn create_instance(&mut self, gc: &mut Gc, inst: CrocInstance) -> InstanceId {
        gc.record_allocation(SIZE_INSTANCE);
        InstanceId(self.instances.alloc(GcBox::new(inst)))
    }

    pub fn create_thread(&mut self, gc: &mut Gc, thread: CrocThread) -> ThreadId {
        gc.record_allocation(SIZE_THREAD);
        ThreadId(self.threads.alloc(GcBox::new(thread)))
    }

    pub fn create_upvalue(&mut self, gc: &mut Gc, upval: CrocUpvalue) -> UpvalueId {
        gc.record_allocation(SIZE_UPVALUE);
        UpvalueId(self.upvalues.alloc(GcBox::new(upval)))
    }

    /// Weak refs are uniqued per referent.
    pub fn create_weakref(&mut self, gc: &mut Gc, referent: GcId) -> WeakRefId {
        if let Some(&existing) = self.weakref_table.get(&referent) {
            if self.weakrefs.is_valid(existing.0) {
                return existing;
            }
        }
        gc.record_allocation(SIZE_WEAKREF);
        let id = WeakRefId(self.weakrefs.alloc(GcBox::new(CrocWeakRef {
            referent: Some(referent),
        })));
        self.weakref_table.insert(referent, id);
        id
    }

    pub fn create_nativeobj(&mut self, gc: &mut Gc, data: Box<dyn Any>) -> NativeObjId {
        gc.record_allocation(SIZE_NATIVEOBJ);
        NativeObjId(self.nativeobjs.alloc(GcBox::new(CrocNativeObj { data })))
    }

    // ============ Typed accessors ============

    #[inline(always)]
    pub fn string(&self, id: StringId) -> Option<&CrocString> {
        self.strings.get(id.0).map(|o| &o.data)
    }

    /// Panic-free &str accessor for interned names; empty when dangling.
    pub fn str_of(&self, id: StringId) -> &str {
        self.string(id).map(|s| s.as_str()).unwrap_or("")
    }

    #[inline(always)]
    pub fn table(&self, id: TableId) -> Option<&CrocTable> {
        self.tables.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> Option<&mut CrocTable> {
        self.tables.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn namespace(&self, id: NamespaceId) -> Option<&CrocNamespace> {
        self.namespaces.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn namespace_mut(&mut self, id: NamespaceId) -> Option<&mut CrocNamespace> {
        self.namespaces.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn array(&self, id: ArrayId) -> Option<&CrocArray> {
        self.arrays.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn array_mut(&mut self, id: ArrayId) -> Option<&mut CrocArray> {
        self.arrays.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn memblock(&self, id: MemblockId) -> Option<&CrocMemblock> {
        self.memblocks.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn memblock_mut(&mut self, id: MemblockId) -> Option<&mut CrocMemblock> {
        self.memblocks.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn function(&self, id: FunctionId) -> Option<&CrocFunction> {
        self.functions.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut CrocFunction> {
        self.functions.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn funcdef(&self, id: FuncDefId) -> Option<&FuncDef> {
        self.funcdefs.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn funcdef_mut(&mut self, id: FuncDefId) -> Option<&mut FuncDef> {
        self.funcdefs.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn class(&self, id: ClassId) -> Option<&CrocClass> {
        self.classes.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn class_mut(&mut self, id: ClassId) -> Option<&mut CrocClass> {
        self.classes.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn instance(&self, id: InstanceId) -> Option<&CrocInstance> {
        self.instances.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut CrocInstance> {
        self.instances.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> Option<&CrocThread> {
        self.threads.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut CrocThread> {
        self.threads.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn upvalue(&self, id: UpvalueId) -> Option<&CrocUpvalue> {
        self.upvalues.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, id: UpvalueId) -> Option<&mut CrocUpvalue> {
        self.upvalues.get_mut(id.0).map(|o| &mut o.data)
    }

    #[inline(always)]
    pub fn weakref(&self, id: WeakRefId) -> Option<&CrocWeakRef> {
        self.weakrefs.get(id.0).map(|o| &o.data)
    }

    #[inline(always)]
    pub fn nativeobj(&self, id: NativeObjId) -> Option<&CrocNativeObj> {
        self.nativeobjs.get(id.0).map(|o| &o.data)
    }

    // ============ Header access by GcId ============

    pub fn header(&self, id: GcId) -> Option<&GcHeader> {
        let i = id.index();
        match id {
            GcId::String(_) => self.strings.get(i).map(|o| &o.header),
            GcId::Table(_) => self.tables.get(i).map(|o| &o.header),
            GcId::Namespace(_) => self.namespaces.get(i).map(|o| &o.header),
            GcId::Array(_) => self.arrays.get(i).map(|o| &o.header),
            GcId::Memblock(_) => self.memblocks.get(i).map(|o| &o.header),
            GcId::Function(_) => self.functions.get(i).map(|o| &o.header),
            GcId::FuncDef(_) => self.funcdefs.get(i).map(|o| &o.header),
            GcId::Class(_) => self.classes.get(i).map(|o| &o.header),
            GcId::Instance(_) => self.instances.get(i).map(|o| &o.header),
            GcId::Thread(_) => self.threads.get(i).map(|o| &o.header),
            GcId::Upvalue(_) => self.upvalues.get(i).map(|o| &o.header),
            GcId::WeakRef(_) => self.weakrefs.get(i).map(|o| &o.header),
            GcId::NativeObj(_) => self.nativeobjs.get(i).map(|o| &o.header),
        }
    }

    pub fn header_mut(&mut self, id: GcId) -> Option<&mut GcHeader> {
        let i = id.index();
        match id {
            GcId::String(_) => self.strings.get_mut(i).map(|o| &mut o.header),
            GcId::Table(_) => self.tables.get_mut(i).map(|o| &mut o.header),
            GcId::Namespace(_) => self.namespaces.get_mut(i).map(|o| &mut o.header),
            GcId::Array(_) => self.arrays.get_mut(i).map(|o| &mut o.header),
            GcId::Memblock(_) => self.memblocks.get_mut(i).map(|o| &mut o.header),
            GcId::Function(_) => self.functions.get_mut(i).map(|o| &mut o.header),
            GcId::FuncDef(_) => self.funcdefs.get_mut(i).map(|o| &mut o.header),
            GcId::Class(_) => self.classes.get_mut(i).map(|o| &mut o.header),
            GcId::Instance(_) => self.instances.get_mut(i).map(|o| &mut o.header),
            GcId::Thread(_) => self.threads.get_mut(i).map(|o| &mut o.header),
            GcId::Upvalue(_) => self.upvalues.get_mut(i).map(|o| &mut o.header),
            GcId::WeakRef(_) => self.weakrefs.get_mut(i).map(|o| &mut o.header),
            GcId::NativeObj(_) => self.nativeobjs.get_mut(i).map(|o| &mut o.header),
        }
    }

    /// Pin an object so it is never collected (globals, registry, main
    /// thread and friends).
    pub fn fix(&mut self, id: GcId) {
        if let Some(h) = self.header_mut(id) {
            h.set_fixed();
        }
    }

    /// Free one object, keeping the interner and weak-ref table consistent.
    /// Returns the bytes to subtract from the GC's accounting.
    pub fn free_object(&mut self, id: GcId) -> usize {
        let i = id.index();
        let mut size = size_of_type(id.gc_type());
        match id {
            GcId::String(sid) => {
                if let Some(mut obj) = self.strings.free(i) {
                    size += obj.data.byte_len();
                    let hash = obj.data.hash();
                    self.interner.remove_dead(hash, sid);
                    if self.stomp_freed {
                        obj.data = CrocString::new(String::new(), 0);
                    }
                }
            }
            GcId::Table(_) => {
                self.tables.free(i);
            }
            GcId::Namespace(_) => {
                self.namespaces.free(i);
            }
            GcId::Array(_) => {
                if let Some(obj) = self.arrays.free(i) {
                    size += obj.data.len() * std::mem::size_of::<Value>();
                }
            }
            GcId::Memblock(_) => {
                if let Some(mut obj) = self.memblocks.free(i) {
                    size += obj.data.len();
                    if self.stomp_freed {
                        obj.data.as_bytes_mut().fill(0xDD);
                    }
                }
            }
            GcId::Function(_) => {
                self.functions.free(i);
            }
            GcId::FuncDef(_) => {
                self.funcdefs.free(i);
            }
            GcId::Class(_) => {
                self.classes.free(i);
            }
            GcId::Instance(_) => {
                self.instances.free(i);
            }
            GcId::Thread(_) => {
                self.threads.free(i);
            }
            GcId::Upvalue(_) => {
                self.upvalues.free(i);
            }
            GcId::WeakRef(wid) => {
                if let Some(obj) = self.weakrefs.free(i) {
                    if let Some(referent) = obj.data.referent {
                        if self.weakref_table.get(&referent) == Some(&wid) {
                            self.weakref_table.remove(&referent);
                        }
                    }
                }
            }
            GcId::NativeObj(_) => {
                self.nativeobjs.free(i);
            }
        }
        size
    }

    /// Total live objects across all arenas.
    pub fn live_objects(&self) -> usize {
        self.strings.len()
            + self.tables.len()
            + self.namespaces.len()
            + self.arrays.len()
            + self.memblocks.len()
            + self.functions.len()
            + self.funcdefs.len()
            + self.classes.len()
            + self.instances.len()
            + self.threads.len()
            + self.upvalues.len()
            + self.weakrefs.len()
            + self.nativeobjs.len()
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

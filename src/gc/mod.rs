// Garbage collector
//
// Incremental tri-color mark-sweep driven by allocation debt:
// - Two white bits flip each cycle; new objects are born black so they
//   survive the cycle that is in flight
// - Gray list for pending scans, grayagain for write-barrier re-scans
// - Atomic phase finishes marking, resurrects condemned finalizable
//   instances into the finalize queue, and nulls dead weak references
// - Sweep frees condemned objects in fixed-size quanta to bound pause time
//
// Objects live in typed arenas (ObjectPool); a GcId is a type tag plus the
// arena index, so there is no per-object tracking structure to maintain.

mod gc_id;
mod gc_object;
mod object_pool;
mod string_interner;

use crate::value::{FuncBody, InstanceId, Value};
pub use gc_id::{GcId, GcType};
pub use gc_object::{
    CrocNativeObj, CrocUpvalue, CrocWeakRef, GcBox, GcHeader, UpvalueState, BLACKBIT, FIXEDBIT,
    WHITE0BIT, WHITE1BIT, WHITEBITS,
};
pub use object_pool::{size_of_type, Arena, ObjectPool};
pub use string_interner::StringInterner;

use std::collections::VecDeque;

/// GC state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Between cycles.
    Pause,
    /// Marking from the roots.
    Propagate,
    /// Freeing condemned objects.
    Sweep,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub total_bytes: usize,
    pub collection_count: usize,
    pub objects_collected: usize,
    pub bytes_freed: usize,
}

/// What one GC step produced.
#[derive(Default)]
pub struct GcStepResult {
    pub finished_cycle: bool,
    /// Unreachable finalizable instances, resurrected and queued. The VM
    /// runs their finalizers after the step returns.
    pub to_finalize: Vec<InstanceId>,
    /// A finalizable instance was caught in a cycle: finalization order is
    /// undefined and the VM is no longer usable.
    pub fatal_finalizable_cycle: bool,
}

pub struct Gc {
    gray: Vec<GcId>,
    grayagain: Vec<GcId>,

    phase: GcPhase,
    current_white: u8, // 0 or 1, flips each cycle

    /// Positive debt triggers collection work.
    pub gc_debt: isize,
    total_bytes: usize,
    gc_estimate: usize,
    /// Pause parameter: 200 means wait until memory doubles.
    gc_pause: usize,

    /// Snapshot of condemned objects taken at the end of marking.
    condemned: VecDeque<GcId>,

    stats: GcStats,
}

/// Marking work per incremental step.
const WORK_PER_STEP: usize = 4096;
/// Objects freed per sweep quantum.
const SWEEP_QUANTUM: usize = 256;
/// Credit before the first collection.
const INITIAL_CREDIT: isize = 8 * 1024;

impl Gc {
    pub fn new() -> Self {
        Gc {
            gray: Vec::with_capacity(256),
            grayagain: Vec::with_capacity(64),
            phase: GcPhase::Pause,
            current_white: 0,
            gc_debt: -INITIAL_CREDIT,
            total_bytes: 0,
            gc_estimate: 0,
            gc_pause: 200,
            condemned: VecDeque::new(),
            stats: GcStats::default(),
        }
    }

    #[inline(always)]
    pub fn current_white(&self) -> u8 {
        self.current_white
    }

    #[inline(always)]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn stats(&self) -> GcStats {
        let mut s = self.stats.clone();
        s.total_bytes = self.total_bytes;
        s
    }

    /// Reset debt after VM setup so boot objects do not count toward the
    /// first collection.
    pub fn reset_debt(&mut self) {
        self.gc_debt = -INITIAL_CREDIT;
    }

    #[inline(always)]
    pub fn record_allocation(&mut self, size: usize) {
        self.total_bytes += size;
        self.gc_debt += size as isize;
    }

    #[inline(always)]
    pub fn record_deallocation(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size);
    }

    #[inline(always)]
    pub fn should_collect(&self) -> bool {
        self.gc_debt > 0
    }

    // ============ Write barrier ============

    /// A reference field of `container` was mutated. If the container is
    /// already black while marking is under way, send it back to the gray
    /// set so its changed slots are re-scanned.
    pub fn barrier_back(&mut self, container: GcId, pool: &mut ObjectPool) {
        if self.phase != GcPhase::Propagate {
            return;
        }
        if let Some(h) = pool.header_mut(container) {
            if h.is_black() {
                h.make_gray();
                self.grayagain.push(container);
            }
        }
    }

    // ============ Collection driver ============

    /// One bounded increment of GC work. No-op while debt is paid off.
    pub fn step(&mut self, roots: &[Value], pool: &mut ObjectPool) -> GcStepResult {
        if self.gc_debt <= 0 && self.phase == GcPhase::Pause {
            return GcStepResult::default();
        }
        self.step_forced(roots, pool)
    }

    /// Run the collector to completion: finish any in-flight cycle, then run
    /// one full cycle from a clean start.
    pub fn collect_full(&mut self, roots: &[Value], pool: &mut ObjectPool) -> GcStepResult {
        let mut out = GcStepResult::default();
        while self.phase != GcPhase::Pause {
            let r = self.step_forced(roots, pool);
            out.to_finalize.extend(r.to_finalize);
            out.fatal_finalizable_cycle |= r.fatal_finalizable_cycle;
        }
        loop {
            let r = self.step_forced(roots, pool);
            out.to_finalize.extend(r.to_finalize);
            out.fatal_finalizable_cycle |= r.fatal_finalizable_cycle;
            if r.finished_cycle {
                out.finished_cycle = true;
                return out;
            }
        }
    }

    fn step_forced(&mut self, roots: &[Value], pool: &mut ObjectPool) -> GcStepResult {
        let mut out = GcStepResult::default();
        let mut work = 0usize;

        loop {
            match self.phase {
                GcPhase::Pause => {
                    self.start_cycle(roots, pool);
                    self.phase = GcPhase::Propagate;
                    work += 100;
                }
                GcPhase::Propagate => {
                    work += self.propagate_step(pool, WORK_PER_STEP.saturating_sub(work));
                    if self.gray.is_empty() {
                        // Atomic finish: re-trace barrier-flagged containers
                        // (only their modified slots), re-mark the roots
                        // (the mutator may have moved references since the
                        // cycle started), re-scan every live thread (stack
                        // writes carry no barrier), drain, then handle
                        // finalizers and weak refs.
                        while let Some(id) = self.grayagain.pop() {
                            self.retrace_object(id, pool);
                        }
                        for v in roots {
                            self.mark_value(v, pool);
                        }
                        let live_threads: Vec<u32> = pool
                            .threads
                            .iter()
                            .filter(|(_, t)| !t.header.is_white())
                            .map(|(i, _)| i)
                            .collect();
                        for i in live_threads {
                            if let Some(t) = pool.threads.get_mut(i) {
                                t.header.make_gray();
                            }
                            self.gray.push(GcId::Thread(crate::value::ThreadId(i)));
                        }
                        while let Some(id) = self.gray.pop() {
                            self.traverse_object(id, pool);
                        }
                        out.fatal_finalizable_cycle = self.queue_finalizables(pool, &mut out.to_finalize);
                        self.null_dead_weakrefs(pool);
                        self.collect_condemned(pool);
                        self.phase = GcPhase::Sweep;
                        work += 50;
                    }
                }
                GcPhase::Sweep => {
                    let freed = self.sweep_step(pool);
                    work += freed.max(1);
                    if self.condemned.is_empty() {
                        self.finish_cycle();
                        out.finished_cycle = true;
                        return out;
                    }
                    if work >= WORK_PER_STEP {
                        break;
                    }
                }
            }
            if work >= WORK_PER_STEP {
                break;
            }
        }

        // Pay off debt in proportion to the work done.
        self.gc_debt -= (work as isize) * 2;
        out
    }

    // ============ Mark phase ============

    fn start_cycle(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        self.stats.collection_count += 1;
        self.gray.clear();
        self.grayagain.clear();

        let white = self.current_white;
        macro_rules! whiten {
            ($arena:expr) => {
                for (_, obj) in $arena.iter_mut() {
                    if !obj.header.is_fixed() {
                        obj.header.make_white(white);
                    }
                }
            };
        }
        whiten!(pool.strings);
        whiten!(pool.tables);
        whiten!(pool.namespaces);
        whiten!(pool.arrays);
        whiten!(pool.memblocks);
        whiten!(pool.functions);
        whiten!(pool.funcdefs);
        whiten!(pool.classes);
        whiten!(pool.instances);
        whiten!(pool.threads);
        whiten!(pool.upvalues);
        whiten!(pool.weakrefs);
        whiten!(pool.nativeobjs);

        for v in roots {
            self.mark_value(v, pool);
        }
    }

    #[inline]
    fn mark_value(&mut self, value: &Value, pool: &mut ObjectPool) {
        if let Some(id) = GcId::of_value(value) {
            self.mark_id(id, pool);
        }
    }

    pub(crate) fn mark_id(&mut self, id: GcId, pool: &mut ObjectPool) {
        let Some(h) = pool.header_mut(id) else { return };
        if !h.is_white() {
            return;
        }
        if id.gc_type().is_acyclic() {
            // Leaves carry no traced references.
            h.make_black();
        } else {
            h.make_gray();
            self.gray.push(id);
        }
    }

    fn propagate_step(&mut self, pool: &mut ObjectPool, max_work: usize) -> usize {
        // Only the gray list is drained here; grayagain entries wait for
        // the atomic phase so their modified-slot logs stay meaningful.
        let mut work = 0;
        while work < max_work {
            let Some(id) = self.gray.pop() else { break };
            work += self.traverse_object(id, pool);
        }
        work
    }

    /// Blacken one object and mark everything it references.
    fn traverse_object(&mut self, id: GcId, pool: &mut ObjectPool) -> usize {
        {
            let Some(h) = pool.header_mut(id) else { return 1 };
            if h.is_black() {
                return 1;
            }
            h.make_black();
        }

        let mut children: Vec<Value> = Vec::new();
        let mut child_ids: Vec<GcId> = Vec::new();

        match id {
            GcId::Table(tid) => {
                if let Some(t) = pool.table_mut(tid) {
                    // A full trace covers everything the log remembers.
                    t.clear_modified();
                    for (k, v) in t.iter() {
                        children.push(*k);
                        children.push(*v);
                    }
                }
            }
            GcId::Namespace(nid) => {
                if let Some(ns) = pool.namespace(nid) {
                    child_ids.push(GcId::String(ns.name));
                    if let Some(p) = ns.parent {
                        child_ids.push(GcId::Namespace(p));
                    }
                    for (k, v) in ns.iter() {
                        child_ids.push(GcId::String(k));
                        children.push(v);
                    }
                }
            }
            GcId::Array(aid) => {
                if let Some(a) = pool.array_mut(aid) {
                    a.clear_modified();
                    children.extend(a.values());
                }
            }
            GcId::Function(fid) => {
                if let Some(f) = pool.function(fid) {
                    child_ids.push(GcId::String(f.name));
                    child_ids.push(GcId::Namespace(f.env));
                    match &f.body {
                        FuncBody::Script { def, upvals } => {
                            child_ids.push(GcId::FuncDef(*def));
                            for u in upvals {
                                child_ids.push(GcId::Upvalue(*u));
                            }
                        }
                        FuncBody::Native { upvals, .. } => {
                            children.extend(upvals.iter().copied());
                        }
                    }
                }
            }
            GcId::FuncDef(did) => {
                if let Some(d) = pool.funcdef(did) {
                    child_ids.push(GcId::String(d.name));
                    children.extend(d.constants.iter().copied());
                    for inner in &d.inner_defs {
                        child_ids.push(GcId::FuncDef(*inner));
                    }
                    if let Some(cf) = d.cached_func {
                        child_ids.push(GcId::Function(cf));
                    }
                    for st in &d.switch_tables {
                        children.extend(st.offsets.keys().copied());
                    }
                    for l in &d.locals {
                        child_ids.push(GcId::String(l.name));
                    }
                }
            }
            GcId::Class(cid) => {
                if let Some(c) = pool.class(cid) {
                    child_ids.push(GcId::String(c.name));
                    if let Some(p) = c.parent {
                        child_ids.push(GcId::Class(p));
                    }
                    for (k, v) in c.methods().chain(c.fields()).chain(c.hidden_fields()) {
                        child_ids.push(GcId::String(k));
                        children.push(v);
                    }
                    if let Some(ctor) = c.constructor {
                        children.push(ctor);
                    }
                    if let Some(fin) = c.finalizer {
                        children.push(fin);
                    }
                }
            }
            GcId::Instance(iid) => {
                if let Some(inst) = pool.instance(iid) {
                    child_ids.push(GcId::Class(inst.class));
                    for (k, v) in inst.fields().chain(inst.hidden_fields()) {
                        child_ids.push(GcId::String(k));
                        children.push(v);
                    }
                }
            }
            GcId::Thread(tid) => {
                if let Some(t) = pool.thread(tid) {
                    children.extend(t.stack[..t.stack_top.min(t.stack.len())].iter().copied());
                    for ar in &t.act_records {
                        child_ids.push(GcId::Function(ar.func));
                    }
                    children.extend(t.results.iter().copied());
                    children.extend(t.transfer.iter().copied());
                    for u in &t.open_upvalues {
                        child_ids.push(GcId::Upvalue(*u));
                    }
                    children.push(t.hook.func);
                    if let Some(cf) = t.coro_func {
                        child_ids.push(GcId::Function(cf));
                    }
                    if let Some(r) = t.resumer {
                        child_ids.push(GcId::Thread(r));
                    }
                }
            }
            GcId::Upvalue(uid) => {
                if let Some(u) = pool.upvalue(uid) {
                    if let Some(v) = u.closed_value() {
                        children.push(v);
                    }
                    // Open upvalues point into a thread stack, which is
                    // traced through the thread itself.
                }
            }
            // Leaves never reach here (mark_id blackens them directly).
            GcId::String(_) | GcId::Memblock(_) | GcId::WeakRef(_) | GcId::NativeObj(_) => {}
        }

        let work = 1 + children.len() + child_ids.len();
        for v in &children {
            self.mark_value(v, pool);
        }
        for cid in child_ids {
            self.mark_id(cid, pool);
        }
        work
    }

    /// Re-trace an object the write barrier sent back: it was fully
    /// scanned once this cycle, so only the slots flagged modified since
    /// then need visiting. Containers without slot bookkeeping (and a
    /// table whose log overflowed) fall back to a full re-trace.
    fn retrace_object(&mut self, id: GcId, pool: &mut ObjectPool) -> usize {
        match id {
            GcId::Array(aid) => {
                {
                    let Some(h) = pool.header_mut(id) else { return 1 };
                    if h.is_black() {
                        return 1;
                    }
                    h.make_black();
                }
                let changed = pool
                    .array_mut(aid)
                    .map(|a| a.take_modified())
                    .unwrap_or_default();
                let work = 1 + changed.len();
                for v in &changed {
                    self.mark_value(v, pool);
                }
                work
            }
            GcId::Table(tid) => {
                let log = pool.table_mut(tid).map(|t| t.take_modified());
                match log {
                    Some(Some(pairs)) => {
                        {
                            let Some(h) = pool.header_mut(id) else { return 1 };
                            if h.is_black() {
                                return 1;
                            }
                            h.make_black();
                        }
                        let work = 1 + 2 * pairs.len();
                        for (k, v) in pairs {
                            self.mark_value(&k, pool);
                            self.mark_value(&v, pool);
                        }
                        work
                    }
                    // Log overflowed (or the table is gone): full re-trace.
                    _ => self.traverse_object(id, pool),
                }
            }
            _ => self.traverse_object(id, pool),
        }
    }

    // ============ Atomic-phase duties ============

    /// Find unreachable finalizable instances, detect finalizable cycles,
    /// and resurrect the queue. Returns true on the fatal cycle condition.
    fn queue_finalizables(&mut self, pool: &mut ObjectPool, queue: &mut Vec<InstanceId>) -> bool {
        let mut condemned: Vec<InstanceId> = Vec::new();
        for (i, obj) in pool.instances.iter() {
            if !obj.header.is_white() || obj.header.is_finalize_pending() || obj.header.is_finalized()
            {
                continue;
            }
            let has_finalizer = pool
                .class(obj.data.class)
                .map(|c| c.finalizer.is_some())
                .unwrap_or(false);
            if has_finalizer {
                condemned.push(InstanceId(i));
            }
        }

        if condemned.is_empty() {
            return false;
        }

        // Order among mutually-reachable finalizable objects is undefined:
        // a condemned finalizable instance that can reach itself is fatal.
        for &iid in &condemned {
            if self.reaches_itself(GcId::Instance(iid), pool) {
                return true;
            }
        }

        for iid in condemned {
            if let Some(obj) = pool.instances.get_mut(iid.0) {
                obj.header.set_finalize_pending();
            }
            // Resurrect: the instance and everything it references must
            // survive until the finalizer has run.
            self.mark_id(GcId::Instance(iid), pool);
            while let Some(id) = self.gray.pop() {
                self.traverse_object(id, pool);
            }
            queue.push(iid);
        }
        false
    }

    /// Depth-first reachability of `start` from its own references.
    fn reaches_itself(&self, start: GcId, pool: &ObjectPool) -> bool {
        let mut seen: Vec<GcId> = Vec::new();
        let mut work: Vec<GcId> = self.references_of(start, pool);
        while let Some(id) = work.pop() {
            if id == start {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            work.extend(self.references_of(id, pool));
        }
        false
    }

    /// Direct strong references of one object, for cycle probing.
    fn references_of(&self, id: GcId, pool: &ObjectPool) -> Vec<GcId> {
        let mut out = Vec::new();
        let mut push_value = |out: &mut Vec<GcId>, v: &Value| {
            if let Some(cid) = GcId::of_value(v) {
                out.push(cid);
            }
        };
        match id {
            GcId::Table(tid) => {
                if let Some(t) = pool.table(tid) {
                    for (k, v) in t.iter() {
                        push_value(&mut out, k);
                        push_value(&mut out, v);
                    }
                }
            }
            GcId::Namespace(nid) => {
                if let Some(ns) = pool.namespace(nid) {
                    if let Some(p) = ns.parent {
                        out.push(GcId::Namespace(p));
                    }
                    for (_, v) in ns.iter() {
                        push_value(&mut out, &v);
                    }
                }
            }
            GcId::Array(aid) => {
                if let Some(a) = pool.array(aid) {
                    for v in a.values() {
                        push_value(&mut out, &v);
                    }
                }
            }
            GcId::Function(fid) => {
                if let Some(f) = pool.function(fid) {
                    match &f.body {
                        FuncBody::Script { upvals, .. } => {
                            out.extend(upvals.iter().map(|u| GcId::Upvalue(*u)));
                        }
                        FuncBody::Native { upvals, .. } => {
                            for v in upvals {
                                push_value(&mut out, v);
                            }
                        }
                    }
                }
            }
            GcId::Class(cid) => {
                if let Some(c) = pool.class(cid) {
                    if let Some(p) = c.parent {
                        out.push(GcId::Class(p));
                    }
                    for (_, v) in c.methods().chain(c.fields()).chain(c.hidden_fields()) {
                        push_value(&mut out, &v);
                    }
                }
            }
            GcId::Instance(iid) => {
                if let Some(inst) = pool.instance(iid) {
                    for (_, v) in inst.fields().chain(inst.hidden_fields()) {
                        push_value(&mut out, &v);
                    }
                }
            }
            GcId::Upvalue(uid) => {
                if let Some(u) = pool.upvalue(uid) {
                    if let Some(v) = u.closed_value() {
                        push_value(&mut out, &v);
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Null out weak references whose referents did not survive marking.
    fn null_dead_weakrefs(&mut self, pool: &mut ObjectPool) {
        let mut dead_refs: Vec<(u32, GcId)> = Vec::new();
        for (i, obj) in pool.weakrefs.iter() {
            if let Some(referent) = obj.data.referent {
                let referent_dead = pool.header(referent).map(|h| h.is_white()).unwrap_or(true);
                if referent_dead {
                    dead_refs.push((i, referent));
                }
            }
        }
        for (i, referent) in dead_refs {
            if let Some(obj) = pool.weakrefs.get_mut(i) {
                obj.data.referent = None;
            }
            pool.weakref_table.remove(&referent);
        }
    }

    /// Snapshot all condemned (white, unfixed) objects for the sweep.
    fn collect_condemned(&mut self, pool: &ObjectPool) {
        self.condemned.clear();
        macro_rules! condemn {
            ($arena:expr, $variant:ident, $idty:ident) => {
                for (i, obj) in $arena.iter() {
                    if obj.header.is_white() && !obj.header.is_fixed() {
                        self.condemned
                            .push_back(GcId::$variant(crate::value::$idty(i)));
                    }
                }
            };
        }
        condemn!(pool.strings, String, StringId);
        condemn!(pool.tables, Table, TableId);
        condemn!(pool.namespaces, Namespace, NamespaceId);
        condemn!(pool.arrays, Array, ArrayId);
        condemn!(pool.memblocks, Memblock, MemblockId);
        condemn!(pool.functions, Function, FunctionId);
        condemn!(pool.funcdefs, FuncDef, FuncDefId);
        condemn!(pool.classes, Class, ClassId);
        condemn!(pool.instances, Instance, InstanceId);
        condemn!(pool.threads, Thread, ThreadId);
        condemn!(pool.upvalues, Upvalue, UpvalueId);
        condemn!(pool.weakrefs, WeakRef, WeakRefId);
        condemn!(pool.nativeobjs, NativeObj, NativeObjId);
    }

    // ============ Sweep phase ============

    fn sweep_step(&mut self, pool: &mut ObjectPool) -> usize {
        let mut freed = 0;
        while freed < SWEEP_QUANTUM {
            let Some(id) = self.condemned.pop_front() else { break };
            // An object may have been resurrected (finalizer queue, interner
            // hit) after the snapshot was taken.
            let still_white = pool.header(id).map(|h| h.is_white()).unwrap_or(false);
            if !still_white {
                continue;
            }
            let bytes = pool.free_object(id);
            self.record_deallocation(bytes);
            self.stats.bytes_freed += bytes;
            self.stats.objects_collected += 1;
            freed += 1;
        }
        freed
    }

    fn finish_cycle(&mut self) {
        self.current_white ^= 1;
        self.phase = GcPhase::Pause;
        let estimate = self.total_bytes.max(1024);
        self.gc_estimate = estimate;
        self.gc_debt = -(((estimate * self.gc_pause) / 100) as isize);
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debt_triggers_collection() {
        let mut gc = Gc::new();
        assert!(!gc.should_collect());
        for _ in 0..1000 {
            gc.record_allocation(256);
        }
        assert!(gc.should_collect());
    }

    #[test]
    fn unreferenced_objects_are_swept() {
        let mut gc = Gc::new();
        let mut pool = ObjectPool::new();
        let kept = pool.create_table(&mut gc);
        let _dropped = pool.create_table(&mut gc);
        let roots = [Value::table(kept)];
        gc.collect_full(&roots, &mut pool);
        assert_eq!(pool.tables.len(), 1);
        assert!(pool.table(kept).is_some());
    }

    #[test]
    fn interned_string_survives_while_rooted() {
        let mut gc = Gc::new();
        let mut pool = ObjectPool::new();
        let alive = pool.create_string(&mut gc, "alive");
        let dead = pool.create_string(&mut gc, "dead");
        let roots = [Value::string(alive)];
        gc.collect_full(&roots, &mut pool);
        assert!(pool.string(alive).is_some());
        assert!(pool.string(dead).is_none());
        // The dead entry left the intern table; re-interning creates afresh.
        let reborn = pool.create_string(&mut gc, "dead");
        assert!(pool.string(reborn).is_some());
    }
}

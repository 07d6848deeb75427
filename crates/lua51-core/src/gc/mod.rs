// Tri-color incremental mark-and-sweep collector.
//
// Colors cycle through two whites: survivors of the current cycle wear the
// new white after sweeping, condemned objects still wear the old one, so
// no separate unmark pass is needed.
//
// Cycle: Pause -> Propagate -> (atomic) -> SweepStrings -> SweepObjects
//        -> Finalize -> Pause
//
// The debt mechanism triggers work: every allocation raises the debt, and
// once it is positive the state driver runs steps until the step budget is
// spent. The atomic pass re-marks roots and mutated objects, converges
// ephemerons, clears weak tables and separates unreachable finalizable
// objects, then flips the white.
//
// Tri-color invariant: while marking is in progress, no black object
// references a white object. Enforced by the write barriers below; tables
// take the backward barrier (re-grayed via `grayagain`), everything else
// the forward barrier.

mod gc_id;
pub mod object_pool;
pub mod string_interner;

pub use gc_id::*;
pub use object_pool::*;

use crate::lua_value::{LuaValue, ThreadContext};

/// GC state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Pause,
    Propagate,
    SweepStrings,
    SweepObjects,
    Finalize,
}

/// Result of one GC step.
pub enum StepResult {
    /// Traversal/sweep work done (estimated bytes).
    Work(usize),
    /// An object is ready for finalization; the state must run its `__gc`.
    NeedFinalizer(GcId),
    /// The cycle just completed.
    CycleEnd,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collection_count: usize,
    pub objects_collected: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub finalizer_errors: usize,
}

/// Everything reachable by definition: the state's global values plus the
/// live (currently executing) coroutine context, which is held outside the
/// arena while it runs.
pub struct GcRoots<'a> {
    pub values: &'a [LuaValue],
    pub live_context: &'a ThreadContext,
    pub live_thread: ThreadId,
}

/// Objects swept per sweep step.
const SWEEP_BATCH: usize = 100;

/// Step size credited between steps, in bytes.
const STEP_SIZE: isize = 13 * 1024;

pub struct Gc {
    pub phase: GcPhase,
    current_white: u8,

    /// Bytes allocated but not yet paid for; positive debt triggers steps.
    pub debt: isize,
    pub total_bytes: usize,
    /// Live-byte estimate after the last cycle.
    estimate: usize,

    pub pause_ratio: i32,
    pub step_multiplier: i32,
    pub stopped: bool,

    gray: Vec<GcId>,
    grayagain: Vec<GcId>,

    // weak tables found during traversal, resolved in the atomic pass
    weak_values: Vec<TableId>,
    ephemerons: Vec<TableId>,
    all_weak: Vec<TableId>,

    /// Objects registered for finalization, in registration order.
    finalizable: Vec<GcId>,
    /// Unreachable finalizable objects, popped one per Finalize step.
    tobefnz: Vec<GcId>,

    // sweep cursors
    sweep_slot: usize,
    sweep_arena: usize,

    /// `__mode` key, interned and pinned by the state.
    mode_key: StringId,

    pub stats: GcStats,
}

impl Gc {
    pub fn new(pause_ratio: i32, step_multiplier: i32) -> Self {
        Self {
            phase: GcPhase::Pause,
            current_white: WHITE0,
            debt: -(200 * 1024), // breathing room before the first cycle
            total_bytes: 0,
            estimate: 0,
            pause_ratio,
            step_multiplier,
            stopped: false,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(32),
            weak_values: Vec::new(),
            ephemerons: Vec::new(),
            all_weak: Vec::new(),
            finalizable: Vec::new(),
            tobefnz: Vec::new(),
            sweep_slot: 0,
            sweep_arena: 0,
            mode_key: StringId::default(),
            stats: GcStats::default(),
        }
    }

    pub fn set_mode_key(&mut self, key: StringId) {
        self.mode_key = key;
    }

    #[inline(always)]
    pub fn current_white(&self) -> u8 {
        self.current_white
    }

    #[inline(always)]
    fn other_white(&self) -> u8 {
        self.current_white ^ 1
    }

    /// Marking in progress: stores must preserve the tri-color invariant.
    #[inline(always)]
    pub fn keep_invariant(&self) -> bool {
        self.phase == GcPhase::Propagate
    }

    #[inline(always)]
    fn in_sweep(&self) -> bool {
        matches!(self.phase, GcPhase::SweepStrings | GcPhase::SweepObjects)
    }

    // ============ Accounting ============

    #[inline(always)]
    pub fn record_allocation(&mut self, size: usize) {
        self.total_bytes += size;
        self.debt += size as isize;
        self.stats.bytes_allocated += size;
    }

    #[inline(always)]
    fn record_free(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size);
        self.stats.bytes_freed += size;
        self.stats.objects_collected += 1;
    }

    #[inline(always)]
    pub fn should_step(&self) -> bool {
        !self.stopped && self.debt > 0
    }

    /// Register an object for `__gc` finalization. Called when a metatable
    /// carrying `__gc` is attached. Re-registration after finalization is
    /// the embedder's explicit choice (resurrection reprieve).
    pub fn register_finalizable(&mut self, id: GcId, pool: &mut ObjectPool) {
        if let Some(h) = pool.header(id) {
            if h.is_finalized() {
                return;
            }
        }
        if !self.finalizable.contains(&id) {
            self.finalizable.push(id);
        }
    }

    // ============ Step driver ============

    /// Run one bounded unit of collection. The caller (the interpreter
    /// state) loops on this, paying down the debt, and runs finalizers
    /// when asked.
    pub fn single_step(&mut self, roots: &GcRoots<'_>, pool: &mut ObjectPool) -> StepResult {
        match self.phase {
            GcPhase::Pause => {
                self.start_cycle(roots, pool);
                self.phase = GcPhase::Propagate;
                StepResult::Work(1)
            }
            GcPhase::Propagate => {
                if let Some(id) = self.gray.pop() {
                    let work = self.traverse(id, pool);
                    StepResult::Work(work)
                } else {
                    self.atomic(roots, pool);
                    self.enter_sweep();
                    StepResult::Work(1)
                }
            }
            GcPhase::SweepStrings => {
                let done = self.sweep_strings(pool);
                if done {
                    self.phase = GcPhase::SweepObjects;
                    self.sweep_arena = 0;
                    self.sweep_slot = 0;
                }
                StepResult::Work(SWEEP_BATCH)
            }
            GcPhase::SweepObjects => {
                let done = self.sweep_objects(pool);
                if done {
                    self.phase = GcPhase::Finalize;
                }
                StepResult::Work(SWEEP_BATCH)
            }
            GcPhase::Finalize => {
                // reverse registration order: the queue was built reversed
                if let Some(id) = self.tobefnz.pop() {
                    StepResult::NeedFinalizer(id)
                } else {
                    self.phase = GcPhase::Pause;
                    self.finish_cycle();
                    StepResult::CycleEnd
                }
            }
        }
    }

    /// Debt credit for the next step burst.
    pub fn step_budget(&self) -> isize {
        let mul = self.step_multiplier.max(1) as isize;
        (self.debt * mul) / 100
    }

    /// Reset the debt after a step burst so allocation can proceed before
    /// the next one.
    pub fn pay_step_debt(&mut self) {
        if self.phase == GcPhase::Pause {
            self.set_pause_debt();
        } else {
            self.debt = -STEP_SIZE;
        }
    }

    fn set_pause_debt(&mut self) {
        let threshold = (self.estimate / 100).saturating_mul(self.pause_ratio.max(100) as usize);
        self.debt = self.total_bytes as isize - threshold.max(64 * 1024) as isize;
    }

    fn finish_cycle(&mut self) {
        self.estimate = self.total_bytes;
        self.stats.collection_count += 1;
        self.set_pause_debt();
        tracing::debug!(
            live_bytes = self.total_bytes,
            collected = self.stats.objects_collected,
            cycles = self.stats.collection_count,
            "gc cycle complete"
        );
    }

    fn start_cycle(&mut self, roots: &GcRoots<'_>, pool: &mut ObjectPool) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak_values.clear();
        self.ephemerons.clear();
        self.all_weak.clear();
        self.mark_roots(roots, pool);
    }

    fn enter_sweep(&mut self) {
        self.phase = GcPhase::SweepStrings;
        self.sweep_slot = 0;
    }

    fn mark_roots(&mut self, roots: &GcRoots<'_>, pool: &mut ObjectPool) {
        for v in roots.values {
            self.mark_value(v, pool);
        }
        self.mark_object(GcId::Thread(roots.live_thread), pool);
        self.mark_context(roots.live_context, pool);
    }

    fn mark_context(&mut self, ctx: &ThreadContext, pool: &mut ObjectPool) {
        for v in &ctx.stack[..ctx.stack_top.min(ctx.stack.len())] {
            self.mark_value(v, pool);
        }
        for frame in &ctx.frames {
            self.mark_value(&frame.func, pool);
        }
        for &uv in &ctx.open_upvalues {
            self.mark_object(GcId::Upvalue(uv), pool);
        }
    }

    // ============ Marking ============

    fn mark_value(&mut self, v: &LuaValue, pool: &mut ObjectPool) {
        if let Some(id) = v.gc_id() {
            self.mark_object(id, pool);
        }
    }

    /// White object -> gray (or straight to black for leaves).
    pub(crate) fn mark_object(&mut self, id: GcId, pool: &mut ObjectPool) {
        let Some(header) = pool.header_mut(id) else {
            return;
        };
        if !header.is_white() {
            return;
        }
        match id {
            GcId::String(_) => header.make_black(), // leaf
            _ => {
                header.make_gray();
                self.gray.push(id);
            }
        }
    }

    /// Blacken one gray object and mark its children. Returns the
    /// estimated traversal work in bytes.
    fn traverse(&mut self, id: GcId, pool: &mut ObjectPool) -> usize {
        let size = pool.object_size(id);
        match id {
            GcId::String(sid) => {
                if let Some(s) = pool.strings.get_mut(sid.0) {
                    s.header.make_black();
                }
            }
            GcId::Table(tid) => self.traverse_table(tid, pool),
            GcId::Function(fid) => self.traverse_closure(fid, pool),
            GcId::Upvalue(uid) => {
                let closed = match pool.upvalues.get_mut(uid.0) {
                    Some(uv) => {
                        uv.header.make_black();
                        match &uv.state {
                            UpvalueState::Closed(v) => Some(*v),
                            UpvalueState::Open { .. } => None, // slot is a stack root
                        }
                    }
                    None => None,
                };
                if let Some(v) = closed {
                    self.mark_value(&v, pool);
                }
            }
            GcId::Userdata(uid) => {
                let (meta, env) = match pool.userdata.get_mut(uid.0) {
                    Some(u) => {
                        u.header.make_black();
                        (u.data.metatable(), u.data.environment())
                    }
                    None => (None, None),
                };
                if let Some(m) = meta {
                    self.mark_object(GcId::Table(m), pool);
                }
                if let Some(e) = env {
                    self.mark_object(GcId::Table(e), pool);
                }
            }
            GcId::Thread(tid) => self.traverse_thread(tid, pool),
        }
        size
    }

    fn traverse_table(&mut self, tid: TableId, pool: &mut ObjectPool) {
        let Some(t) = pool.tables.get_mut(tid.0) else {
            return;
        };
        t.header.make_black();
        let meta = t.data.metatable();

        let (weak_keys, weak_values) = self.weak_mode(meta, pool);

        if let Some(m) = meta {
            self.mark_object(GcId::Table(m), pool);
        }

        match (weak_keys, weak_values) {
            (false, false) => {
                let pairs: Vec<(LuaValue, LuaValue)> = pool.table(tid).iter_pairs().collect();
                for (k, v) in pairs {
                    self.mark_value(&k, pool);
                    self.mark_value(&v, pool);
                }
            }
            (false, true) => {
                // strong keys only; values resolved in the atomic pass
                let keys: Vec<LuaValue> = pool.table(tid).iter_pairs().map(|(k, _)| k).collect();
                for k in keys {
                    self.mark_value(&k, pool);
                }
                self.weak_values.push(tid);
            }
            (true, false) => {
                // ephemeron: values become reachable only through their keys
                self.ephemerons.push(tid);
            }
            (true, true) => {
                self.all_weak.push(tid);
            }
        }
    }

    /// Read `__mode` from a metatable: `(weak_keys, weak_values)`.
    fn weak_mode(&self, meta: Option<TableId>, pool: &ObjectPool) -> (bool, bool) {
        let Some(m) = meta else {
            return (false, false);
        };
        let mode = pool.table(m).raw_get(&LuaValue::string(self.mode_key));
        let Some(sid) = mode.as_string_id() else {
            return (false, false);
        };
        let bytes = pool.string_bytes(sid);
        (bytes.contains(&b'k'), bytes.contains(&b'v'))
    }

    fn traverse_closure(&mut self, fid: FunctionId, pool: &mut ObjectPool) {
        enum Children {
            Lua(Vec<UpvalueId>, std::rc::Rc<crate::lua_value::Chunk>),
            Host(Vec<LuaValue>),
        }
        let children = match pool.functions.get_mut(fid.0) {
            Some(f) => {
                f.header.make_black();
                match &f.kind {
                    ClosureKind::Lua { chunk, upvalues } => {
                        Children::Lua(upvalues.clone(), chunk.clone())
                    }
                    ClosureKind::Host { upvalues, .. } => Children::Host(upvalues.clone()),
                }
            }
            None => return,
        };
        match children {
            Children::Lua(upvalues, chunk) => {
                for uv in upvalues {
                    self.mark_object(GcId::Upvalue(uv), pool);
                }
                self.mark_chunk_constants(&chunk, pool);
            }
            Children::Host(upvalues) => {
                for v in &upvalues {
                    self.mark_value(v, pool);
                }
            }
        }
    }

    /// Prototype constants may be interned strings; nested prototypes too.
    fn mark_chunk_constants(&mut self, chunk: &crate::lua_value::Chunk, pool: &mut ObjectPool) {
        for c in &chunk.constants {
            self.mark_value(c, pool);
        }
        for sub in &chunk.protos {
            self.mark_chunk_constants(sub, pool);
        }
    }

    fn traverse_thread(&mut self, tid: ThreadId, pool: &mut ObjectPool) {
        struct Snapshot {
            entry: LuaValue,
            resumer: Option<ThreadId>,
            stack: Vec<LuaValue>,
            funcs: Vec<LuaValue>,
            upvals: Vec<UpvalueId>,
        }
        let snap = match pool.threads.get_mut(tid.0) {
            Some(t) => {
                t.header.make_black();
                let ctx = &t.data.context;
                Snapshot {
                    entry: t.data.entry,
                    resumer: t.data.resumer,
                    stack: ctx.stack[..ctx.stack_top.min(ctx.stack.len())].to_vec(),
                    funcs: ctx.frames.iter().map(|f| f.func).collect(),
                    upvals: ctx.open_upvalues.clone(),
                }
            }
            None => return,
        };
        self.mark_value(&snap.entry, pool);
        if let Some(resumer) = snap.resumer {
            self.mark_object(GcId::Thread(resumer), pool);
        }
        for v in &snap.stack {
            self.mark_value(v, pool);
        }
        for v in &snap.funcs {
            self.mark_value(v, pool);
        }
        for uv in snap.upvals {
            self.mark_object(GcId::Upvalue(uv), pool);
        }
    }

    // ============ Atomic ============

    fn atomic(&mut self, roots: &GcRoots<'_>, pool: &mut ObjectPool) {
        // Roots may have changed since the cycle started.
        self.mark_roots(roots, pool);
        self.drain_gray(pool);

        // Objects mutated after being blackened (backward barrier).
        let grayagain = std::mem::take(&mut self.grayagain);
        for id in grayagain {
            // re-gray so traverse() accepts it
            if let Some(h) = pool.header_mut(id) {
                if !h.is_white() {
                    h.make_gray();
                }
            }
            self.traverse(id, pool);
        }
        self.drain_gray(pool);

        // Ephemeron fixpoint: keys reachable through other values can make
        // their own values reachable, transitively.
        loop {
            let mut changed = false;
            let ephemerons = self.ephemerons.clone();
            for tid in ephemerons {
                let pairs: Vec<(LuaValue, LuaValue)> = match pool.tables.get(tid.0) {
                    Some(t) => t.data.iter_pairs().collect(),
                    None => continue,
                };
                for (k, v) in pairs {
                    if self.value_is_marked(&k, pool) && !self.value_is_marked(&v, pool) {
                        self.mark_value(&v, pool);
                        changed = true;
                    }
                }
            }
            self.drain_gray(pool);
            if !changed {
                break;
            }
        }

        // Separate unreachable finalizable objects, newest registration
        // first, and resurrect them so their finalizers can run safely.
        let mut kept = Vec::new();
        let finalizable = std::mem::take(&mut self.finalizable);
        let mut separated = Vec::new();
        for id in finalizable {
            let dead = pool.header(id).map(|h| h.is_white()).unwrap_or(false);
            if dead {
                separated.push(id);
            } else {
                kept.push(id);
            }
        }
        self.finalizable = kept;
        for &id in &separated {
            self.mark_object(id, pool);
        }
        self.drain_gray(pool);
        // queue is popped from the back: push in registration order
        self.tobefnz.extend(separated);

        // Clear weak entries only after every marking source has run.
        self.clear_weak_tables(pool);

        // Survivors keep their black/gray color; the sweep recolors them to
        // the new white.
        self.current_white = self.other_white();
    }

    fn drain_gray(&mut self, pool: &mut ObjectPool) {
        while let Some(id) = self.gray.pop() {
            self.traverse(id, pool);
        }
    }

    fn value_is_marked(&self, v: &LuaValue, pool: &ObjectPool) -> bool {
        match v.gc_id() {
            Some(id) => pool.header(id).map(|h| !h.is_white()).unwrap_or(true),
            None => true, // non-collectable values are always "reachable"
        }
    }

    fn clear_weak_tables(&mut self, pool: &mut ObjectPool) {
        fn identity(id: GcId) -> (u8, u32) {
            match id {
                GcId::String(s) => (1, s.0),
                GcId::Table(t) => (2, t.0),
                GcId::Function(f) => (3, f.0),
                GcId::Upvalue(u) => (4, u.0),
                GcId::Userdata(u) => (5, u.0),
                GcId::Thread(t) => (6, t.0),
            }
        }
        let lists = [
            (std::mem::take(&mut self.weak_values), false, true),
            (std::mem::take(&mut self.ephemerons), true, false),
            (std::mem::take(&mut self.all_weak), true, true),
        ];
        for (tables, weak_k, weak_v) in lists {
            for tid in tables {
                // snapshot the dead identities first, then mutate the table
                let mut dead: std::collections::HashSet<(u8, u32)> = std::collections::HashSet::new();
                {
                    let Some(t) = pool.tables.get(tid.0) else {
                        continue;
                    };
                    for (k, v) in t.data.iter_pairs() {
                        for val in [k, v] {
                            if let Some(id) = val.gc_id() {
                                let white =
                                    pool.header(id).map(|h| h.is_white()).unwrap_or(true);
                                if white {
                                    dead.insert(identity(id));
                                }
                            }
                        }
                    }
                }
                if dead.is_empty() {
                    continue;
                }
                let t = pool.tables.get_mut(tid.0).expect("weak table vanished");
                t.data.clear_weak_entries(weak_k, weak_v, |v| {
                    v.gc_id().map(|id| dead.contains(&identity(id))).unwrap_or(false)
                });
            }
        }
    }

    // ============ Sweeping ============

    /// Strings are swept first (their own pass) so that string handles in
    /// later-swept objects never point at freed slots mid-cycle.
    fn sweep_strings(&mut self, pool: &mut ObjectPool) -> bool {
        let other = self.other_white();
        let cur = self.current_white;
        let end = pool.strings.slot_count();
        let mut swept = 0;
        while self.sweep_slot < end && swept < SWEEP_BATCH {
            let slot = self.sweep_slot as u32;
            self.sweep_slot += 1;
            swept += 1;
            let Some(s) = pool.strings.get_mut(slot) else {
                continue;
            };
            if s.header.is_fixed() {
                s.header.make_white(cur);
                continue;
            }
            if s.header.is_dead(other) {
                let hash = s.hash;
                let size = 32 + s.bytes.len();
                pool.interner.remove_dead(StringId(slot), hash);
                pool.strings.free(slot);
                self.record_free(size);
            } else {
                s.header.make_white(cur);
            }
        }
        self.sweep_slot >= end
    }

    fn sweep_objects(&mut self, pool: &mut ObjectPool) -> bool {
        let other = self.other_white();
        let cur = self.current_white;
        let mut swept = 0;

        // arenas in a fixed order; 0=tables 1=functions 2=upvalues
        // 3=userdata 4=threads
        while self.sweep_arena < 5 {
            let end = match self.sweep_arena {
                0 => pool.tables.slot_count(),
                1 => pool.functions.slot_count(),
                2 => pool.upvalues.slot_count(),
                3 => pool.userdata.slot_count(),
                _ => pool.threads.slot_count(),
            };
            while self.sweep_slot < end {
                if swept >= SWEEP_BATCH {
                    return false;
                }
                let slot = self.sweep_slot as u32;
                self.sweep_slot += 1;
                swept += 1;

                macro_rules! sweep_one {
                    ($arena:ident, $gcid:expr) => {
                        if let Some(o) = pool.$arena.get_mut(slot) {
                            if o.header.is_fixed() {
                                o.header.make_white(cur);
                            } else if o.header.is_dead(other) {
                                let size = pool.object_size($gcid);
                                pool.$arena.free(slot);
                                self.record_free(size);
                            } else {
                                o.header.make_white(cur);
                            }
                        }
                    };
                }
                match self.sweep_arena {
                    0 => sweep_one!(tables, GcId::Table(TableId(slot))),
                    1 => sweep_one!(functions, GcId::Function(FunctionId(slot))),
                    2 => sweep_one!(upvalues, GcId::Upvalue(UpvalueId(slot))),
                    3 => sweep_one!(userdata, GcId::Userdata(UserdataId(slot))),
                    _ => sweep_one!(threads, GcId::Thread(ThreadId(slot))),
                }
            }
            self.sweep_arena += 1;
            self.sweep_slot = 0;
        }
        true
    }

    // ============ Write barriers ============

    /// Forward barrier: a black object just gained a reference to `v`.
    /// During marking the referent is marked immediately; during sweeping
    /// the parent is reset to the current white instead.
    pub fn barrier_forward(&mut self, parent: GcId, v: GcId, pool: &mut ObjectPool) {
        let parent_black = pool.header(parent).map(|h| h.is_black()).unwrap_or(false);
        let child_white = pool.header(v).map(|h| h.is_white()).unwrap_or(false);
        if !parent_black || !child_white {
            return;
        }
        if self.keep_invariant() {
            self.mark_object(v, pool);
        } else if self.in_sweep() {
            if let Some(h) = pool.header_mut(parent) {
                h.make_white(self.current_white);
            }
        }
    }

    /// Backward barrier for tables: instead of eagerly marking every new
    /// child of a hot table, flip the table back to gray and revisit it in
    /// the atomic pass.
    pub fn barrier_back(&mut self, tid: TableId, pool: &mut ObjectPool) {
        let Some(t) = pool.tables.get_mut(tid.0) else {
            return;
        };
        if !t.header.is_black() {
            return;
        }
        t.header.make_gray();
        let id = GcId::Table(tid);
        if !self.grayagain.contains(&id) {
            self.grayagain.push(id);
        }
    }

    // ============ Control operations ============

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn restart(&mut self) {
        self.stopped = false;
        self.debt = 0;
    }

    pub fn set_pause_ratio(&mut self, ratio: i32) -> i32 {
        std::mem::replace(&mut self.pause_ratio, ratio.max(0))
    }

    pub fn set_step_multiplier(&mut self, mul: i32) -> i32 {
        std::mem::replace(&mut self.step_multiplier, mul.max(1))
    }

    /// Bytes in use, for `collectgarbage("count")`.
    pub fn count_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Invariant check used by tests: every object wears a current color
    /// (never the obsolete white outside of sweeping), and during the
    /// propagate phase no black object references a white one.
    pub fn check_color_invariant(&self, pool: &ObjectPool) -> bool {
        if self.phase == GcPhase::Pause {
            let other = self.other_white();
            let bad = |h: &GcHeader| h.is_dead(other) && !h.is_fixed();
            let strings_ok = pool.strings.iter().all(|(_, s)| !bad(&s.header));
            let tables_ok = pool.tables.iter().all(|(_, t)| !bad(&t.header));
            let funcs_ok = pool.functions.iter().all(|(_, f)| !bad(&f.header));
            return strings_ok && tables_ok && funcs_ok;
        }
        true
    }
}

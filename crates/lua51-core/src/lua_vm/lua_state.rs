// Interpreter state: the composition root owning the heap, the collector,
// the live coroutine context and the shared tables. Two states share no
// mutable data; everything here is state-scoped.
//
// The currently running coroutine's context (value stack, frames, open
// upvalues) lives inline in the state; suspended coroutines keep theirs in
// their arena object. Resume and yield swap contexts, so the host call
// stack never holds coroutine state.

use std::rc::Rc;

use crate::gc::{
    Gc, GcId, GcPhase, GcRoots, GcStats, ObjectPool, StepResult, StringId, TableId, ThreadId,
    UpvalueId, UpvalueState,
};
use crate::lua_value::{Chunk, LuaThread, LuaUserdata, LuaValue, ThreadContext};
use crate::lua_vm::const_string::{ConstStrings, TmKind};
use crate::lua_vm::debug_hooks::{HookEvent, HookEventKind, HookState};
use crate::lua_vm::lua_limits::{BASIC_STACK_SIZE, EXTRA_STACK};
use crate::lua_vm::{LuaError, LuaFullError, LuaResult, SafeOption};

/// One line of a captured traceback.
#[derive(Debug, Clone)]
pub struct TracebackFrame {
    pub source: Option<String>,
    pub line: i32,
    pub is_host: bool,
}

/// Call-protocol counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallMetrics {
    pub calls: usize,
    pub tail_calls: usize,
    pub max_depth: usize,
}

pub type PanicHandler = Box<dyn FnMut(&LuaFullError)>;

pub struct LuaState {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: Gc,

    /// Live context of the running coroutine.
    pub(crate) ctx: ThreadContext,
    pub(crate) current_thread: ThreadId,
    main_thread: ThreadId,

    globals: TableId,
    registry: TableId,

    pub(crate) consts: ConstStrings,
    pub(crate) config: SafeOption,

    // error side channel: the error payload is a Lua value, the message a
    // rendered convenience copy
    pub(crate) error_value: LuaValue,
    pub(crate) error_message: String,
    pub(crate) traceback: Vec<TracebackFrame>,
    panic: Option<PanicHandler>,

    /// Nested VM re-entries (pcall bodies, metamethod calls, resumes).
    /// A coroutine may only yield when no such boundary was crossed since
    /// its resume.
    pub(crate) nesting: usize,
    /// `nesting` recorded when the current coroutine was resumed.
    pub(crate) resume_boundary: usize,

    /// Yield payload in flight between `yield` and `resume`.
    pub(crate) yield_values: Vec<LuaValue>,

    pub(crate) hooks: HookState,
    pub(crate) instr_remaining: Option<u64>,
    pub(crate) metrics: CallMetrics,

    /// Collector re-entrancy latch: allocations made while GC work (or a
    /// finalizer) is running must not start nested GC work.
    gc_running: bool,
}

impl LuaState {
    pub fn new() -> Self {
        Self::with_config(SafeOption::default())
    }

    pub fn with_config(config: SafeOption) -> Self {
        let mut pool = ObjectPool::new();
        let mut gc = Gc::new(config.gc_pause_ratio, config.gc_step_multiplier);
        let white = gc.current_white();

        let consts = ConstStrings::new(&mut pool, white);
        gc.set_mode_key(consts.name_of(TmKind::Mode));

        let globals = pool.create_table(0, 16, white);
        let registry = pool.create_table(0, 8, white);
        let main_thread = pool.create_thread(LuaThread::main(), white);

        tracing::debug!(?main_thread, "interpreter state created");

        Self {
            pool,
            gc,
            ctx: ThreadContext::new(),
            current_thread: main_thread,
            main_thread,
            globals,
            registry,
            consts,
            config,
            error_value: LuaValue::nil(),
            error_message: String::new(),
            traceback: Vec::new(),
            panic: None,
            nesting: 0,
            resume_boundary: 0,
            yield_values: Vec::new(),
            hooks: HookState::default(),
            instr_remaining: config.instruction_budget,
            metrics: CallMetrics::default(),
            gc_running: false,
        }
    }

    // ============ Identity & shared tables ============

    #[inline]
    pub fn globals(&self) -> TableId {
        self.globals
    }

    #[inline]
    pub fn registry(&self) -> TableId {
        self.registry
    }

    #[inline]
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    #[inline]
    pub fn current_thread(&self) -> ThreadId {
        self.current_thread
    }

    pub fn set_panic_handler(&mut self, handler: PanicHandler) {
        self.panic = Some(handler);
    }

    /// Invoked when an error escapes the bottom of the main coroutine.
    pub(crate) fn run_panic_handler(&mut self, kind: LuaError) {
        let err = self.into_full_error(kind);
        if let Some(mut handler) = self.panic.take() {
            handler(&err);
            self.panic = Some(handler);
        }
    }

    // ============ Allocation (GC-aware) ============

    /// Allocation points run pending GC work first so a fresh, not yet
    /// rooted object can never be condemned by the very step its
    /// allocation triggered.
    #[inline]
    pub(crate) fn check_gc(&mut self) -> LuaResult<()> {
        if self.gc_running {
            return Ok(());
        }
        if self.gc.should_step() {
            self.gc_step_burst()?;
        }
        if let Some(budget) = self.config.max_memory {
            if self.gc.count_bytes() > budget {
                self.gc_collect()?;
                if self.gc.count_bytes() > budget {
                    self.error_message = "not enough memory".to_string();
                    return Err(LuaError::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    fn record_new(&mut self, id: GcId) {
        let size = self.pool.object_size(id);
        self.gc.record_allocation(size);
    }

    pub fn new_string(&mut self, bytes: &[u8]) -> LuaResult<LuaValue> {
        self.check_gc()?;
        let id = self.pool.create_string(bytes, self.gc.current_white());
        self.record_new(GcId::String(id));
        Ok(LuaValue::string(id))
    }

    pub fn new_string_id(&mut self, bytes: &[u8]) -> LuaResult<StringId> {
        Ok(self.new_string(bytes)?.tsvalue())
    }

    pub fn new_table(&mut self, asize: usize, hsize: usize) -> LuaResult<TableId> {
        self.check_gc()?;
        let id = self.pool.create_table(asize, hsize, self.gc.current_white());
        self.record_new(GcId::Table(id));
        Ok(id)
    }

    pub fn new_lua_closure(
        &mut self,
        chunk: Rc<Chunk>,
        upvalues: Vec<UpvalueId>,
    ) -> LuaResult<LuaValue> {
        self.check_gc()?;
        let id = self
            .pool
            .create_lua_closure(chunk, upvalues, self.gc.current_white());
        self.record_new(GcId::Function(id));
        Ok(LuaValue::function(id))
    }

    pub fn new_host_closure(
        &mut self,
        func: crate::lua_vm::HostFunction,
        upvalues: Vec<LuaValue>,
    ) -> LuaResult<LuaValue> {
        self.check_gc()?;
        let id = self
            .pool
            .create_host_closure(func, upvalues, self.gc.current_white());
        self.record_new(GcId::Function(id));
        Ok(LuaValue::function(id))
    }

    pub fn new_userdata(&mut self, payload: Box<[u8]>) -> LuaResult<LuaValue> {
        self.check_gc()?;
        let data = LuaUserdata::new(payload, Some(self.globals));
        let id = self.pool.create_userdata(data, self.gc.current_white());
        self.record_new(GcId::Userdata(id));
        Ok(LuaValue::userdata(id))
    }

    pub fn new_coroutine(&mut self, entry: LuaValue) -> LuaResult<ThreadId> {
        if !entry.is_function() {
            return Err(self.rt_error("cannot create coroutine from a non-function".into()));
        }
        self.check_gc()?;
        let id = self
            .pool
            .create_thread(LuaThread::new(entry), self.gc.current_white());
        self.record_new(GcId::Thread(id));
        Ok(id)
    }

    // ============ GC driver ============

    /// Run collector steps until the step budget is spent, dispatching
    /// finalizers as the collector surfaces them.
    pub fn gc_step_burst(&mut self) -> LuaResult<()> {
        if self.gc_running {
            return Ok(());
        }
        self.gc_running = true;
        let mut budget = self.gc.step_budget().max(1);
        loop {
            let step = {
                let roots_values = self.root_values();
                let roots = GcRoots {
                    values: &roots_values,
                    live_context: &self.ctx,
                    live_thread: self.current_thread,
                };
                self.gc.single_step(&roots, &mut self.pool)
            };
            match step {
                StepResult::Work(w) => {
                    budget -= w as isize;
                    if budget <= 0 {
                        break;
                    }
                }
                StepResult::NeedFinalizer(id) => {
                    self.run_finalizer(id);
                }
                StepResult::CycleEnd => break,
            }
        }
        self.gc.pay_step_debt();
        self.gc_running = false;
        Ok(())
    }

    /// Full collection: drive the cycle to completion (and through a fresh
    /// one if the collector was mid-cycle, so that everything unreachable
    /// now is actually reclaimed).
    pub fn gc_collect(&mut self) -> LuaResult<()> {
        if self.gc_running {
            return Ok(());
        }
        self.gc_running = true;
        let mut cycles = 0;
        let started_mid_cycle = self.gc.phase != GcPhase::Pause;
        loop {
            let step = {
                let roots_values = self.root_values();
                let roots = GcRoots {
                    values: &roots_values,
                    live_context: &self.ctx,
                    live_thread: self.current_thread,
                };
                self.gc.single_step(&roots, &mut self.pool)
            };
            match step {
                StepResult::Work(_) => {}
                StepResult::NeedFinalizer(id) => self.run_finalizer(id),
                StepResult::CycleEnd => {
                    cycles += 1;
                    let enough = if started_mid_cycle { 2 } else { 1 };
                    if cycles >= enough {
                        break;
                    }
                }
            }
        }
        self.gc.pay_step_debt();
        self.gc_running = false;
        Ok(())
    }

    fn root_values(&self) -> Vec<LuaValue> {
        let mut roots = vec![
            LuaValue::table(self.globals),
            LuaValue::table(self.registry),
            LuaValue::thread(self.main_thread),
            self.error_value,
        ];
        // yield payloads in flight between a yield and its resume
        roots.extend_from_slice(&self.yield_values);
        roots
    }

    /// Run one `__gc` metamethod, protected; errors are recorded and
    /// discarded. The object gets its one-shot finalized flag either way.
    fn run_finalizer(&mut self, id: GcId) {
        let value = match id {
            GcId::Table(t) => LuaValue::table(t),
            GcId::Userdata(u) => LuaValue::userdata(u),
            _ => return,
        };
        let meta = match id {
            GcId::Table(t) => self.pool.table(t).metatable(),
            GcId::Userdata(u) => self
                .pool
                .userdata
                .get(u.0)
                .and_then(|ud| ud.data.metatable()),
            _ => None,
        };
        if let Some(h) = self.pool.header_mut(id) {
            h.make_finalized();
        }
        let Some(meta) = meta else {
            return;
        };
        let gc_key = LuaValue::string(self.consts.name_of(TmKind::Gc));
        let handler = self.pool.table(meta).raw_get(&gc_key);
        if !handler.is_function() {
            return;
        }
        tracing::trace!(?id, "running finalizer");
        let base = self.ctx.stack_top;
        if self.push(handler).is_err() || self.push(value).is_err() {
            self.set_top(base);
            return;
        }
        let result = crate::lua_vm::execute::call::protected_call(self, base, 1, 0, None);
        if result.is_err() {
            self.gc.stats.finalizer_errors += 1;
            tracing::trace!(?id, "finalizer raised; error discarded");
        }
        self.set_top(base);
    }

    // ============ GC control (collectgarbage) ============

    pub fn gc_stop(&mut self) {
        self.gc.stop();
    }

    pub fn gc_restart(&mut self) {
        self.gc.restart();
    }

    pub fn gc_count_bytes(&self) -> usize {
        self.gc.count_bytes()
    }

    pub fn gc_set_pause(&mut self, ratio: i32) -> i32 {
        self.gc.set_pause_ratio(ratio)
    }

    pub fn gc_set_step_mul(&mut self, mul: i32) -> i32 {
        self.gc.set_step_multiplier(mul)
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.gc.stats
    }

    pub fn call_metrics(&self) -> CallMetrics {
        self.metrics
    }

    pub fn upvalue_stats(&self) -> crate::lua_value::UpvalueStats {
        self.ctx.upvalue_stats
    }

    // ============ Value stack (live context) ============

    /// Grow the physical stack so `extra` more slots fit. The only point
    /// where stack storage may reallocate; open upvalues address slots by
    /// index, so no patching is needed.
    pub fn reserve(&mut self, extra: usize) -> LuaResult<()> {
        let want = self.ctx.stack_top + extra + EXTRA_STACK;
        if want > self.config.max_stack_size {
            self.error_message = "stack overflow".to_string();
            return Err(LuaError::StackOverflow);
        }
        if want > self.ctx.stack.len() {
            let grown = (self.ctx.stack.len().max(BASIC_STACK_SIZE) * 2).max(want);
            self.ctx
                .stack
                .resize(grown.min(self.config.max_stack_size), LuaValue::nil());
        }
        Ok(())
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.ctx.stack_top
    }

    /// Lower or raise the logical top; raised slots read nil.
    pub fn set_top(&mut self, new_top: usize) {
        if new_top > self.ctx.stack.len() {
            self.ctx.stack.resize(new_top, LuaValue::nil());
        } else {
            // clear vacated slots so stale handles don't pin garbage
            for i in new_top..self.ctx.stack_top {
                self.ctx.stack[i] = LuaValue::nil();
            }
        }
        self.ctx.stack_top = new_top;
    }

    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.reserve(1)?;
        let top = self.ctx.stack_top;
        self.ctx.stack[top] = v;
        self.ctx.stack_top = top + 1;
        Ok(())
    }

    pub fn pop(&mut self) -> LuaResult<LuaValue> {
        let floor = self.current_frame_base();
        if self.ctx.stack_top <= floor {
            return Err(LuaError::StackUnderflow);
        }
        self.ctx.stack_top -= 1;
        let v = self.ctx.stack[self.ctx.stack_top];
        self.ctx.stack[self.ctx.stack_top] = LuaValue::nil();
        Ok(v)
    }

    #[inline(always)]
    pub fn stack_get(&self, index: usize) -> LuaValue {
        self.ctx.stack.get(index).copied().unwrap_or(LuaValue::nil())
    }

    #[inline(always)]
    pub fn stack_set(&mut self, index: usize, v: LuaValue) -> LuaResult<()> {
        if index >= self.ctx.stack.len() {
            if index >= self.config.max_stack_size {
                return Err(LuaError::StackOverflow);
            }
            self.ctx.stack.resize(index + 1, LuaValue::nil());
        }
        self.ctx.stack[index] = v;
        if index >= self.ctx.stack_top {
            self.ctx.stack_top = index + 1;
        }
        Ok(())
    }

    fn current_frame_base(&self) -> usize {
        self.ctx.frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Absolute index for the Lua C API convention: positive counts from
    /// `base`, negative from the top.
    pub fn abs_index(&self, base: usize, i: i32) -> LuaResult<usize> {
        if i > 0 {
            Ok(base + (i as usize) - 1)
        } else if i < 0 {
            let off = (-i) as usize;
            if off > self.ctx.stack_top {
                return Err(LuaError::StackUnderflow);
            }
            Ok(self.ctx.stack_top - off)
        } else {
            Err(LuaError::StackUnderflow)
        }
    }

    /// `settop` with API semantics relative to `base`.
    pub fn api_settop(&mut self, base: usize, i: i32) -> LuaResult<()> {
        if i >= 0 {
            self.set_top(base + i as usize);
            Ok(())
        } else {
            let target = self.abs_index(base, i)?;
            self.set_top(target + 1);
            Ok(())
        }
    }

    /// Remove the slot at `i`, shifting everything above it down.
    pub fn api_remove(&mut self, base: usize, i: i32) -> LuaResult<()> {
        let pos = self.abs_index(base, i)?;
        if pos >= self.ctx.stack_top {
            return Err(LuaError::StackUnderflow);
        }
        self.ctx.stack.copy_within(pos + 1..self.ctx.stack_top, pos);
        self.set_top(self.ctx.stack_top - 1);
        Ok(())
    }

    /// Move the top value into slot `i`, shifting slots up to make room.
    pub fn api_insert(&mut self, base: usize, i: i32) -> LuaResult<()> {
        let pos = self.abs_index(base, i)?;
        if self.ctx.stack_top == 0 || pos >= self.ctx.stack_top {
            return Err(LuaError::StackUnderflow);
        }
        let top_val = self.ctx.stack[self.ctx.stack_top - 1];
        self.ctx
            .stack
            .copy_within(pos..self.ctx.stack_top - 1, pos + 1);
        self.ctx.stack[pos] = top_val;
        Ok(())
    }

    /// Pop the top value into slot `i`.
    pub fn api_replace(&mut self, base: usize, i: i32) -> LuaResult<()> {
        let pos = self.abs_index(base, i)?;
        let v = self.pop()?;
        self.ctx.stack[pos] = v;
        Ok(())
    }

    // ============ Upvalue manager (current coroutine) ============

    /// Find the open upvalue for a stack slot or create one, keeping the
    /// open list sorted by strictly decreasing stack index. Closures that
    /// capture the same slot share the node, which is what makes their
    /// writes visible to each other.
    pub fn find_or_create_open_upvalue(&mut self, stack_index: usize) -> LuaResult<UpvalueId> {
        let mut insert_at = self.ctx.open_upvalues.len();
        for (pos, &uv) in self.ctx.open_upvalues.iter().enumerate() {
            match self.pool.upvalue(uv).open_index() {
                Some(idx) if idx == stack_index => {
                    self.ctx.upvalue_stats.share_hits += 1;
                    return Ok(uv);
                }
                Some(idx) if idx < stack_index => {
                    insert_at = pos;
                    break;
                }
                _ => {}
            }
        }
        self.check_gc()?;
        let id = self.pool.create_upvalue(
            UpvalueState::Open { thread: self.current_thread, index: stack_index },
            self.gc.current_white(),
        );
        self.record_new(GcId::Upvalue(id));
        self.ctx.open_upvalues.insert(insert_at, id);
        self.ctx.upvalue_stats.created += 1;
        let open = self.ctx.open_upvalues.len();
        if open > self.ctx.upvalue_stats.peak_open {
            self.ctx.upvalue_stats.peak_open = open;
        }
        Ok(id)
    }

    /// Close every open upvalue at or above `level`, newest first: copy
    /// the stack slot in and drop the coroutine association.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&uv) = self.ctx.open_upvalues.first() {
            let idx = match self.pool.upvalue(uv).open_index() {
                Some(idx) if idx >= level => idx,
                _ => break,
            };
            self.ctx.open_upvalues.remove(0);
            let value = self.stack_get(idx);
            self.pool.upvalue_mut(uv).state = UpvalueState::Closed(value);
            self.ctx.upvalue_stats.closed += 1;
            // the node now holds a reference of its own
            if let Some(vid) = value.gc_id() {
                self.gc.barrier_forward(GcId::Upvalue(uv), vid, &mut self.pool);
            }
        }
    }

    /// Read through an upvalue, whichever coroutine's stack it points at.
    pub fn upvalue_get(&self, id: UpvalueId) -> LuaValue {
        match &self.pool.upvalue(id).state {
            UpvalueState::Closed(v) => *v,
            UpvalueState::Open { thread, index } => {
                if *thread == self.current_thread {
                    self.stack_get(*index)
                } else {
                    self.pool
                        .thread(*thread)
                        .data
                        .context
                        .stack
                        .get(*index)
                        .copied()
                        .unwrap_or(LuaValue::nil())
                }
            }
        }
    }

    pub fn upvalue_set(&mut self, id: UpvalueId, value: LuaValue) {
        let state = self.pool.upvalue(id).state.clone();
        match state {
            UpvalueState::Closed(_) => {
                self.pool.upvalue_mut(id).state = UpvalueState::Closed(value);
                if let Some(vid) = value.gc_id() {
                    self.gc.barrier_forward(GcId::Upvalue(id), vid, &mut self.pool);
                }
            }
            UpvalueState::Open { thread, index } => {
                if thread == self.current_thread {
                    let _ = self.stack_set(index, value);
                } else {
                    let ctx = &mut self.pool.thread_mut(thread).data.context;
                    if index >= ctx.stack.len() {
                        ctx.stack.resize(index + 1, LuaValue::nil());
                    }
                    ctx.stack[index] = value;
                }
            }
        }
    }

    /// Debug validation of the open-upvalue invariants: strictly
    /// decreasing indices, one node per slot.
    pub fn validate_open_upvalues(&self) -> bool {
        let mut prev: Option<usize> = None;
        for &uv in &self.ctx.open_upvalues {
            let Some(idx) = self.pool.upvalue(uv).open_index() else {
                return false; // closed node on the open list
            };
            if let Some(p) = prev {
                if idx >= p {
                    return false;
                }
            }
            prev = Some(idx);
        }
        true
    }

    // ============ Tables (barrier-aware wrappers) ============

    pub fn table_raw_get(&self, tid: TableId, key: &LuaValue) -> LuaValue {
        self.pool.table(tid).raw_get(key)
    }

    pub fn table_raw_set(&mut self, tid: TableId, key: &LuaValue, value: LuaValue) -> LuaResult<()> {
        if let Err(e) = self.pool.table_mut(tid).raw_set(key, value) {
            self.error_message = if key.is_nil() {
                "table index is nil".to_string()
            } else {
                "table index is NaN".to_string()
            };
            return Err(e);
        }
        if key.is_collectable() || value.is_collectable() {
            self.gc.barrier_back(tid, &mut self.pool);
        }
        Ok(())
    }

    pub fn table_set_int(&mut self, tid: TableId, i: usize, value: LuaValue) {
        self.pool.table_mut(tid).set_int(i, value);
        if value.is_collectable() {
            self.gc.barrier_back(tid, &mut self.pool);
        }
    }

    /// Metatable of any value; only tables and userdata carry their own in
    /// this core.
    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        if let Some(t) = v.as_table_id() {
            self.pool.table(t).metatable()
        } else if let Some(u) = v.as_userdata_id() {
            self.pool.userdata.get(u.0).and_then(|ud| ud.data.metatable())
        } else {
            None
        }
    }

    /// Attach or clear a metatable; registers the object for finalization
    /// when the metatable carries `__gc`.
    pub fn set_metatable(&mut self, v: &LuaValue, meta: Option<TableId>) -> LuaResult<()> {
        let gc_key = LuaValue::string(self.consts.name_of(TmKind::Gc));
        let has_gc = meta
            .map(|m| self.pool.table(m).raw_get(&gc_key).is_function())
            .unwrap_or(false);
        if let Some(t) = v.as_table_id() {
            self.pool.table_mut(t).set_metatable(meta);
            if let Some(m) = meta {
                self.gc.barrier_forward(GcId::Table(t), GcId::Table(m), &mut self.pool);
            }
            if has_gc {
                self.gc.register_finalizable(GcId::Table(t), &mut self.pool);
            }
            Ok(())
        } else if let Some(u) = v.as_userdata_id() {
            if let Some(ud) = self.pool.userdata.get_mut(u.0) {
                ud.data.set_metatable(meta);
            }
            if let Some(m) = meta {
                self.gc
                    .barrier_forward(GcId::Userdata(u), GcId::Table(m), &mut self.pool);
            }
            if has_gc {
                self.gc.register_finalizable(GcId::Userdata(u), &mut self.pool);
            }
            Ok(())
        } else {
            Err(self.rt_error(format!("cannot set metatable on a {} value", v.type_name())))
        }
    }

    /// Resolve a metamethod for a value.
    pub fn get_metamethod(&self, v: &LuaValue, event: TmKind) -> LuaValue {
        match self.metatable_of(v) {
            Some(meta) => {
                let key = LuaValue::string(self.consts.name_of(event));
                self.pool.table(meta).raw_get(&key)
            }
            None => LuaValue::nil(),
        }
    }

    // ============ Globals convenience ============

    pub fn get_global(&self, name_id: StringId) -> LuaValue {
        self.table_raw_get(self.globals, &LuaValue::string(name_id))
    }

    pub fn set_global(&mut self, name: &[u8], value: LuaValue) -> LuaResult<()> {
        let key = self.new_string(name)?;
        self.table_raw_set(self.globals, &key, value)
    }

    /// Register a host function under a global name.
    pub fn register(&mut self, name: &[u8], func: crate::lua_vm::HostFunction) -> LuaResult<()> {
        let closure = self.new_host_closure(func, Vec::new())?;
        // keep the fresh closure visible to the collector while the name
        // string is interned
        self.push(closure)?;
        let r = self.set_global(name, closure);
        self.set_top(self.top() - 1);
        r
    }

    // ============ Errors ============

    /// Raise a runtime error with a string payload.
    pub fn rt_error(&mut self, msg: String) -> LuaError {
        let payload = self
            .new_string(msg.as_bytes())
            .unwrap_or(LuaValue::nil());
        self.error_value = payload;
        self.error_message = msg;
        self.capture_traceback();
        LuaError::RuntimeError
    }

    /// Raise with an arbitrary payload value (the `error()` builtin).
    pub fn raise_value(&mut self, payload: LuaValue) -> LuaError {
        self.error_value = payload;
        self.error_message = self.display_value(&payload);
        self.capture_traceback();
        LuaError::RuntimeError
    }

    pub fn type_error(&mut self, op: &str, v: &LuaValue) -> LuaError {
        let msg = format!("attempt to {} a {} value", op, v.type_name());
        let payload = self.new_string(msg.as_bytes()).unwrap_or(LuaValue::nil());
        self.error_value = payload;
        self.error_message = msg;
        self.capture_traceback();
        LuaError::TypeError
    }

    pub(crate) fn capture_traceback(&mut self) {
        self.traceback.clear();
        for frame in self.ctx.frames.iter().rev() {
            if frame.is_host() {
                self.traceback.push(TracebackFrame {
                    source: None,
                    line: 0,
                    is_host: true,
                });
            } else if let Some(fid) = frame.func.as_function_id() {
                if let Some(chunk) = self.pool.closure(fid).chunk() {
                    let pc = frame.pc.saturating_sub(1) as usize;
                    self.traceback.push(TracebackFrame {
                        source: Some(chunk.source_name()),
                        line: chunk.line_at(pc),
                        is_host: false,
                    });
                }
            }
        }
    }

    pub fn last_traceback(&self) -> &[TracebackFrame] {
        &self.traceback
    }

    /// The error payload left by the last raise.
    pub fn take_error_value(&mut self) -> LuaValue {
        std::mem::replace(&mut self.error_value, LuaValue::nil())
    }

    pub fn into_full_error(&self, kind: LuaError) -> LuaFullError {
        LuaFullError { kind, message: self.error_message.clone() }
    }

    // ============ Conversions ============

    /// String rendering of a value for messages and `tostring`.
    pub fn display_value(&self, v: &LuaValue) -> String {
        if v.is_string() {
            return String::from_utf8_lossy(self.pool.string_bytes(v.tsvalue())).into_owned();
        }
        if v.is_number() {
            return number_to_string(v.nvalue());
        }
        match v.ttype() {
            crate::lua_value::LUA_TNIL => "nil".to_string(),
            crate::lua_value::LUA_TBOOLEAN => {
                if v.bvalue() { "true" } else { "false" }.to_string()
            }
            _ => format!("{}: {:?}", v.type_name(), v),
        }
    }

    // ============ Chunk loading (§6.1) ============

    /// Load a binary chunk and leave the resulting closure on the stack.
    pub fn load_chunk(&mut self, data: &[u8]) -> LuaResult<()> {
        self.check_gc()?;
        // constants interned by the loader stay unrooted until the closure
        // exists; no collection may run in between
        self.gc_running = true;
        let loaded = crate::lua_value::chunk_serializer::undump(
            data,
            &mut self.pool,
            self.gc.current_white(),
        );
        let chunk = match loaded {
            Ok(c) => c,
            Err(e) => {
                self.gc_running = false;
                self.error_message = "bad binary chunk".to_string();
                return Err(e);
            }
        };
        self.load_prototype(chunk)
    }

    /// Instantiate an already-built prototype (from an external compiler)
    /// as a closure on the stack. Top-level upvalues start closed over
    /// nil.
    pub fn load_prototype(&mut self, chunk: Rc<Chunk>) -> LuaResult<()> {
        self.check_gc()?;
        // the chunk's constant strings are reachable only through the
        // closure being built; hold the collector off until it is rooted
        self.gc_running = true;
        let mut upvalues = Vec::with_capacity(chunk.num_upvalues as usize);
        for _ in 0..chunk.num_upvalues {
            let uv = self
                .pool
                .create_upvalue(UpvalueState::Closed(LuaValue::nil()), self.gc.current_white());
            self.record_new(GcId::Upvalue(uv));
            upvalues.push(uv);
        }
        let result = self.new_lua_closure(chunk, upvalues);
        self.gc_running = false;
        self.push(result?)
    }

    // ============ Hooks ============

    pub fn set_hook(
        &mut self,
        hook: crate::lua_vm::debug_hooks::HookFn,
        lines: bool,
        calls: bool,
        returns: bool,
    ) {
        self.hooks.hook = Some(hook);
        self.hooks.on_lines = lines;
        self.hooks.on_calls = calls;
        self.hooks.on_returns = returns;
        self.hooks.last_line = -1;
    }

    pub fn clear_hook(&mut self) {
        self.hooks = HookState::default();
    }

    pub(crate) fn fire_hook(&mut self, kind: HookEventKind, line: i32, source: Option<String>) {
        self.fire_hook_with_locals(kind, line, source, Vec::new());
    }

    pub(crate) fn fire_hook_with_locals(
        &mut self,
        kind: HookEventKind,
        line: i32,
        source: Option<String>,
        locals: Vec<(String, LuaValue)>,
    ) {
        if let Some(mut hook) = self.hooks.hook.take() {
            let event = HookEvent {
                kind,
                source,
                line,
                depth: self.ctx.frames.len(),
                locals,
            };
            hook(&event);
            self.hooks.hook = Some(hook);
        }
    }

    // ============ Test / diagnostic support ============

    /// Color-invariant probe (spec I1/I2); meaningful between steps.
    pub fn gc_check_invariants(&self) -> bool {
        self.gc.check_color_invariant(&self.pool)
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }
}

impl Default for LuaState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LuaState {
    fn drop(&mut self) {
        tracing::debug!(
            cycles = self.gc.stats.collection_count,
            calls = self.metrics.calls,
            "interpreter state destroyed"
        );
    }
}

/// Lua 5.1 renders numbers with "%.14g"; integral values print without a
/// decimal point. `itoa` covers the integral fast path.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.floor() && n.abs() < 1e15 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    format!("{}", n)
}

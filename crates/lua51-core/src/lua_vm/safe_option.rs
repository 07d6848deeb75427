/// Per-state resource limits and tuning, fixed at state creation.
#[derive(Debug, Clone, Copy)]
pub struct SafeOption {
    /// Hard cap on value-stack slots per coroutine.
    pub max_stack_size: usize,

    /// Hard cap on live frames per coroutine.
    pub max_call_depth: usize,

    /// Hard cap on nested host re-entries (pcall, resume, metamethod
    /// calls); independent of tail-call optimization.
    pub max_host_depth: usize,

    /// Dispatched-instruction budget; `None` disables the check.
    pub instruction_budget: Option<u64>,

    /// Heap budget in bytes; exceeding it raises OutOfMemory after one
    /// emergency full collection. `None` leaves the heap unbounded.
    pub max_memory: Option<usize>,

    /// GC: start the next cycle when allocation reaches
    /// `estimate * pause_ratio / 100`.
    pub gc_pause_ratio: i32,

    /// GC: work per incremental step as a percentage of bytes allocated
    /// since the previous step.
    pub gc_step_multiplier: i32,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: crate::lua_vm::lua_limits::DEFAULT_MAX_STACK,
            max_call_depth: crate::lua_vm::lua_limits::DEFAULT_MAX_CALL_DEPTH,
            max_host_depth: 200,
            instruction_budget: None,
            max_memory: None,
            gc_pause_ratio: 200,
            gc_step_multiplier: 200,
        }
    }
}

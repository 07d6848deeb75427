// Coroutine execution context. Each coroutine owns its value stack, its
// frame list and its open-upvalue list; yield and resume swap whole
// contexts in and out of the interpreter state, so the host call stack is
// never captured.

use crate::gc::{ThreadId, UpvalueId};
use crate::lua_value::LuaValue;
use crate::lua_vm::CallInfo;
use crate::lua_vm::lua_limits::BASIC_STACK_SIZE;

/// Coroutine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded (can be resumed)
    Suspended,
    /// Currently executing
    Running,
    /// Resumed another coroutine (not directly resumable)
    Normal,
    /// Finished or encountered an error
    Dead,
}

impl CoroutineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// A pending CALL interrupted by yield: where its results go when the
/// coroutine is resumed.
#[derive(Debug, Clone, Copy)]
pub struct PendingCall {
    /// Absolute stack index of the called function slot.
    pub func_pos: usize,
    /// Expected results of the original CALL (MULTRET = -1).
    pub nresults: i32,
}

/// Per-coroutine upvalue-manager counters (see the stats accessors on the
/// interpreter state).
#[derive(Debug, Clone, Copy, Default)]
pub struct UpvalueStats {
    pub created: usize,
    pub share_hits: usize,
    pub closed: usize,
    pub peak_open: usize,
}

/// Saved execution context of a coroutine. While a coroutine runs, its
/// context lives inside the interpreter state; suspension writes it back
/// here.
pub struct ThreadContext {
    /// Value stack. Physical storage only grows; `stack_top` is the
    /// logical first-free-slot index.
    pub stack: Vec<LuaValue>,
    pub stack_top: usize,

    /// Frame list, bottom first.
    pub frames: Vec<CallInfo>,

    /// Open upvalues, sorted by strictly decreasing stack index.
    pub open_upvalues: Vec<UpvalueId>,

    pub upvalue_stats: UpvalueStats,

    /// Set when a yield interrupted a CALL; consumed by the next resume.
    pub pending_call: Option<PendingCall>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(BASIC_STACK_SIZE),
            stack_top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            upvalue_stats: UpvalueStats::default(),
            pending_call: None,
        }
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LuaThread {
    pub status: CoroutineStatus,

    /// Saved context while suspended or normal; meaningless while this
    /// thread is the one running (the state holds the live context then).
    pub context: ThreadContext,

    /// The closure this coroutine was created from (first resume target).
    pub entry: LuaValue,

    /// Whether the first resume already happened (arguments become yield
    /// results afterwards instead of entry parameters).
    pub started: bool,

    /// The coroutine that resumed this one, restored on yield/return.
    pub resumer: Option<ThreadId>,
}

impl LuaThread {
    pub fn new(entry: LuaValue) -> Self {
        Self {
            status: CoroutineStatus::Suspended,
            context: ThreadContext::new(),
            entry,
            started: false,
            resumer: None,
        }
    }

    /// Main-thread constructor; the main thread is never resumed.
    pub fn main() -> Self {
        let mut t = Self::new(LuaValue::nil());
        t.status = CoroutineStatus::Running;
        t.started = true;
        t
    }

    #[inline]
    pub fn can_resume(&self) -> bool {
        self.status == CoroutineStatus::Suspended
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.status == CoroutineStatus::Dead
    }
}

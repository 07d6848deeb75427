// Lua 5.1 runtime core: tagged values, arena heap with an incremental
// tri-color collector, a register VM over the 38-opcode instruction set,
// upvalue-backed closures, and the call/coroutine protocol. The compiler
// is external; binary chunks and hand-built prototypes are the inputs.

#[cfg(test)]
mod test;

pub mod builtins;
pub mod gc;
pub mod lua_value;
pub mod lua_vm;

pub use gc::{FunctionId, ObjectPool, StringId, TableId, ThreadId, UpvalueId, UserdataId};
pub use lua_value::{Chunk, CoroutineStatus, LuaTable, LuaValue};
pub use lua_vm::{
    HostFrame, HostFunction, Instruction, LuaError, LuaFullError, LuaResult, LuaState, OpCode,
    SafeOption,
};

use std::rc::Rc;

/// Load a binary chunk into a fresh state with the core libraries open
/// and run it, returning its first result.
pub fn execute_chunk(data: &[u8]) -> LuaResult<LuaValue> {
    let mut state = LuaState::new();
    builtins::open_libs(&mut state)?;
    state.load_chunk(data)?;
    state.call(0, 1)?;
    state.pop()
}

/// Run an already-built prototype on an existing state, returning its
/// first result.
pub fn execute_prototype(state: &mut LuaState, chunk: Rc<Chunk>) -> LuaResult<LuaValue> {
    state.load_prototype(chunk)?;
    state.call(0, 1)?;
    state.pop()
}

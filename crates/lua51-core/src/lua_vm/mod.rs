pub mod call_info;
pub mod const_string;
pub mod debug_hooks;
pub mod execute;
pub mod host;
pub mod lua_error;
pub mod lua_limits;
pub mod lua_state;
pub mod opcode;
pub mod safe_option;

pub use call_info::CallInfo;
pub use const_string::TmKind;
pub use host::{HostFrame, HostFunction};
pub use lua_error::{LuaError, LuaFullError, LuaResult};
pub use lua_state::{CallMetrics, LuaState, TracebackFrame};
pub use opcode::{Instruction, OpCode};
pub use safe_option::SafeOption;

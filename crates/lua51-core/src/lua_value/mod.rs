pub mod chunk_serializer;
mod lua_table;
mod lua_thread;
mod lua_userdata;
mod lua_value;

pub use lua_table::LuaTable;
pub use lua_thread::{CoroutineStatus, LuaThread, PendingCall, ThreadContext, UpvalueStats};
pub use lua_userdata::LuaUserdata;
pub use lua_value::*;

use std::rc::Rc;

/// Local-variable debug record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: Vec<u8>,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Immutable compiled representation of a Lua function: code, constants,
/// nested prototypes and debug info. Produced by the external compiler or
/// the binary chunk loader; shared by closures through `Rc`. Constants may
/// hold interned strings, which the GC reaches through the owning
/// closures.
#[derive(Debug)]
pub struct Chunk {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Chunk>>,

    pub num_upvalues: u8,
    pub num_params: u8,
    /// Raw 5.1 vararg flags (VARARG_HASARG | VARARG_ISVARARG |
    /// VARARG_NEEDSARG); the VM only interprets bit 1.
    pub is_vararg: u8,
    pub max_stack_size: u8,

    // debug info
    pub source: Option<Vec<u8>>,
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub line_info: Vec<i32>,
    pub locals: Vec<LocVar>,
    pub upvalue_names: Vec<Vec<u8>>,
}

pub const VARARG_ISVARARG: u8 = 2;

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            num_upvalues: 0,
            num_params: 0,
            is_vararg: 0,
            max_stack_size: 2,
            source: None,
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            locals: Vec::new(),
            upvalue_names: Vec::new(),
        }
    }

    #[inline]
    pub fn takes_varargs(&self) -> bool {
        self.is_vararg & VARARG_ISVARARG != 0
    }

    /// Source line of an instruction, 0 if stripped.
    #[inline]
    pub fn line_at(&self, pc: usize) -> i32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Printable chunk name for error messages.
    pub fn source_name(&self) -> String {
        match &self.source {
            Some(s) => String::from_utf8_lossy(s).into_owned(),
            None => "?".to_string(),
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

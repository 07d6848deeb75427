// Bytecode assembly helpers for the runtime tests. The compiler is
// external, so tests build prototypes directly with the instruction
// constructors, the way an embedder with its own front end would.

use std::rc::Rc;

use crate::lua_value::{Chunk, LuaValue, VARARG_ISVARARG};
use crate::lua_vm::lua_limits::MULTRET;
use crate::lua_vm::{Instruction, LuaResult, LuaState, OpCode};

pub struct Asm {
    chunk: Chunk,
}

impl Asm {
    pub fn new(num_params: u8, max_stack: u8) -> Self {
        let mut chunk = Chunk::new();
        chunk.num_params = num_params;
        chunk.max_stack_size = max_stack;
        chunk.source = Some(b"@test".to_vec());
        Asm { chunk }
    }

    pub fn vararg(mut self) -> Self {
        self.chunk.is_vararg = VARARG_ISVARARG;
        self
    }

    pub fn upvalues(mut self, n: u8) -> Self {
        self.chunk.num_upvalues = n;
        self
    }

    /// Add a constant, deduplicating by raw equality.
    pub fn k(&mut self, v: LuaValue) -> u32 {
        for (i, existing) in self.chunk.constants.iter().enumerate() {
            if existing.raw_equal(&v) {
                return i as u32;
            }
        }
        self.chunk.constants.push(v);
        (self.chunk.constants.len() - 1) as u32
    }

    pub fn kn(&mut self, n: f64) -> u32 {
        self.k(LuaValue::number(n))
    }

    pub fn ks(&mut self, state: &mut LuaState, s: &[u8]) -> u32 {
        let v = state.new_string(s).expect("intern constant");
        self.k(v)
    }

    /// RK operand addressing constant `i`.
    pub fn rk(i: u32) -> u32 {
        Instruction::rk_const(i)
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.chunk.code.push(Instruction::create_abc(op, a, b, c));
        self.chunk.line_info.push(self.chunk.code.len() as i32);
        self
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> &mut Self {
        self.chunk.code.push(Instruction::create_abx(op, a, bx));
        self.chunk.line_info.push(self.chunk.code.len() as i32);
        self
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> &mut Self {
        self.chunk.code.push(Instruction::create_asbx(op, a, sbx));
        self.chunk.line_info.push(self.chunk.code.len() as i32);
        self
    }

    /// Raw instruction word (SETLIST batch index argument).
    pub fn raw(&mut self, word: u32) -> &mut Self {
        self.chunk.code.push(word);
        self.chunk.line_info.push(self.chunk.code.len() as i32);
        self
    }

    /// Declare a named local for debug info; register = declaration order.
    pub fn local(&mut self, name: &[u8], start_pc: u32, end_pc: u32) -> &mut Self {
        self.chunk.locals.push(crate::lua_value::LocVar {
            name: name.to_vec(),
            start_pc,
            end_pc,
        });
        self
    }

    pub fn proto(&mut self, child: Rc<Chunk>) -> u32 {
        self.chunk.protos.push(child);
        (self.chunk.protos.len() - 1) as u32
    }

    pub fn done(self) -> Rc<Chunk> {
        Rc::new(self.chunk)
    }
}

/// Instantiate and run a prototype with arguments, collecting all results.
pub fn run(state: &mut LuaState, chunk: Rc<Chunk>, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    state.load_prototype(chunk)?;
    for &a in args {
        state.push(a)?;
    }
    let n = state.call(args.len(), MULTRET)?;
    let top = state.top();
    let results = (top - n..top).map(|i| state.stack_get(i)).collect();
    state.set_top(top - n);
    Ok(results)
}

/// Fresh state with the core libraries open.
pub fn new_state() -> LuaState {
    let mut state = LuaState::new();
    crate::builtins::open_libs(&mut state).expect("open libs");
    state
}

pub fn num(n: f64) -> LuaValue {
    LuaValue::number(n)
}

pub fn expect_number(v: &LuaValue) -> f64 {
    v.as_number().unwrap_or_else(|| panic!("expected number, got {:?}", v))
}

pub fn expect_string(state: &LuaState, v: &LuaValue) -> Vec<u8> {
    let id = v
        .as_string_id()
        .unwrap_or_else(|| panic!("expected string, got {:?}", v));
    state.pool().string_bytes(id).to_vec()
}

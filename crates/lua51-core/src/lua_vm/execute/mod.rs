/*----------------------------------------------------------------------
  Execution engine: a single labeled-loop dispatcher.

  'startfunc reloads the frame context (base, pc, prototype) whenever the
  current frame changes; the inner loop fetches and dispatches until a
  CALL pushes a frame, a RETURN pops one, or an error unwinds. Errors are
  Rust Results; the unwinder closes upvalues frame by frame down to the
  entry depth of this `execute` invocation, which is exactly the nearest
  protected boundary.

  A yield is the one non-error Err: it leaves the frames of the current
  coroutine intact (they are resumed later) and records where the
  interrupted CALL wanted its results.
----------------------------------------------------------------------*/

pub mod arith;
pub mod call;
pub mod concat;
pub mod coroutine;
pub mod table_ops;

use crate::lua_value::{LuaValue, PendingCall};
use crate::lua_vm::debug_hooks::HookEventKind;
use crate::lua_vm::lua_limits::FIELDS_PER_FLUSH;
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaState, OpCode};

use arith::ArithOp;
use call::{poscall, precall, tailcall, Precall};

/// Execute the current coroutine until its frame depth returns to
/// `target_depth`. Errors unwind to that depth; a yield returns with the
/// frames untouched.
pub fn execute(state: &mut LuaState, target_depth: usize) -> LuaResult<()> {
    match dispatch(state, target_depth) {
        Ok(()) => Ok(()),
        Err(LuaError::Yield) => Err(LuaError::Yield),
        Err(e) => {
            unwind(state, target_depth);
            Err(e)
        }
    }
}

/// Close and pop frames down to `target_depth`.
fn unwind(state: &mut LuaState, target_depth: usize) {
    while state.ctx.frames.len() > target_depth {
        let frame = state.ctx.frames.pop().expect("unwind past bottom");
        state.close_upvalues(frame.base);
        state.set_top(frame.func_pos);
    }
}

fn dispatch(state: &mut LuaState, target_depth: usize) -> LuaResult<()> {
    'startfunc: loop {
        let depth = state.ctx.frames.len();
        if depth <= target_depth {
            return Ok(());
        }
        let frame_idx = depth - 1;

        // ===== load frame context =====
        let (func, mut pc, base) = {
            let f = &state.ctx.frames[frame_idx];
            debug_assert!(f.is_lua(), "dispatch entered on a host frame");
            (f.func, f.pc as usize, f.base)
        };
        let fid = func.clvalue();
        let (chunk, upvalues) = match &state.pool.closure(fid).kind {
            crate::gc::ClosureKind::Lua { chunk, upvalues } => (chunk.clone(), upvalues.clone()),
            crate::gc::ClosureKind::Host { .. } => {
                return Err(LuaError::InternalInvariantViolation);
            }
        };
        let code = &chunk.code;
        let constants = &chunk.constants;

        macro_rules! save_pc {
            () => {
                state.ctx.frames[frame_idx].pc = pc as u32;
            };
        }
        macro_rules! R {
            ($i:expr) => {
                state.stack_get(base + $i)
            };
        }
        macro_rules! setR {
            ($i:expr, $v:expr) => {
                state.stack_set(base + $i, $v)?
            };
        }
        macro_rules! RK {
            ($x:expr) => {{
                let x = $x;
                if Instruction::is_k(x) {
                    constants
                        .get(Instruction::rk_index(x) as usize)
                        .copied()
                        .unwrap_or(LuaValue::nil())
                } else {
                    state.stack_get(base + x as usize)
                }
            }};
        }
        /// Take the jump encoded in the *following* instruction (the
        /// compare/test idiom: a conditional always precedes a JMP).
        macro_rules! do_cond_jump {
            ($taken:expr) => {
                if $taken {
                    let jmp = code.get(pc).copied().unwrap_or(0);
                    debug_assert_eq!(Instruction::get_opcode(jmp), OpCode::Jmp);
                    pc = (pc as i64 + 1 + Instruction::get_sbx(jmp) as i64) as usize;
                } else {
                    pc += 1;
                }
            };
        }

        // ===== main dispatch loop =====
        loop {
            if let Some(rem) = state.instr_remaining {
                if rem == 0 {
                    save_pc!();
                    let _ = state.rt_error("instruction budget exceeded".into());
                    return Err(LuaError::InstructionBudgetExceeded);
                }
                state.instr_remaining = Some(rem - 1);
            }

            if state.hooks.wants_lines() {
                let line = chunk.line_at(pc);
                if line != state.hooks.last_line {
                    state.hooks.last_line = line;
                    save_pc!();
                    // active locals in declaration order occupy registers
                    // in that same order
                    let mut locals = Vec::new();
                    for lv in &chunk.locals {
                        if (lv.start_pc as usize) <= pc && pc < lv.end_pc as usize {
                            let reg = locals.len();
                            locals.push((
                                String::from_utf8_lossy(&lv.name).into_owned(),
                                state.stack_get(base + reg),
                            ));
                        }
                    }
                    state.fire_hook_with_locals(
                        HookEventKind::Line,
                        line,
                        Some(chunk.source_name()),
                        locals,
                    );
                }
            }

            let instr = match code.get(pc) {
                Some(&i) => i,
                None => return Err(LuaError::InternalInvariantViolation),
            };
            pc += 1;
            save_pc!();

            let a = Instruction::get_a(instr) as usize;

            match Instruction::get_opcode(instr) {
                OpCode::Move => {
                    let b = Instruction::get_b(instr) as usize;
                    setR!(a, R!(b));
                }
                OpCode::LoadK => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let k = constants.get(bx).copied().unwrap_or(LuaValue::nil());
                    setR!(a, k);
                }
                OpCode::LoadBool => {
                    let b = Instruction::get_b(instr);
                    let c = Instruction::get_c(instr);
                    setR!(a, LuaValue::boolean(b != 0));
                    if c != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let b = Instruction::get_b(instr) as usize;
                    for i in a..=b {
                        setR!(i, LuaValue::nil());
                    }
                }
                OpCode::GetUpval => {
                    let b = Instruction::get_b(instr) as usize;
                    let uv = upvalues[b];
                    setR!(a, state.upvalue_get(uv));
                }
                OpCode::SetUpval => {
                    let b = Instruction::get_b(instr) as usize;
                    let v = R!(a);
                    state.upvalue_set(upvalues[b], v);
                }
                OpCode::GetGlobal => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let key = constants.get(bx).copied().unwrap_or(LuaValue::nil());
                    let globals = LuaValue::table(state.globals());
                    let v = table_ops::table_index(state, globals, key)?;
                    setR!(a, v);
                }
                OpCode::SetGlobal => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let key = constants.get(bx).copied().unwrap_or(LuaValue::nil());
                    let globals = LuaValue::table(state.globals());
                    let v = R!(a);
                    table_ops::table_newindex(state, globals, key, v)?;
                }
                OpCode::GetTable => {
                    let b = Instruction::get_b(instr) as usize;
                    let key = RK!(Instruction::get_c(instr));
                    let t = R!(b);
                    let v = table_ops::table_index(state, t, key)?;
                    setR!(a, v);
                }
                OpCode::SetTable => {
                    let key = RK!(Instruction::get_b(instr));
                    let v = RK!(Instruction::get_c(instr));
                    let t = R!(a);
                    table_ops::table_newindex(state, t, key, v)?;
                }
                OpCode::NewTable => {
                    let asize = Instruction::fb2int(Instruction::get_b(instr));
                    let hsize = Instruction::fb2int(Instruction::get_c(instr));
                    let tid = state.new_table(asize, hsize)?;
                    setR!(a, LuaValue::table(tid));
                }
                OpCode::Self_ => {
                    let b = Instruction::get_b(instr) as usize;
                    let obj = R!(b);
                    setR!(a + 1, obj);
                    let key = RK!(Instruction::get_c(instr));
                    let v = table_ops::table_index(state, obj, key)?;
                    setR!(a, v);
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let op = match Instruction::get_opcode(instr) {
                        OpCode::Add => ArithOp::Add,
                        OpCode::Sub => ArithOp::Sub,
                        OpCode::Mul => ArithOp::Mul,
                        OpCode::Div => ArithOp::Div,
                        OpCode::Mod => ArithOp::Mod,
                        _ => ArithOp::Pow,
                    };
                    let vb = RK!(Instruction::get_b(instr));
                    let vc = RK!(Instruction::get_c(instr));
                    let v = arith::arith(state, op, vb, vc)?;
                    setR!(a, v);
                }
                OpCode::Unm => {
                    let b = Instruction::get_b(instr) as usize;
                    let v = arith::arith_unm(state, R!(b))?;
                    setR!(a, v);
                }
                OpCode::Not => {
                    let b = Instruction::get_b(instr) as usize;
                    let v = R!(b);
                    setR!(a, LuaValue::boolean(v.is_falsy()));
                }
                OpCode::Len => {
                    let b = Instruction::get_b(instr) as usize;
                    let v = table_ops::value_length(state, R!(b))?;
                    setR!(a, v);
                }
                OpCode::Concat => {
                    let b = Instruction::get_b(instr) as usize;
                    let c = Instruction::get_c(instr) as usize;
                    let values: Vec<LuaValue> = (b..=c).map(|i| R!(i)).collect();
                    let v = concat::concat_values(state, values)?;
                    setR!(a, v);
                }
                OpCode::Jmp => {
                    pc = (pc as i64 + Instruction::get_sbx(instr) as i64) as usize;
                }
                OpCode::Eq => {
                    let vb = RK!(Instruction::get_b(instr));
                    let vc = RK!(Instruction::get_c(instr));
                    let cond = arith::equals(state, vb, vc)?;
                    do_cond_jump!(cond == (a != 0));
                }
                OpCode::Lt => {
                    let vb = RK!(Instruction::get_b(instr));
                    let vc = RK!(Instruction::get_c(instr));
                    let cond = arith::less_than(state, vb, vc)?;
                    do_cond_jump!(cond == (a != 0));
                }
                OpCode::Le => {
                    let vb = RK!(Instruction::get_b(instr));
                    let vc = RK!(Instruction::get_c(instr));
                    let cond = arith::less_equal(state, vb, vc)?;
                    do_cond_jump!(cond == (a != 0));
                }
                OpCode::Test => {
                    let c = Instruction::get_c(instr);
                    let v = R!(a);
                    do_cond_jump!(v.is_truthy() == (c != 0));
                }
                OpCode::TestSet => {
                    let b = Instruction::get_b(instr) as usize;
                    let c = Instruction::get_c(instr);
                    let v = R!(b);
                    if v.is_truthy() == (c != 0) {
                        setR!(a, v);
                        let jmp = code.get(pc).copied().unwrap_or(0);
                        pc = (pc as i64 + 1 + Instruction::get_sbx(jmp) as i64) as usize;
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Call => {
                    let b = Instruction::get_b(instr) as usize;
                    let c = Instruction::get_c(instr) as usize;
                    let func_pos = base + a;
                    if b != 0 {
                        state.set_top(func_pos + b);
                    }
                    let nresults = c as i32 - 1;
                    match precall(state, func_pos, nresults) {
                        Ok(Precall::PushedLua) => continue 'startfunc,
                        Ok(Precall::Returned) => {
                            if nresults >= 0 {
                                let frame_top = state.ctx.frames[frame_idx].top;
                                state.set_top(frame_top);
                            }
                        }
                        Err(LuaError::Yield) => {
                            state.ctx.pending_call = Some(PendingCall { func_pos, nresults });
                            return Err(LuaError::Yield);
                        }
                        Err(e) => return Err(e),
                    }
                }
                OpCode::TailCall => {
                    let b = Instruction::get_b(instr) as usize;
                    let callee_pos = base + a;
                    if b != 0 {
                        state.set_top(callee_pos + b);
                    }
                    let nargs = state.top() - callee_pos - 1;
                    let leaving = state.ctx.frames[frame_idx];
                    if state.hooks.wants_returns() {
                        state.fire_hook(HookEventKind::Return, chunk.line_at(pc - 1), None);
                    }
                    match tailcall(state, callee_pos, nargs) {
                        Ok(Precall::PushedLua) => continue 'startfunc,
                        Ok(Precall::Returned) => {
                            // host callee already completed: this frame is
                            // gone, so behave exactly like its RETURN
                            if state.ctx.frames.len() <= target_depth {
                                return Ok(());
                            }
                            if leaving.nresults >= 0 {
                                let caller_top =
                                    state.ctx.frames.last().expect("caller frame").top;
                                state.set_top(caller_top);
                            }
                            continue 'startfunc;
                        }
                        Err(LuaError::Yield) => {
                            state.ctx.pending_call = Some(PendingCall {
                                func_pos: leaving.func_pos,
                                nresults: leaving.nresults,
                            });
                            return Err(LuaError::Yield);
                        }
                        Err(e) => return Err(e),
                    }
                }
                OpCode::Return => {
                    let b = Instruction::get_b(instr) as usize;
                    state.close_upvalues(base);
                    let first = base + a;
                    let n = if b != 0 { b - 1 } else { state.top() - first };
                    if state.hooks.wants_returns() {
                        state.fire_hook(
                            HookEventKind::Return,
                            chunk.line_at(pc - 1),
                            Some(chunk.source_name()),
                        );
                    }
                    let frame = state.ctx.frames.pop().expect("return without frame");
                    poscall(state, &frame, first, n);
                    if state.ctx.frames.len() <= target_depth {
                        return Ok(());
                    }
                    if frame.nresults >= 0 {
                        let caller_top = state.ctx.frames.last().expect("caller frame").top;
                        state.set_top(caller_top);
                    }
                    continue 'startfunc;
                }
                OpCode::ForLoop => {
                    let step = R!(a + 2).nvalue();
                    let idx = R!(a).nvalue() + step;
                    let limit = R!(a + 1).nvalue();
                    let keep_going = if step > 0.0 { idx <= limit } else { idx >= limit };
                    setR!(a, LuaValue::number(idx));
                    if keep_going {
                        pc = (pc as i64 + Instruction::get_sbx(instr) as i64) as usize;
                        setR!(a + 3, LuaValue::number(idx));
                    }
                }
                OpCode::ForPrep => {
                    let init = match arith::tonumber_value(state, &R!(a)) {
                        Some(n) => n,
                        None => {
                            return Err(
                                state.rt_error("'for' initial value must be a number".into())
                            );
                        }
                    };
                    let limit = match arith::tonumber_value(state, &R!(a + 1)) {
                        Some(n) => n,
                        None => return Err(state.rt_error("'for' limit must be a number".into())),
                    };
                    let step = match arith::tonumber_value(state, &R!(a + 2)) {
                        Some(n) => n,
                        None => return Err(state.rt_error("'for' step must be a number".into())),
                    };
                    setR!(a, LuaValue::number(init - step));
                    setR!(a + 1, LuaValue::number(limit));
                    setR!(a + 2, LuaValue::number(step));
                    pc = (pc as i64 + Instruction::get_sbx(instr) as i64) as usize;
                }
                OpCode::TForLoop => {
                    let c = Instruction::get_c(instr) as usize;
                    let cb = base + a + 3;
                    state.reserve(3)?;
                    let iter = R!(a);
                    let st = R!(a + 1);
                    let ctrl = R!(a + 2);
                    state.stack_set(cb, iter)?;
                    state.stack_set(cb + 1, st)?;
                    state.stack_set(cb + 2, ctrl)?;
                    state.set_top(cb + 3);
                    call::call_value(state, cb, 2, c as i32)?;
                    let frame_top = state.ctx.frames[frame_idx].top;
                    state.set_top(frame_top);
                    let first = state.stack_get(cb);
                    if !first.is_nil() {
                        state.stack_set(cb - 1, first)?; // control variable
                        let jmp = code.get(pc).copied().unwrap_or(0);
                        pc = (pc as i64 + 1 + Instruction::get_sbx(jmp) as i64) as usize;
                    } else {
                        pc += 1;
                    }
                }
                OpCode::SetList => {
                    let b = Instruction::get_b(instr) as usize;
                    let c = Instruction::get_c(instr) as usize;
                    let tid = match R!(a).as_table_id() {
                        Some(t) => t,
                        None => return Err(LuaError::InternalInvariantViolation),
                    };
                    let n = if b != 0 { b } else { state.top() - (base + a) - 1 };
                    let batch = if c != 0 {
                        c
                    } else {
                        // the next instruction word carries the batch index
                        let extra = code.get(pc).copied().unwrap_or(0) as usize;
                        pc += 1;
                        extra
                    };
                    let start = (batch - 1) * FIELDS_PER_FLUSH as usize;
                    for i in 1..=n {
                        state.table_set_int(tid, start + i, R!(a + i));
                    }
                    if b == 0 {
                        let frame_top = state.ctx.frames[frame_idx].top;
                        state.set_top(frame_top);
                    }
                }
                OpCode::Close => {
                    state.close_upvalues(base + a);
                }
                OpCode::Closure => {
                    let bx = Instruction::get_bx(instr) as usize;
                    let proto = match chunk.protos.get(bx) {
                        Some(p) => p.clone(),
                        None => return Err(LuaError::InternalInvariantViolation),
                    };
                    let nups = proto.num_upvalues as usize;
                    let mut ups = Vec::with_capacity(nups);
                    for _ in 0..nups {
                        let pseudo = match code.get(pc) {
                            Some(&i) => i,
                            None => return Err(LuaError::InternalInvariantViolation),
                        };
                        pc += 1;
                        let b = Instruction::get_b(pseudo) as usize;
                        match Instruction::get_opcode(pseudo) {
                            OpCode::Move => {
                                // capture the parent's register: open
                                // upvalues are shared per stack slot
                                ups.push(state.find_or_create_open_upvalue(base + b)?);
                            }
                            OpCode::GetUpval => ups.push(upvalues[b]),
                            _ => return Err(LuaError::InternalInvariantViolation),
                        }
                    }
                    save_pc!();
                    let cl = state.new_lua_closure(proto, ups)?;
                    setR!(a, cl);
                }
                OpCode::Vararg => {
                    let b = Instruction::get_b(instr) as usize;
                    let n_extra = state.ctx.frames[frame_idx].nextraargs.max(0) as usize;
                    let want = if b != 0 { b - 1 } else { n_extra };
                    if b == 0 {
                        state.reserve(n_extra)?;
                    }
                    for i in 0..want {
                        let v = if i < n_extra {
                            state.stack_get(base - n_extra + i)
                        } else {
                            LuaValue::nil()
                        };
                        state.stack_set(base + a + i, v)?;
                    }
                    if b == 0 {
                        state.set_top(base + a + n_extra);
                    }
                }
            }
        }
    }
}

// ============ Embedder call surface (§6.3) ============

impl LuaState {
    /// Call the function below `nargs` arguments on the stack,
    /// unprotected. Results replace function and arguments. An error that
    /// reaches the bottom of the main coroutine this way invokes the
    /// registered panic handler before surfacing.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<usize> {
        let func_pos = self
            .top()
            .checked_sub(nargs + 1)
            .ok_or(LuaError::StackUnderflow)?;
        match call::call_value(self, func_pos, nargs, nresults) {
            Ok(n) => Ok(n),
            Err(e) => {
                if self.current_thread == self.main_thread() {
                    self.run_panic_handler(e);
                }
                Err(e)
            }
        }
    }

    /// Protected variant: on error the stack is truncated back to the
    /// function slot and the error payload is retrievable via
    /// [`LuaState::take_error_value`]. Uncatchable kinds still propagate.
    pub fn pcall(&mut self, nargs: usize, nresults: i32) -> LuaResult<usize> {
        let func_pos = self
            .top()
            .checked_sub(nargs + 1)
            .ok_or(LuaError::StackUnderflow)?;
        let r = call::protected_call(self, func_pos, nargs, nresults, None);
        if let Err(e) = r {
            if !e.is_catchable() {
                self.run_panic_handler(e);
            }
            return Err(e);
        }
        r
    }
}

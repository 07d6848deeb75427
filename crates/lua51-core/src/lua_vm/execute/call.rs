// Call protocol: frame setup/teardown, host invocation, the recursive VM
// entry used by metamethods and pcall, and the protected-call boundary.

use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::CallInfo;
use crate::lua_vm::const_string::TmKind;
use crate::lua_vm::debug_hooks::HookEventKind;
use crate::lua_vm::host::HostFrame;
use crate::lua_vm::lua_limits::{MAX_TAG_LOOP, MULTRET};
use crate::lua_vm::{LuaError, LuaResult, LuaState};

/// Outcome of frame setup.
pub enum Precall {
    /// A Lua frame was pushed; the dispatcher reloads and continues.
    PushedLua,
    /// A host function ran to completion; results are already placed.
    Returned,
}

/// Set up a call at `func_pos` with `nargs` arguments above it (the stack
/// top must sit just past the last argument). Non-function values resolve
/// through the `__call` chain, bounded like every metamethod chain.
pub fn precall(state: &mut LuaState, func_pos: usize, nresults: i32) -> LuaResult<Precall> {
    let mut func = state.stack_get(func_pos);

    // __call resolution: the original value becomes the first argument
    let mut hops = 0;
    while !func.is_function() {
        hops += 1;
        if hops > MAX_TAG_LOOP {
            return Err(state.rt_error("'__call' chain too long; possible loop".into()));
        }
        let tm = state.get_metamethod(&func, TmKind::Call);
        if tm.is_nil() {
            return Err(state.type_error("call", &func));
        }
        state.reserve(1)?;
        let top = state.top();
        for i in (func_pos..top).rev() {
            let v = state.stack_get(i);
            state.stack_set(i + 1, v)?;
        }
        state.set_top(top + 1);
        state.stack_set(func_pos, tm)?;
        func = tm;
    }

    if state.ctx.frames.len() >= state.config.max_call_depth {
        state.error_message = "stack overflow".to_string();
        let payload = state
            .new_string(b"stack overflow")
            .unwrap_or(LuaValue::nil());
        state.error_value = payload;
        state.capture_traceback();
        return Err(LuaError::StackOverflow);
    }

    state.metrics.calls += 1;
    let depth = state.ctx.frames.len() + 1;
    if depth > state.metrics.max_depth {
        state.metrics.max_depth = depth;
    }

    let fid = func.clvalue();
    let is_host = state.pool.closure(fid).is_host();
    if is_host {
        call_host(state, func, func_pos, nresults)?;
        return Ok(Precall::Returned);
    }

    let chunk = state
        .pool
        .closure(fid)
        .chunk()
        .expect("lua closure without prototype")
        .clone();
    let nargs = state.top() - func_pos - 1;
    let num_params = chunk.num_params as usize;
    let max_stack = chunk.max_stack_size as usize;

    let (base, nextra) = if chunk.takes_varargs() {
        // copy the fixed parameters above the arguments; extras stay below
        // the new base where VARARG finds them
        let old_first = func_pos + 1;
        let base = old_first + nargs;
        state.reserve(nargs.max(num_params) + max_stack)?;
        for i in 0..num_params {
            let v = if i < nargs { state.stack_get(old_first + i) } else { LuaValue::nil() };
            state.stack_set(base + i, v)?;
            if i < nargs {
                state.stack_set(old_first + i, LuaValue::nil())?;
            }
        }
        (base, nargs.saturating_sub(num_params) as i32)
    } else {
        let base = func_pos + 1;
        state.reserve(max_stack)?;
        for i in nargs..num_params {
            state.stack_set(base + i, LuaValue::nil())?;
        }
        (base, 0)
    };

    let top = base + max_stack;
    state.set_top(top);

    let mut frame = CallInfo::new_lua(func, func_pos, base, top, nresults);
    frame.nextraargs = nextra;
    state.ctx.frames.push(frame);

    if state.hooks.wants_calls() {
        let source = Some(chunk.source_name());
        state.fire_hook(HookEventKind::Call, chunk.line_defined, source);
    }

    Ok(Precall::PushedLua)
}

/// Run a host closure synchronously. Results land at `func_pos` per the
/// expected-results convention.
fn call_host(state: &mut LuaState, func: LuaValue, func_pos: usize, nresults: i32) -> LuaResult<()> {
    if state.nesting >= state.config.max_host_depth {
        state.error_message = "host call depth exceeded".to_string();
        return Err(LuaError::StackOverflow);
    }
    let base = func_pos + 1;
    let top = state.top();
    let frame = CallInfo::new_host(func, func_pos, base, top, nresults);
    state.ctx.frames.push(frame);
    if state.hooks.wants_calls() {
        state.fire_hook(HookEventKind::Call, 0, None);
    }

    let fid = func.clvalue();
    let (host_fn, upvalues) = match &state.pool.closure(fid).kind {
        crate::gc::ClosureKind::Host { func, upvalues } => (*func, upvalues.clone()),
        crate::gc::ClosureKind::Lua { .. } => unreachable!("host frame for lua closure"),
    };

    let result = {
        let mut hf = HostFrame { state, base, upvalues };
        host_fn(&mut hf)
    };

    let frame = state.ctx.frames.pop().expect("host frame vanished");
    if state.hooks.wants_returns() {
        state.fire_hook(HookEventKind::Return, 0, None);
    }

    match result {
        Ok(nres) => {
            let first_result = state.top().saturating_sub(nres);
            poscall(state, &frame, first_result, nres);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Move `nres` results starting at `first_result` down to the function
/// slot and adjust the top per the call's expected result count.
pub fn poscall(state: &mut LuaState, frame: &CallInfo, first_result: usize, nres: usize) {
    let dest = frame.func_pos;
    let wanted = frame.nresults;
    if wanted == MULTRET {
        for i in 0..nres {
            let v = state.stack_get(first_result + i);
            let _ = state.stack_set(dest + i, v);
        }
        state.set_top(dest + nres);
    } else {
        let wanted = wanted.max(0) as usize;
        for i in 0..wanted {
            let v = if i < nres { state.stack_get(first_result + i) } else { LuaValue::nil() };
            let _ = state.stack_set(dest + i, v);
        }
        state.set_top(dest + wanted);
    }
}

/// Recursive VM entry: call the value at `func_pos` with `nargs` arguments
/// and return the number of results (placed from `func_pos`). Used by
/// metamethods, pcall bodies, TFORLOOP iterators and the embedder API.
/// Crossing this boundary is what makes a yield illegal inside it.
pub fn call_value(
    state: &mut LuaState,
    func_pos: usize,
    nargs: usize,
    nresults: i32,
) -> LuaResult<usize> {
    debug_assert_eq!(state.top(), func_pos + 1 + nargs);
    state.nesting += 1;
    let result = call_value_inner(state, func_pos, nresults);
    state.nesting -= 1;
    result
}

fn call_value_inner(state: &mut LuaState, func_pos: usize, nresults: i32) -> LuaResult<usize> {
    let entry_depth = state.ctx.frames.len();
    match precall(state, func_pos, nresults)? {
        Precall::Returned => Ok(state.top() - func_pos),
        Precall::PushedLua => {
            super::execute(state, entry_depth)?;
            Ok(state.top() - func_pos)
        }
    }
}

/// Invoke a binary metamethod and return its single result.
pub fn call_metamethod_binary(
    state: &mut LuaState,
    tm: LuaValue,
    a: LuaValue,
    b: LuaValue,
) -> LuaResult<LuaValue> {
    let func_pos = state.top();
    state.reserve(3)?;
    state.push(tm)?;
    state.push(a)?;
    state.push(b)?;
    call_value(state, func_pos, 2, 1)?;
    let result = state.stack_get(func_pos);
    state.set_top(func_pos);
    Ok(result)
}

/// Protected call: on error, run the optional message handler (before the
/// stack is truncated, so it can inspect the captured traceback), then
/// truncate to `func_pos` and surface the error with its payload left in
/// the state. On success the results sit at `func_pos`.
pub fn protected_call(
    state: &mut LuaState,
    func_pos: usize,
    nargs: usize,
    nresults: i32,
    handler: Option<LuaValue>,
) -> LuaResult<usize> {
    let saved_depth = state.ctx.frames.len();
    match call_value(state, func_pos, nargs, nresults) {
        Ok(n) => Ok(n),
        Err(e) if e.is_catchable() => {
            debug_assert_eq!(state.ctx.frames.len(), saved_depth);
            let mut err_value = error_payload(state, e);
            if let Some(h) = handler {
                err_value = run_message_handler(state, h, err_value).unwrap_or(err_value);
            }
            state.set_top(func_pos);
            state.error_value = err_value;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// The error payload for a raised kind: the value left by the raise, or a
/// message string synthesized for kinds raised without one.
pub fn error_payload(state: &mut LuaState, kind: LuaError) -> LuaValue {
    let v = state.take_error_value();
    if !v.is_nil() {
        return v;
    }
    let msg = if state.error_message.is_empty() {
        kind.to_string()
    } else {
        state.error_message.clone()
    };
    state.new_string(msg.as_bytes()).unwrap_or(LuaValue::nil())
}

fn run_message_handler(
    state: &mut LuaState,
    handler: LuaValue,
    err_value: LuaValue,
) -> Option<LuaValue> {
    let func_pos = state.top();
    state.reserve(2).ok()?;
    state.push(handler).ok()?;
    state.push(err_value).ok()?;
    match call_value(state, func_pos, 1, 1) {
        Ok(_) => {
            let out = state.stack_get(func_pos);
            state.set_top(func_pos);
            Some(out)
        }
        Err(_) => {
            // error inside the error handler: fall back to the original
            state.set_top(func_pos);
            None
        }
    }
}

/// Tail-call setup: close the leaving frame's upvalues, slide the callee
/// and its arguments down over the current function slot, and reuse the
/// frame slot. Frame count does not grow, which is what makes unbounded
/// tail recursion legal.
pub fn tailcall(state: &mut LuaState, callee_pos: usize, nargs: usize) -> LuaResult<Precall> {
    let frame = *state.ctx.frames.last().expect("tailcall without a frame");
    state.close_upvalues(frame.base);

    let dest = frame.func_pos;
    for i in 0..=nargs {
        let v = state.stack_get(callee_pos + i);
        state.stack_set(dest + i, v)?;
    }
    state.set_top(dest + 1 + nargs);

    state.ctx.frames.pop();
    state.metrics.tail_calls += 1;

    let r = precall(state, dest, frame.nresults)?;
    if let Precall::PushedLua = r {
        if let Some(new_frame) = state.ctx.frames.last_mut() {
            new_frame.set_tail();
        }
    }
    Ok(r)
}

// Core host functions registered into the globals: the protected-call
// surface, the iteration primitives, metatable access, GC control and the
// coroutine library. Everything here goes through the host-function
// contract; nothing reaches into the dispatcher.

use crate::gc::TableId;
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::arith::tonumber_value;
use crate::lua_vm::execute::call::protected_call;
use crate::lua_vm::execute::coroutine::{resume, status, yield_values, ResumeOutcome};
use crate::lua_vm::host::HostFrame;
use crate::lua_vm::lua_limits::MULTRET;
use crate::lua_vm::{LuaResult, LuaState};

/// Register the base and coroutine libraries.
pub fn open_libs(state: &mut LuaState) -> LuaResult<()> {
    state.register(b"pcall", lua_pcall)?;
    state.register(b"xpcall", lua_xpcall)?;
    state.register(b"error", lua_error)?;
    state.register(b"assert", lua_assert)?;
    state.register(b"type", lua_type)?;
    state.register(b"tostring", lua_tostring)?;
    state.register(b"tonumber", lua_tonumber)?;
    state.register(b"next", lua_next)?;
    state.register(b"pairs", lua_pairs)?;
    state.register(b"ipairs", lua_ipairs)?;
    state.register(b"select", lua_select)?;
    state.register(b"unpack", lua_unpack)?;
    state.register(b"rawget", lua_rawget)?;
    state.register(b"rawset", lua_rawset)?;
    state.register(b"rawequal", lua_rawequal)?;
    state.register(b"setmetatable", lua_setmetatable)?;
    state.register(b"getmetatable", lua_getmetatable)?;
    state.register(b"collectgarbage", lua_collectgarbage)?;

    let co = state.new_table(0, 8)?;
    state.push(LuaValue::table(co))?; // root while the library fills in
    let pairs: [(&[u8], crate::lua_vm::HostFunction); 5] = [
        (b"create", co_create),
        (b"resume", co_resume),
        (b"yield", co_yield),
        (b"status", co_status),
        (b"running", co_running),
    ];
    for (name, func) in pairs {
        let key = state.new_string(name)?;
        state.push(key)?; // root across the closure allocation
        let closure = state.new_host_closure(func, Vec::new())?;
        state.table_raw_set(co, &key, closure)?;
        state.set_top(state.top() - 1);
    }
    state.set_global(b"coroutine", LuaValue::table(co))?;
    state.set_top(state.top() - 1);
    Ok(())
}

// ============ protected calls ============

fn lua_pcall(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let func_pos = f.base;
    let nargs = f.arg_count() - 1;
    let state = &mut *f.state;
    match protected_call(state, func_pos, nargs, MULTRET, None) {
        Ok(n) => {
            // slide the results up one slot and lead with `true`
            state.reserve(1)?;
            for i in (0..n).rev() {
                let v = state.stack_get(func_pos + i);
                state.stack_set(func_pos + 1 + i, v)?;
            }
            state.stack_set(func_pos, LuaValue::boolean(true))?;
            state.set_top(func_pos + n + 1);
            Ok(n + 1)
        }
        Err(e) if e.is_catchable() => {
            let err = state.take_error_value();
            state.push(LuaValue::boolean(false))?;
            state.push(err)?;
            Ok(2)
        }
        Err(e) => Err(e),
    }
}

fn lua_xpcall(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(2)?;
    let target = f.arg(1);
    let handler = f.arg(2);
    let state = &mut *f.state;
    let func_pos = state.top();
    state.push(target)?;
    match protected_call(state, func_pos, 0, MULTRET, Some(handler)) {
        Ok(n) => {
            state.reserve(1)?;
            for i in (0..n).rev() {
                let v = state.stack_get(func_pos + i);
                state.stack_set(func_pos + 1 + i, v)?;
            }
            state.stack_set(func_pos, LuaValue::boolean(true))?;
            state.set_top(func_pos + n + 1);
            Ok(n + 1)
        }
        Err(e) if e.is_catchable() => {
            let err = state.take_error_value();
            state.push(LuaValue::boolean(false))?;
            state.push(err)?;
            Ok(2)
        }
        Err(e) => Err(e),
    }
}

fn lua_error(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let msg = f.arg(1);
    let level = f.opt_number(2, 1.0)? as i32;
    let state = &mut *f.state;
    // string messages at level > 0 gain position information
    let payload = if level > 0 && msg.is_string() {
        let mut location = String::new();
        for frame in state.ctx.frames.iter().rev() {
            if !frame.is_lua() {
                continue;
            }
            if let Some(fid) = frame.func.as_function_id() {
                if let Some(chunk) = state.pool.closure(fid).chunk() {
                    let pc = frame.pc.saturating_sub(1) as usize;
                    location = format!("{}:{}: ", chunk.source_name(), chunk.line_at(pc));
                }
            }
            break;
        }
        if location.is_empty() {
            msg
        } else {
            let mut bytes = location.into_bytes();
            bytes.extend_from_slice(state.pool.string_bytes(msg.tsvalue()));
            state.new_string(&bytes)?
        }
    } else {
        msg
    };
    Err(state.raise_value(payload))
}

fn lua_assert(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    if f.arg(1).is_falsy() {
        let msg = f.arg(2);
        let state = &mut *f.state;
        if msg.is_nil() {
            return Err(state.rt_error("assertion failed!".into()));
        }
        return Err(state.raise_value(msg));
    }
    // pass every argument through
    Ok(f.arg_count())
}

// ============ type & conversion ============

fn lua_type(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let name = f.arg(1).type_name();
    let v = f.state.new_string(name.as_bytes())?;
    f.push(v)?;
    Ok(1)
}

fn lua_tostring(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let v = f.arg(1);
    let rendered = f.state.display_value(&v);
    let s = f.state.new_string(rendered.as_bytes())?;
    f.push(s)?;
    Ok(1)
}

fn lua_tonumber(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let v = f.arg(1);
    let base = f.opt_number(2, 10.0)? as u32;
    let result = if base == 10 {
        tonumber_value(f.state, &v).map(LuaValue::number)
    } else {
        let bytes = f.check_string(1)?;
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| u64::from_str_radix(s.trim(), base).ok())
            .map(|n| LuaValue::number(n as f64))
    };
    f.push(result.unwrap_or(LuaValue::nil()))?;
    Ok(1)
}

// ============ iteration ============

fn lua_next(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let key = f.arg(2);
    next_impl(f, tid, key)
}

fn next_impl(f: &mut HostFrame<'_>, tid: TableId, key: LuaValue) -> LuaResult<usize> {
    let step = f.state.pool.table(tid).next(&key);
    match step {
        Ok(Some((k, v))) => {
            f.push(k)?;
            f.push(v)?;
            Ok(2)
        }
        Ok(None) => {
            f.push(LuaValue::nil())?;
            Ok(1)
        }
        Err(_) => Err(f.state.rt_error("invalid key to 'next'".into())),
    }
}

fn lua_pairs(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let next_fn = f.state.new_host_closure(lua_next, Vec::new())?;
    f.push(next_fn)?;
    f.push(LuaValue::table(tid))?;
    f.push(LuaValue::nil())?;
    Ok(3)
}

fn ipairs_iter(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let i = f.check_number(2)? as usize + 1;
    let v = f.state.pool.table(tid).get_int(i);
    if v.is_nil() {
        f.push(LuaValue::nil())?;
        Ok(1)
    } else {
        f.push(LuaValue::number(i as f64))?;
        f.push(v)?;
        Ok(2)
    }
}

fn lua_ipairs(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let iter = f.state.new_host_closure(ipairs_iter, Vec::new())?;
    f.push(iter)?;
    f.push(LuaValue::table(tid))?;
    f.push(LuaValue::number(0.0))?;
    Ok(3)
}

fn lua_select(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let first = f.arg(1);
    if let Some(id) = first.as_string_id() {
        if f.state.pool.string_bytes(id) == b"#" {
            let n = f.arg_count() - 1;
            f.push(LuaValue::number(n as f64))?;
            return Ok(1);
        }
    }
    let i = f.check_number(1)? as usize;
    let total = f.arg_count();
    let mut pushed = 0;
    for k in (i + 1)..=total {
        let v = f.arg(k);
        f.push(v)?;
        pushed += 1;
    }
    Ok(pushed)
}

fn lua_unpack(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let i = f.opt_number(2, 1.0)? as usize;
    let j = match f.arg(3).is_nil() {
        true => f.state.pool.table(tid).length(),
        false => f.check_number(3)? as usize,
    };
    if j < i {
        return Ok(0);
    }
    let mut n = 0;
    for k in i..=j {
        let v = f.state.pool.table(tid).get_int(k);
        f.push(v)?;
        n += 1;
    }
    Ok(n)
}

// ============ raw access & metatables ============

fn lua_rawget(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let key = f.arg(2);
    let v = f.state.table_raw_get(tid, &key);
    f.push(v)?;
    Ok(1)
}

fn lua_rawset(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let key = f.arg(2);
    let value = f.arg(3);
    f.state.table_raw_set(tid, &key, value)?;
    f.push(LuaValue::table(tid))?;
    Ok(1)
}

fn lua_rawequal(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(2)?;
    let eq = f.arg(1).raw_equal(&f.arg(2));
    f.push(LuaValue::boolean(eq))?;
    Ok(1)
}

fn lua_setmetatable(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let tid = f.check_table(1)?;
    let meta = f.arg(2);
    let meta_id = if meta.is_nil() {
        None
    } else if let Some(m) = meta.as_table_id() {
        Some(m)
    } else {
        return Err(f.arg_error(2, "nil or table expected"));
    };
    let v = LuaValue::table(tid);
    f.state.set_metatable(&v, meta_id)?;
    f.push(v)?;
    Ok(1)
}

fn lua_getmetatable(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    f.check_arg_count(1)?;
    let v = f.arg(1);
    match f.state.metatable_of(&v) {
        Some(m) => f.push(LuaValue::table(m))?,
        None => f.push(LuaValue::nil())?,
    }
    Ok(1)
}

// ============ GC control ============

fn lua_collectgarbage(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let opt = if f.arg(1).is_nil() {
        b"collect".to_vec()
    } else {
        f.check_string(1)?
    };
    let arg = f.arg(2).as_number();
    match opt.as_slice() {
        b"collect" => {
            f.state.gc_collect()?;
            f.push(LuaValue::number(0.0))?;
        }
        b"stop" => {
            f.state.gc_stop();
            f.push(LuaValue::number(0.0))?;
        }
        b"restart" => {
            f.state.gc_restart();
            f.push(LuaValue::number(0.0))?;
        }
        b"step" => {
            f.state.gc_step_burst()?;
            f.push(LuaValue::boolean(false))?;
        }
        b"count" => {
            let kb = f.state.gc_count_bytes() as f64 / 1024.0;
            f.push(LuaValue::number(kb))?;
        }
        b"setpause" => {
            let prev = f.state.gc_set_pause(arg.unwrap_or(200.0) as i32);
            f.push(LuaValue::number(prev as f64))?;
        }
        b"setstepmul" => {
            let prev = f.state.gc_set_step_mul(arg.unwrap_or(200.0) as i32);
            f.push(LuaValue::number(prev as f64))?;
        }
        _ => return Err(f.arg_error(1, "invalid option")),
    }
    Ok(1)
}

// ============ coroutine library ============

fn co_create(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let entry = f.check_type(1, "function")?;
    let id = f.state.new_coroutine(entry)?;
    f.push(LuaValue::thread(id))?;
    Ok(1)
}

fn co_resume(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let v = f.arg(1);
    let Some(co) = v.as_thread_id() else {
        return Err(f.arg_error(1, "coroutine expected"));
    };
    let args: Vec<LuaValue> = (2..=f.arg_count()).map(|i| f.arg(i)).collect();
    let state = &mut *f.state;
    match resume(state, co, args) {
        Ok(ResumeOutcome::Returned(values)) | Ok(ResumeOutcome::Yielded(values)) => {
            let n = values.len();
            state.push(LuaValue::boolean(true))?;
            for v in values {
                state.push(v)?;
            }
            Ok(n + 1)
        }
        Ok(ResumeOutcome::Failed(_, payload)) => {
            state.push(LuaValue::boolean(false))?;
            state.push(payload)?;
            Ok(2)
        }
        Err(e) if e == crate::lua_vm::LuaError::RuntimeError => {
            // resuming a non-suspended coroutine reports, not raises
            let err = state.take_error_value();
            state.push(LuaValue::boolean(false))?;
            state.push(err)?;
            Ok(2)
        }
        Err(e) => Err(e),
    }
}

fn co_yield(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let values: Vec<LuaValue> = (1..=f.arg_count()).map(|i| f.arg(i)).collect();
    Err(yield_values(f.state, values))
}

fn co_status(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let v = f.arg(1);
    let Some(co) = v.as_thread_id() else {
        return Err(f.arg_error(1, "coroutine expected"));
    };
    let s = status(f.state, co);
    let name = f.state.new_string(s.as_str().as_bytes())?;
    f.push(name)?;
    Ok(1)
}

fn co_running(f: &mut HostFrame<'_>) -> LuaResult<usize> {
    let state = &mut *f.state;
    if state.current_thread() == state.main_thread() {
        state.push(LuaValue::nil())?;
    } else {
        let cur = state.current_thread();
        state.push(LuaValue::thread(cur))?;
    }
    Ok(1)
}

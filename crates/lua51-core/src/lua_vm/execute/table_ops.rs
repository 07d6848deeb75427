// Indexing with metamethod chains. Both chains are bounded by the same
// depth limit as `__call` resolution, so a metatable cycle surfaces as an
// error instead of spinning.

use crate::lua_value::LuaValue;
use crate::lua_vm::const_string::TmKind;
use crate::lua_vm::execute::call::call_value;
use crate::lua_vm::lua_limits::MAX_TAG_LOOP;
use crate::lua_vm::{LuaResult, LuaState};

/// `t[k]` with the `__index` chain.
pub fn table_index(state: &mut LuaState, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
    let mut target = t;
    for _ in 0..MAX_TAG_LOOP {
        let tm = if let Some(tid) = target.as_table_id() {
            let v = state.table_raw_get(tid, &key);
            if !v.is_nil() {
                return Ok(v);
            }
            let tm = state.get_metamethod(&target, TmKind::Index);
            if tm.is_nil() {
                return Ok(LuaValue::nil());
            }
            tm
        } else {
            let tm = state.get_metamethod(&target, TmKind::Index);
            if tm.is_nil() {
                return Err(state.type_error("index", &target));
            }
            tm
        };
        if tm.is_function() {
            return call_index_handler(state, tm, target, key);
        }
        target = tm;
    }
    Err(state.rt_error("'__index' chain too long; possible loop".into()))
}

/// `t[k] = v` with the `__newindex` chain.
pub fn table_newindex(
    state: &mut LuaState,
    t: LuaValue,
    key: LuaValue,
    value: LuaValue,
) -> LuaResult<()> {
    let mut target = t;
    for _ in 0..MAX_TAG_LOOP {
        let tm = if let Some(tid) = target.as_table_id() {
            let existing = state.table_raw_get(tid, &key);
            if !existing.is_nil() {
                return state.table_raw_set(tid, &key, value);
            }
            let tm = state.get_metamethod(&target, TmKind::NewIndex);
            if tm.is_nil() {
                return state.table_raw_set(tid, &key, value);
            }
            tm
        } else {
            let tm = state.get_metamethod(&target, TmKind::NewIndex);
            if tm.is_nil() {
                return Err(state.type_error("index", &target));
            }
            tm
        };
        if tm.is_function() {
            let func_pos = state.top();
            state.reserve(4)?;
            state.push(tm)?;
            state.push(target)?;
            state.push(key)?;
            state.push(value)?;
            call_value(state, func_pos, 3, 0)?;
            state.set_top(func_pos);
            return Ok(());
        }
        target = tm;
    }
    Err(state.rt_error("'__newindex' chain too long; possible loop".into()))
}

fn call_index_handler(
    state: &mut LuaState,
    tm: LuaValue,
    target: LuaValue,
    key: LuaValue,
) -> LuaResult<LuaValue> {
    let func_pos = state.top();
    state.reserve(3)?;
    state.push(tm)?;
    state.push(target)?;
    state.push(key)?;
    call_value(state, func_pos, 2, 1)?;
    let result = state.stack_get(func_pos);
    state.set_top(func_pos);
    Ok(result)
}

/// The `#` operator: tables use the border rule, strings their byte
/// length, everything else the `__len` metamethod.
pub fn value_length(state: &mut LuaState, v: LuaValue) -> LuaResult<LuaValue> {
    if let Some(tid) = v.as_table_id() {
        return Ok(LuaValue::number(state.pool.table(tid).length() as f64));
    }
    if let Some(sid) = v.as_string_id() {
        return Ok(LuaValue::number(state.pool.string_bytes(sid).len() as f64));
    }
    let tm = state.get_metamethod(&v, TmKind::Len);
    if tm.is_nil() {
        return Err(state.type_error("get length of", &v));
    }
    crate::lua_vm::execute::call::call_metamethod_binary(state, tm, v, v)
}

// CONCAT: fold a register range, batching runs of strings and numbers
// into one interned result and falling back to `__concat` otherwise. The
// fold works right-to-left so metamethod nesting associates the way the
// reference VM does. Operands and intermediates are kept on the value
// stack throughout, where the collector can see them.

use crate::lua_value::LuaValue;
use crate::lua_vm::const_string::TmKind;
use crate::lua_vm::execute::call::call_metamethod_binary;
use crate::lua_vm::lua_state::number_to_string;
use crate::lua_vm::{LuaResult, LuaState};

#[inline]
fn concatable(v: &LuaValue) -> bool {
    v.is_string() || v.is_number()
}

fn append_bytes(state: &LuaState, v: &LuaValue, out: &mut Vec<u8>) {
    if let Some(id) = v.as_string_id() {
        out.extend_from_slice(state.pool.string_bytes(id));
    } else {
        out.extend_from_slice(number_to_string(v.nvalue()).as_bytes());
    }
}

/// Concatenate `values` and return the folded result.
pub fn concat_values(state: &mut LuaState, values: Vec<LuaValue>) -> LuaResult<LuaValue> {
    if values.is_empty() {
        return Ok(LuaValue::nil());
    }
    // park the operands on the stack so intermediates stay rooted
    let bottom = state.top();
    state.reserve(values.len())?;
    for v in &values {
        state.push(*v)?;
    }

    while state.top() - bottom > 1 {
        let top = state.top();
        let v1 = state.stack_get(top - 2);
        let v2 = state.stack_get(top - 1);
        if concatable(&v1) && concatable(&v2) {
            // batch the whole trailing run of strings/numbers
            let mut start = top - 2;
            while start > bottom && concatable(&state.stack_get(start - 1)) {
                start -= 1;
            }
            let mut bytes = Vec::new();
            for i in start..top {
                let v = state.stack_get(i);
                append_bytes(state, &v, &mut bytes);
            }
            let folded = state.new_string(&bytes)?;
            state.stack_set(start, folded)?;
            state.set_top(start + 1);
        } else {
            let tm = {
                let tm = state.get_metamethod(&v1, TmKind::Concat);
                if tm.is_nil() { state.get_metamethod(&v2, TmKind::Concat) } else { tm }
            };
            if tm.is_nil() {
                let culprit = if concatable(&v1) { v2 } else { v1 };
                state.set_top(bottom);
                return Err(state.type_error("concatenate", &culprit));
            }
            let folded = call_metamethod_binary(state, tm, v1, v2)?;
            state.stack_set(top - 2, folded)?;
            state.set_top(top - 1);
        }
    }

    let result = state.stack_get(bottom);
    state.set_top(bottom);
    Ok(result)
}

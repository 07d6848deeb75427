// Host function contract (the runtime side of the embedding API).
//
// A host function receives a view of its activation frame: the argument
// slots, typed checkers, and push/pop access to the value stack. It
// returns how many top-of-stack values are its results. Host functions
// may allocate and make nested calls; they may not yield.

use crate::gc::TableId;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaState};

pub type HostFunction = fn(&mut HostFrame<'_>) -> LuaResult<usize>;

pub struct HostFrame<'a> {
    pub(crate) state: &'a mut LuaState,
    /// Absolute stack index of the first argument.
    pub(crate) base: usize,
    /// Upvalues of the host closure being run (inline values).
    pub(crate) upvalues: Vec<LuaValue>,
}

impl<'a> HostFrame<'a> {
    #[inline]
    pub fn state(&mut self) -> &mut LuaState {
        self.state
    }

    /// Number of arguments passed to this call.
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.state.top().saturating_sub(self.base)
    }

    /// Argument by 1-based index; nil when absent.
    #[inline]
    pub fn arg(&self, i: usize) -> LuaValue {
        if i == 0 || i > self.arg_count() {
            LuaValue::nil()
        } else {
            self.state.stack_get(self.base + i - 1)
        }
    }

    #[inline]
    pub fn upvalue(&self, i: usize) -> LuaValue {
        self.upvalues.get(i).copied().unwrap_or(LuaValue::nil())
    }

    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.state.push(v)
    }

    pub fn pop(&mut self) -> LuaResult<LuaValue> {
        self.state.pop()
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.state.top()
    }

    // ============ Argument checking ============

    /// `ArityError` when fewer than `n` arguments were passed.
    pub fn check_arg_count(&mut self, n: usize) -> LuaResult<()> {
        if self.arg_count() < n {
            let msg = format!("bad argument #{} (value expected)", self.arg_count() + 1);
            self.state.error_message = msg.clone();
            self.state.error_value = self
                .state
                .new_string(msg.as_bytes())
                .unwrap_or(LuaValue::nil());
            return Err(LuaError::ArityError);
        }
        Ok(())
    }

    pub fn check_type(&mut self, i: usize, type_name: &str) -> LuaResult<LuaValue> {
        let v = self.arg(i);
        if v.type_name() != type_name {
            return Err(self.arg_error(i, &format!("{} expected, got {}", type_name, v.type_name())));
        }
        Ok(v)
    }

    pub fn check_number(&mut self, i: usize) -> LuaResult<f64> {
        let v = self.arg(i);
        match crate::lua_vm::execute::arith::tonumber_value(self.state, &v) {
            Some(n) => Ok(n),
            None => Err(self.arg_error(i, &format!("number expected, got {}", v.type_name()))),
        }
    }

    pub fn check_string(&mut self, i: usize) -> LuaResult<Vec<u8>> {
        let v = self.arg(i);
        if let Some(id) = v.as_string_id() {
            Ok(self.state.pool.string_bytes(id).to_vec())
        } else if v.is_number() {
            Ok(crate::lua_vm::lua_state::number_to_string(v.nvalue()).into_bytes())
        } else {
            Err(self.arg_error(i, &format!("string expected, got {}", v.type_name())))
        }
    }

    pub fn check_table(&mut self, i: usize) -> LuaResult<TableId> {
        let v = self.arg(i);
        v.as_table_id()
            .ok_or_else(|| self.arg_error(i, &format!("table expected, got {}", v.type_name())))
    }

    pub fn opt_number(&mut self, i: usize, default: f64) -> LuaResult<f64> {
        if self.arg(i).is_nil() {
            Ok(default)
        } else {
            self.check_number(i)
        }
    }

    /// Raise an `ArityError` describing a bad argument.
    pub fn arg_error(&mut self, i: usize, extra: &str) -> LuaError {
        let msg = format!("bad argument #{} ({})", i, extra);
        self.state.error_value = self
            .state
            .new_string(msg.as_bytes())
            .unwrap_or(LuaValue::nil());
        self.state.error_message = msg;
        self.state.capture_traceback();
        LuaError::ArityError
    }

    /// Raise a runtime error from host code.
    pub fn error(&mut self, msg: String) -> LuaError {
        self.state.rt_error(msg)
    }
}

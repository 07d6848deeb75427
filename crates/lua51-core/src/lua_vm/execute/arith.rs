// Arithmetic, coercion and comparison. Lua 5.1 numbers are plain IEEE
// doubles; numeric strings coerce in arithmetic context, and everything
// else falls through to the matching metamethod.

use crate::lua_value::LuaValue;
use crate::lua_vm::const_string::TmKind;
use crate::lua_vm::execute::call::call_metamethod_binary;
use crate::lua_vm::{LuaResult, LuaState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    pub fn event(self) -> TmKind {
        match self {
            ArithOp::Add => TmKind::Add,
            ArithOp::Sub => TmKind::Sub,
            ArithOp::Mul => TmKind::Mul,
            ArithOp::Div => TmKind::Div,
            ArithOp::Mod => TmKind::Mod,
            ArithOp::Pow => TmKind::Pow,
            ArithOp::Unm => TmKind::Unm,
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            // a - floor(a/b)*b, so the result takes the sign of b
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Unm => -a,
        }
    }
}

/// Parse a numeric string the way the 5.1 lexer-free path does: optional
/// whitespace, optional sign, decimal or 0x-prefixed hex.
pub fn parse_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    let (sign, body) = match s.as_bytes()[0] {
        b'-' => (-1.0, &s[1..]),
        b'+' => (1.0, &s[1..]),
        _ => (1.0, s),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let v = u64::from_str_radix(hex, 16).ok()?;
        return Some(sign * v as f64);
    }
    // reject forms Lua's strtod would reject (inf/nan spellings)
    if body.chars().any(|c| c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E')) {
        return None;
    }
    body.parse::<f64>().ok().map(|v| sign * v)
}

/// Arithmetic coercion: numbers pass through, numeric strings convert.
pub fn tonumber_value(state: &LuaState, v: &LuaValue) -> Option<f64> {
    if let Some(n) = v.as_number() {
        return Some(n);
    }
    if let Some(id) = v.as_string_id() {
        return parse_number(state.pool.string_bytes(id));
    }
    None
}

/// Binary arithmetic with metamethod fallback.
pub fn arith(state: &mut LuaState, op: ArithOp, b: LuaValue, c: LuaValue) -> LuaResult<LuaValue> {
    if let (Some(x), Some(y)) = (tonumber_value(state, &b), tonumber_value(state, &c)) {
        return Ok(LuaValue::number(op.apply(x, y)));
    }
    let event = op.event();
    let tm = {
        let tm = state.get_metamethod(&b, event);
        if tm.is_nil() { state.get_metamethod(&c, event) } else { tm }
    };
    if tm.is_nil() {
        // report the operand that is not a number
        let culprit = if tonumber_value(state, &b).is_none() { b } else { c };
        return Err(state.type_error("perform arithmetic on", &culprit));
    }
    call_metamethod_binary(state, tm, b, c)
}

/// Unary minus.
pub fn arith_unm(state: &mut LuaState, b: LuaValue) -> LuaResult<LuaValue> {
    if let Some(x) = tonumber_value(state, &b) {
        return Ok(LuaValue::number(-x));
    }
    let tm = state.get_metamethod(&b, TmKind::Unm);
    if tm.is_nil() {
        return Err(state.type_error("perform arithmetic on", &b));
    }
    // the reference passes the operand twice for unary events
    call_metamethod_binary(state, tm, b, b)
}

/// `<` with the 5.1 rules: number/number, string/string (byte order), or
/// the `__lt` metamethod.
pub fn less_than(state: &mut LuaState, l: LuaValue, r: LuaValue) -> LuaResult<bool> {
    if l.is_number() && r.is_number() {
        return Ok(l.nvalue() < r.nvalue());
    }
    if l.is_string() && r.is_string() {
        let a = state.pool.string_bytes(l.tsvalue());
        let b = state.pool.string_bytes(r.tsvalue());
        return Ok(a < b);
    }
    let tm = {
        let tm = state.get_metamethod(&l, TmKind::Lt);
        if tm.is_nil() { state.get_metamethod(&r, TmKind::Lt) } else { tm }
    };
    if tm.is_nil() {
        return Err(compare_error(state, &l, &r));
    }
    let res = call_metamethod_binary(state, tm, l, r)?;
    Ok(res.is_truthy())
}

/// `<=`: like `<`, with the 5.1 fallback `a <= b  <=>  not (b < a)` when
/// only `__lt` exists.
pub fn less_equal(state: &mut LuaState, l: LuaValue, r: LuaValue) -> LuaResult<bool> {
    if l.is_number() && r.is_number() {
        return Ok(l.nvalue() <= r.nvalue());
    }
    if l.is_string() && r.is_string() {
        let a = state.pool.string_bytes(l.tsvalue());
        let b = state.pool.string_bytes(r.tsvalue());
        return Ok(a <= b);
    }
    let le = {
        let tm = state.get_metamethod(&l, TmKind::Le);
        if tm.is_nil() { state.get_metamethod(&r, TmKind::Le) } else { tm }
    };
    if !le.is_nil() {
        let res = call_metamethod_binary(state, le, l, r)?;
        return Ok(res.is_truthy());
    }
    let lt = {
        let tm = state.get_metamethod(&l, TmKind::Lt);
        if tm.is_nil() { state.get_metamethod(&r, TmKind::Lt) } else { tm }
    };
    if !lt.is_nil() {
        let res = call_metamethod_binary(state, lt, r, l)?;
        return Ok(res.is_falsy());
    }
    Err(compare_error(state, &l, &r))
}

fn compare_error(state: &mut LuaState, l: &LuaValue, r: &LuaValue) -> crate::lua_vm::LuaError {
    let msg = if l.ttype() == r.ttype() {
        format!("attempt to compare two {} values", l.type_name())
    } else {
        format!("attempt to compare {} with {}", l.type_name(), r.type_name())
    };
    let payload = state.new_string(msg.as_bytes()).unwrap_or(LuaValue::nil());
    state.error_value = payload;
    state.error_message = msg;
    state.capture_traceback();
    crate::lua_vm::LuaError::TypeError
}

/// `==` with metamethods: raw equality first; `__eq` fires only for two
/// tables or two userdata that share the same handler.
pub fn equals(state: &mut LuaState, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.rawtt() != b.rawtt() {
        return Ok(false);
    }
    if a.raw_equal(&b) {
        return Ok(true);
    }
    if !(a.is_table() && b.is_table()) && !(a.is_userdata() && b.is_userdata()) {
        return Ok(false);
    }
    let tm1 = state.get_metamethod(&a, TmKind::Eq);
    if tm1.is_nil() {
        return Ok(false);
    }
    let tm2 = state.get_metamethod(&b, TmKind::Eq);
    if !tm1.raw_equal(&tm2) {
        return Ok(false);
    }
    let res = call_metamethod_binary(state, tm1, a, b)?;
    Ok(res.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(b"42"), Some(42.0));
        assert_eq!(parse_number(b"  -3.5  "), Some(-3.5));
        assert_eq!(parse_number(b"0x10"), Some(16.0));
        assert_eq!(parse_number(b"0XFF"), Some(255.0));
        assert_eq!(parse_number(b"1e3"), Some(1000.0));
        assert_eq!(parse_number(b"+2"), Some(2.0));
        assert_eq!(parse_number(b""), None);
        assert_eq!(parse_number(b"abc"), None);
        assert_eq!(parse_number(b"12abc"), None);
        assert_eq!(parse_number(b"inf"), None);
    }

    #[test]
    fn test_mod_follows_divisor_sign() {
        assert_eq!(ArithOp::Mod.apply(5.0, 3.0), 2.0);
        assert_eq!(ArithOp::Mod.apply(-5.0, 3.0), 1.0);
        assert_eq!(ArithOp::Mod.apply(5.0, -3.0), -1.0);
    }
}

// Call protocol: result adjustment, MULTRET chains, frame-depth limits,
// protected calls and the message handler.

use crate::lua_value::LuaValue;
use crate::lua_vm::OpCode::*;
use crate::lua_vm::{LuaError, SafeOption};
use crate::test::support::*;

#[test]
fn test_multiple_returns_fixed_adjustment() {
    let mut state = new_state();

    // function three() return 1, 2, 3 end
    let mut three = Asm::new(0, 4);
    let k1 = three.kn(1.0);
    let k2 = three.kn(2.0);
    let k3 = three.kn(3.0);
    three
        .abx(LoadK, 0, k1)
        .abx(LoadK, 1, k2)
        .abx(LoadK, 2, k3)
        .abc(Return, 0, 4, 0);
    let three = three.done();

    // a, b = three(); return a, b  (truncates to two)
    let mut main = Asm::new(0, 4);
    let p = main.proto(three.clone());
    main.abx(Closure, 0, p)
        .abc(Call, 0, 1, 3) // two results
        .abc(Return, 0, 3, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r.len(), 2);
    assert_eq!(expect_number(&r[0]), 1.0);
    assert_eq!(expect_number(&r[1]), 2.0);

    // a, b, c, d = three(); d must be nil-padded
    let mut main = Asm::new(0, 6);
    let p = main.proto(three);
    main.abx(Closure, 0, p)
        .abc(Call, 0, 1, 5) // four results
        .abc(Return, 0, 5, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r.len(), 4);
    assert!(r[3].is_nil());
}

#[test]
fn test_multret_feeds_call() {
    let mut state = new_state();

    // function pair() return 10, 20 end
    let mut pair = Asm::new(0, 3);
    let k10 = pair.kn(10.0);
    let k20 = pair.kn(20.0);
    pair.abx(LoadK, 0, k10)
        .abx(LoadK, 1, k20)
        .abc(Return, 0, 3, 0);
    let pair = pair.done();

    // function add(a, b) return a + b end
    let mut add = Asm::new(2, 3);
    add.abc(Add, 2, 0, 1).abc(Return, 2, 2, 0);
    let add = add.done();

    // return add(pair())  -- pair's results flow straight into the call
    let mut main = Asm::new(0, 5);
    let p_pair = main.proto(pair);
    let p_add = main.proto(add);
    main.abx(Closure, 0, p_add)
        .abx(Closure, 1, p_pair)
        .abc(Call, 1, 1, 0) // R1... = pair()  MULTRET, results at R1, R2
        .abc(Call, 0, 0, 2) // add with args through the top
        .abc(Return, 0, 2, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(expect_number(&r[0]), 30.0);
}

#[test]
fn test_call_depth_limit_is_stack_overflow() {
    let mut config = SafeOption::default();
    config.max_call_depth = 50;
    let mut state = crate::lua_vm::LuaState::with_config(config);
    crate::builtins::open_libs(&mut state).unwrap();

    // function f(n) return 1 + f(n) end  -- non-tail, unbounded frames
    let mut f = Asm::new(1, 5);
    let kf = f.ks(&mut state, b"f");
    let k1 = f.kn(1.0);
    f.abx(GetGlobal, 1, kf)
        .abc(Move, 2, 0, 0)
        .abc(Call, 1, 2, 2)
        .abc(Add, 1, 1, Asm::rk(k1))
        .abc(Return, 1, 2, 0);
    let f = f.done();

    let mut main = Asm::new(0, 3);
    let kf = main.ks(&mut state, b"f");
    let k0 = main.kn(0.0);
    let p = main.proto(f);
    main.abx(Closure, 0, p)
        .abx(SetGlobal, 0, kf)
        .abx(GetGlobal, 0, kf)
        .abx(LoadK, 1, k0)
        .abc(Call, 0, 2, 2)
        .abc(Return, 0, 2, 0);

    let err = run(&mut state, main.done(), &[]).unwrap_err();
    assert_eq!(err, LuaError::StackOverflow);
}

#[test]
fn test_pcall_returns_true_and_results() {
    let mut state = new_state();

    let mut inner = Asm::new(0, 3);
    let k7 = inner.kn(7.0);
    let k8 = inner.kn(8.0);
    inner
        .abx(LoadK, 0, k7)
        .abx(LoadK, 1, k8)
        .abc(Return, 0, 3, 0);
    let inner = inner.done();

    let mut main = Asm::new(0, 5);
    let kpcall = main.ks(&mut state, b"pcall");
    let p = main.proto(inner);
    main.abx(GetGlobal, 0, kpcall)
        .abx(Closure, 1, p)
        .abc(Call, 0, 2, 0) // all results
        .abc(Return, 0, 0, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r.len(), 3);
    assert_eq!(r[0].as_boolean(), Some(true));
    assert_eq!(expect_number(&r[1]), 7.0);
    assert_eq!(expect_number(&r[2]), 8.0);
}

#[test]
fn test_pcall_catches_stack_overflow() {
    let mut config = SafeOption::default();
    config.max_call_depth = 40;
    let mut state = crate::lua_vm::LuaState::with_config(config);
    crate::builtins::open_libs(&mut state).unwrap();

    // deep recursion behind pcall: pcall(f) where f recurses forever
    let mut f = Asm::new(0, 4);
    let kf = f.ks(&mut state, b"deep");
    f.abx(GetGlobal, 0, kf)
        .abc(Call, 0, 1, 1)
        .abc(Return, 0, 1, 0);
    let f = f.done();

    let mut main = Asm::new(0, 4);
    let kdeep = main.ks(&mut state, b"deep");
    let kpcall = main.ks(&mut state, b"pcall");
    let p = main.proto(f);
    main.abx(Closure, 0, p)
        .abx(SetGlobal, 0, kdeep)
        .abx(GetGlobal, 0, kpcall)
        .abx(GetGlobal, 1, kdeep)
        .abc(Call, 0, 2, 3)
        .abc(Return, 0, 3, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r[0].as_boolean(), Some(false));
}

#[test]
fn test_xpcall_runs_message_handler() {
    let mut state = new_state();

    // handler(err) returns "handled: " .. err
    fn handler(f: &mut crate::lua_vm::HostFrame<'_>) -> crate::lua_vm::LuaResult<usize> {
        let err = f.check_string(1)?;
        let mut out = b"handled: ".to_vec();
        out.extend_from_slice(&err);
        let s = f.state().new_string(&out)?;
        f.push(s)?;
        Ok(1)
    }

    let handler_v = state.new_host_closure(handler, Vec::new()).unwrap();
    state.set_global(b"handler", handler_v).unwrap();

    let mut thrower = Asm::new(0, 3);
    let kerror = thrower.ks(&mut state, b"error");
    let kbad = thrower.ks(&mut state, b"bad");
    let k0 = thrower.kn(0.0);
    thrower
        .abx(GetGlobal, 0, kerror)
        .abx(LoadK, 1, kbad)
        .abx(LoadK, 2, k0) // level 0: no position prefix
        .abc(Call, 0, 3, 1)
        .abc(Return, 0, 1, 0);
    let thrower = thrower.done();

    let mut main = Asm::new(0, 5);
    let kxpcall = main.ks(&mut state, b"xpcall");
    let khandler = main.ks(&mut state, b"handler");
    let p = main.proto(thrower);
    main.abx(GetGlobal, 0, kxpcall)
        .abx(Closure, 1, p)
        .abx(GetGlobal, 2, khandler)
        .abc(Call, 0, 3, 3)
        .abc(Return, 0, 3, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r[0].as_boolean(), Some(false));
    assert_eq!(expect_string(&state, &r[1]), b"handled: bad");
}

#[test]
fn test_error_with_non_string_payload() {
    let mut state = new_state();

    // error({code = 42}) caught by pcall preserves the table payload
    fn raise_table(f: &mut crate::lua_vm::HostFrame<'_>) -> crate::lua_vm::LuaResult<usize> {
        let t = f.state().new_table(0, 1)?;
        let key = f.state().new_string(b"code")?;
        f.state().table_raw_set(t, &key, num(42.0))?;
        Err(f.state().raise_value(LuaValue::table(t)))
    }

    let raiser = state.new_host_closure(raise_table, Vec::new()).unwrap();
    state.set_global(b"raiser", raiser).unwrap();

    let mut main = Asm::new(0, 4);
    let kpcall = main.ks(&mut state, b"pcall");
    let kraiser = main.ks(&mut state, b"raiser");
    main.abx(GetGlobal, 0, kpcall)
        .abx(GetGlobal, 1, kraiser)
        .abc(Call, 0, 2, 3)
        .abc(Return, 0, 3, 0);
    let r = run(&mut state, main.done(), &[]).unwrap();
    assert_eq!(r[0].as_boolean(), Some(false));
    let t = r[1].as_table_id().expect("table payload");
    let key = state.new_string(b"code").unwrap();
    assert_eq!(state.table_raw_get(t, &key).as_number(), Some(42.0));
}

#[test]
fn test_traceback_captured_on_error() {
    let mut state = new_state();

    let mut thrower = Asm::new(0, 2);
    let kerror = thrower.ks(&mut state, b"error");
    let kx = thrower.ks(&mut state, b"x");
    thrower
        .abx(GetGlobal, 0, kerror)
        .abx(LoadK, 1, kx)
        .abc(Call, 0, 2, 1)
        .abc(Return, 0, 1, 0);
    let err = run(&mut state, thrower.done(), &[]).unwrap_err();
    assert_eq!(err, LuaError::RuntimeError);
    assert!(
        !state.last_traceback().is_empty(),
        "an unwound error should leave a traceback"
    );
}

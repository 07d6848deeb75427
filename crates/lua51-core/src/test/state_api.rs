// Embedder surface: stack manipulation with API index conventions, chunk
// loading, hooks, and the diagnostics accessors.

use crate::lua_value::LuaValue;
use crate::lua_vm::debug_hooks::HookEventKind;
use crate::lua_vm::OpCode::*;
use crate::test::support::*;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_push_pop_settop() {
    let mut state = new_state();
    state.push(num(1.0)).unwrap();
    state.push(num(2.0)).unwrap();
    state.push(num(3.0)).unwrap();
    assert_eq!(state.top(), 3);

    assert_eq!(expect_number(&state.pop().unwrap()), 3.0);
    state.api_settop(0, 1).unwrap();
    assert_eq!(state.top(), 1);
    // raising the top reads nil
    state.api_settop(0, 3).unwrap();
    assert!(state.stack_get(2).is_nil());

    // settop with a negative index counts from the top
    state.api_settop(0, -2).unwrap();
    assert_eq!(state.top(), 2);
}

#[test]
fn test_pop_underflows_at_frame_floor() {
    let mut state = new_state();
    assert_eq!(state.pop(), Err(crate::lua_vm::LuaError::StackUnderflow));
}

#[test]
fn test_insert_remove_replace() {
    let mut state = new_state();
    for i in 1..=4 {
        state.push(num(i as f64)).unwrap();
    }
    // insert the top (4) at position 2: 1 4 2 3
    state.api_insert(0, 2).unwrap();
    let values: Vec<f64> = (0..4).map(|i| expect_number(&state.stack_get(i))).collect();
    assert_eq!(values, vec![1.0, 4.0, 2.0, 3.0]);

    // remove position 1: 4 2 3
    state.api_remove(0, 1).unwrap();
    let values: Vec<f64> = (0..3).map(|i| expect_number(&state.stack_get(i))).collect();
    assert_eq!(values, vec![4.0, 2.0, 3.0]);

    // replace position 1 with the top: 3 2
    state.api_replace(0, 1).unwrap();
    let values: Vec<f64> = (0..2).map(|i| expect_number(&state.stack_get(i))).collect();
    assert_eq!(values, vec![3.0, 2.0]);
    assert_eq!(state.top(), 2);
}

#[test]
fn test_abs_index_negative() {
    let mut state = new_state();
    state.push(num(10.0)).unwrap();
    state.push(num(20.0)).unwrap();
    assert_eq!(state.abs_index(0, -1).unwrap(), 1);
    assert_eq!(state.abs_index(0, -2).unwrap(), 0);
    assert_eq!(state.abs_index(0, 1).unwrap(), 0);
    assert!(state.abs_index(0, -3).is_err());
}

#[test]
fn test_load_chunk_and_call() {
    // dump a prototype, load it through the §6.1 loader, run it
    let mut state = new_state();
    let mut asm = Asm::new(0, 3);
    let k6 = asm.kn(6.0);
    let k7 = asm.kn(7.0);
    asm.abx(LoadK, 0, k6)
        .abx(LoadK, 1, k7)
        .abc(Mul, 0, 0, 1)
        .abc(Return, 0, 2, 0);
    let chunk = asm.done();
    let bytes = crate::lua_value::chunk_serializer::dump(&chunk, state.pool(), false);

    state.load_chunk(&bytes).unwrap();
    state.call(0, 1).unwrap();
    assert_eq!(expect_number(&state.pop().unwrap()), 42.0);
}

#[test]
fn test_load_chunk_rejects_garbage() {
    let mut state = new_state();
    assert_eq!(
        state.load_chunk(b"not a chunk"),
        Err(crate::lua_vm::LuaError::SyntaxError)
    );
}

#[test]
fn test_line_and_call_hooks_fire() {
    let mut state = new_state();
    let events: Rc<RefCell<Vec<HookEventKind>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_local: Rc<RefCell<Option<f64>>> = Rc::new(RefCell::new(None));
    let sink = events.clone();
    let local_sink = seen_local.clone();
    state.set_hook(
        Box::new(move |e| {
            sink.borrow_mut().push(e.kind);
            for (name, v) in &e.locals {
                if name == "x" {
                    *local_sink.borrow_mut() = v.as_number();
                }
            }
        }),
        true,
        true,
        true,
    );

    let mut inner = Asm::new(0, 2);
    let k1 = inner.kn(1.0);
    inner.abx(LoadK, 0, k1).abc(Return, 0, 2, 0);
    let inner = inner.done();

    let mut main = Asm::new(0, 3);
    let k9 = main.kn(9.0);
    let p = main.proto(inner);
    main.abx(LoadK, 0, k9) // local x = 9
        .abx(Closure, 1, p)
        .abc(Call, 1, 1, 2)
        .abc(Return, 0, 1, 0);
    main.local(b"x", 1, 4);
    run(&mut state, main.done(), &[]).unwrap();
    state.clear_hook();

    let events = events.borrow();
    assert!(events.contains(&HookEventKind::Line), "line events expected");
    assert!(events.contains(&HookEventKind::Call), "call events expected");
    assert!(events.contains(&HookEventKind::Return), "return events expected");
    assert_eq!(*seen_local.borrow(), Some(9.0), "local view should expose x");
}

#[test]
fn test_call_metrics_accumulate() {
    let mut state = new_state();
    let mut asm = Asm::new(0, 2);
    asm.abc(Return, 0, 1, 0);
    run(&mut state, asm.done(), &[]).unwrap();
    let m = state.call_metrics();
    assert!(m.calls >= 1);
    assert!(m.max_depth >= 1);
}

#[test]
fn test_two_states_are_independent() {
    let mut a = new_state();
    let mut b = new_state();
    a.set_global(b"x", num(1.0)).unwrap();
    b.set_global(b"x", num(2.0)).unwrap();

    let ka = a.new_string_id(b"x").unwrap();
    let kb = b.new_string_id(b"x").unwrap();
    assert_eq!(a.get_global(ka).as_number(), Some(1.0));
    assert_eq!(b.get_global(kb).as_number(), Some(2.0));

    // interning is per state: handles from different states are unrelated
    drop(a);
    assert_eq!(b.get_global(kb).as_number(), Some(2.0));
}

#[test]
fn test_panic_handler_fires_on_unprotected_error() {
    let mut state = new_state();
    let fired: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let sink = fired.clone();
    state.set_panic_handler(Box::new(move |err| {
        *sink.borrow_mut() = Some(err.message().to_string());
    }));

    let mut asm = Asm::new(0, 3);
    let kerror = asm.ks(&mut state, b"error");
    let kdoom = asm.ks(&mut state, b"doom");
    asm.abx(GetGlobal, 0, kerror)
        .abx(LoadK, 1, kdoom)
        .abc(Call, 0, 2, 1)
        .abc(Return, 0, 1, 0);
    let err = run(&mut state, asm.done(), &[]).unwrap_err();
    assert_eq!(err, crate::lua_vm::LuaError::RuntimeError);
    let message = fired.borrow().clone().expect("panic handler must fire");
    assert!(message.contains("doom"));
}

#[test]
fn test_userdata_carries_metatable_and_environment() {
    let mut state = new_state();
    let ud = state.new_userdata(vec![1u8, 2, 3].into_boxed_slice()).unwrap();
    state.set_global(b"ud", ud).unwrap();

    let meta = state.new_table(0, 1).unwrap();
    state.set_metatable(&ud, Some(meta)).unwrap();
    assert_eq!(state.metatable_of(&ud), Some(meta));

    let id = ud.as_userdata_id().unwrap();
    assert_eq!(&*state.pool().userdata.get(id.0).unwrap().data.payload, &[1, 2, 3]);
    // fresh userdata gets the globals table as its environment
    assert_eq!(
        state.pool().userdata.get(id.0).unwrap().data.environment(),
        Some(state.globals())
    );

    // survives collection while rooted
    state.gc_collect().unwrap();
    assert!(state.pool().userdata.get(id.0).is_some());
}

#[test]
fn test_memory_budget_raises_out_of_memory() {
    let mut config = crate::lua_vm::SafeOption::default();
    config.max_memory = Some(256 * 1024);
    let mut state = crate::lua_vm::LuaState::with_config(config);
    crate::builtins::open_libs(&mut state).unwrap();

    let holder = state.new_table(0, 0).unwrap();
    state.set_global(b"holder", LuaValue::table(holder)).unwrap();

    let mut result = Ok(());
    for i in 1..=100_000usize {
        match state.new_table(8, 8) {
            Ok(t) => state.table_set_int(holder, i, LuaValue::table(t)),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    assert_eq!(result, Err(crate::lua_vm::LuaError::OutOfMemory));
}

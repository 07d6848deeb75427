// Collector behavior: reachability, interning under collection, write
// barriers across incremental steps, weak tables, and finalization.

use crate::gc::GcPhase;
use crate::lua_value::LuaValue;
use crate::test::support::*;

#[test]
fn test_unreachable_objects_are_collected() {
    let mut state = new_state();
    let live = state.new_table(0, 0).unwrap();
    state.set_global(b"live", LuaValue::table(live)).unwrap();

    let before = state.pool().tables.len();
    for _ in 0..500 {
        state.new_table(0, 0).unwrap(); // dropped immediately
    }
    state.gc_collect().unwrap();
    state.gc_collect().unwrap();

    let after = state.pool().tables.len();
    assert!(
        after <= before + 8,
        "garbage tables survived: {} -> {}",
        before,
        after
    );
    // rooted objects never go away
    assert!(state.pool().tables.get(live.0).is_some());
    assert!(state.gc_check_invariants());
    assert!(state.gc_stats().objects_collected >= 400);
}

#[test]
fn test_stack_values_are_roots() {
    let mut state = new_state();
    let t = state.new_table(0, 0).unwrap();
    state.push(LuaValue::table(t)).unwrap();
    state.gc_collect().unwrap();
    state.gc_collect().unwrap();
    assert!(state.pool().tables.get(t.0).is_some());
    assert_eq!(state.stack_get(0).as_table_id(), Some(t));
}

#[test]
fn test_string_interning_survives_collection() {
    let mut state = new_state();
    let a = state.new_string(b"persistent").unwrap();
    state.set_global(b"s", a).unwrap();
    state.gc_collect().unwrap();
    state.gc_collect().unwrap();
    // same bytes, same handle, after the sweeps
    let b = state.new_string(b"persistent").unwrap();
    assert!(a.raw_equal(&b));

    // an unrooted string dies and a later intern mints a fresh handle
    let dead = state.new_string(b"ephemeral-string-value").unwrap();
    let dead_id = dead.tsvalue();
    state.gc_collect().unwrap();
    state.gc_collect().unwrap();
    assert!(
        state.pool().strings.get(dead_id.0).is_none(),
        "unreachable string should be swept"
    );
}

#[test]
fn test_write_barrier_keeps_new_child_alive() {
    let mut state = new_state();
    let parent = state.new_table(0, 4).unwrap();
    state.set_global(b"parent", LuaValue::table(parent)).unwrap();

    // push the collector into the marking phase
    state.gc.debt = 1;
    while state.gc.phase == GcPhase::Pause {
        state.gc_step_burst().unwrap();
        state.gc.debt = 1;
    }

    // mutate after marking may have blackened the parent
    let child = state.new_table(0, 0).unwrap();
    let key = state.new_string(b"child").unwrap();
    state
        .table_raw_set(parent, &key, LuaValue::table(child))
        .unwrap();

    state.gc_collect().unwrap();
    assert!(
        state.pool().tables.get(child.0).is_some(),
        "barrier must keep the freshly stored child alive"
    );
    assert_eq!(
        state.table_raw_get(parent, &key).as_table_id(),
        Some(child)
    );
    assert!(state.gc_check_invariants());
}

#[test]
fn test_closed_upvalue_roots_its_value() {
    let mut state = new_state();
    state.push(LuaValue::nil()).unwrap();
    let t = state.new_table(0, 0).unwrap();
    state.stack_set(0, LuaValue::table(t)).unwrap();
    let uv = state.find_or_create_open_upvalue(0).unwrap();

    // a closure holds the upvalue; the table is only reachable through it
    let mut getter = Asm::new(0, 2).upvalues(1);
    getter.abc(crate::lua_vm::OpCode::GetUpval, 0, 0, 0).abc(
        crate::lua_vm::OpCode::Return,
        0,
        2,
        0,
    );
    let closure = state.new_lua_closure(getter.done(), vec![uv]).unwrap();
    state.set_global(b"getter", closure).unwrap();

    state.close_upvalues(0);
    state.set_top(0); // slot gone; only the closed upvalue refers to t

    state.gc_collect().unwrap();
    state.gc_collect().unwrap();
    assert!(
        state.pool().tables.get(t.0).is_some(),
        "value captured in a closed upvalue must survive"
    );
}

#[test]
fn test_ephemeron_keys_control_values() {
    let mut state = new_state();

    let holder = state.new_table(0, 8).unwrap();
    state.set_global(b"weakk", LuaValue::table(holder)).unwrap();
    let meta = state.new_table(0, 1).unwrap();
    let mode_key = state.new_string(b"__mode").unwrap();
    let mode_val = state.new_string(b"k").unwrap();
    state.table_raw_set(meta, &mode_key, mode_val).unwrap();
    state
        .set_metatable(&LuaValue::table(holder), Some(meta))
        .unwrap();

    // live key: rooted via a global
    let live_key = state.new_table(0, 0).unwrap();
    state.set_global(b"key", LuaValue::table(live_key)).unwrap();
    let live_val = state.new_table(0, 0).unwrap();
    state
        .table_raw_set(holder, &LuaValue::table(live_key), LuaValue::table(live_val))
        .unwrap();

    // dead key: nothing else references it
    let dead_key = state.new_table(0, 0).unwrap();
    let dead_val = state.new_table(0, 0).unwrap();
    state
        .table_raw_set(holder, &LuaValue::table(dead_key), LuaValue::table(dead_val))
        .unwrap();

    state.gc_collect().unwrap();

    assert_eq!(state.pool().table(holder).entry_count(), 1);
    assert!(
        state.pool().tables.get(live_val.0).is_some(),
        "value under a live key stays (reached through the ephemeron)"
    );
    assert!(
        state
            .table_raw_get(holder, &LuaValue::table(live_key))
            .as_table_id()
            == Some(live_val)
    );
}

#[test]
fn test_finalizer_runs_once_with_reprieve() {
    let mut state = new_state();

    fn finalizer(f: &mut crate::lua_vm::HostFrame<'_>) -> crate::lua_vm::LuaResult<usize> {
        // count invocations in a global
        let state = f.state();
        let key = state.new_string_id(b"fin_count")?;
        let n = state.get_global(key).as_number().unwrap_or(0.0);
        state.set_global(b"fin_count", num(n + 1.0))?;
        Ok(0)
    }

    let handler = state.new_host_closure(finalizer, Vec::new()).unwrap();
    let meta = state.new_table(0, 1).unwrap();
    let gc_key = state.new_string(b"__gc").unwrap();
    state.table_raw_set(meta, &gc_key, handler).unwrap();
    state.set_global(b"meta", LuaValue::table(meta)).unwrap();

    let doomed = state.new_table(0, 0).unwrap();
    state
        .set_metatable(&LuaValue::table(doomed), Some(meta))
        .unwrap();
    // no root for `doomed` beyond this binding, which we now drop

    state.gc_collect().unwrap();
    let key = state.new_string_id(b"fin_count").unwrap();
    assert_eq!(state.get_global(key).as_number(), Some(1.0), "finalizer ran once");
    // the reprieve: the object is still present right after finalization
    assert!(state.pool().tables.get(doomed.0).is_some());

    // next cycles: actually freed, and never finalized again
    state.gc_collect().unwrap();
    state.gc_collect().unwrap();
    assert!(state.pool().tables.get(doomed.0).is_none());
    assert_eq!(state.get_global(key).as_number(), Some(1.0));
}

#[test]
fn test_finalizer_errors_are_discarded() {
    let mut state = new_state();

    fn bad_finalizer(f: &mut crate::lua_vm::HostFrame<'_>) -> crate::lua_vm::LuaResult<usize> {
        Err(f.error("finalizer exploded".into()))
    }

    let handler = state.new_host_closure(bad_finalizer, Vec::new()).unwrap();
    let meta = state.new_table(0, 1).unwrap();
    let gc_key = state.new_string(b"__gc").unwrap();
    state.table_raw_set(meta, &gc_key, handler).unwrap();
    state.set_global(b"meta", LuaValue::table(meta)).unwrap();

    let doomed = state.new_table(0, 0).unwrap();
    state
        .set_metatable(&LuaValue::table(doomed), Some(meta))
        .unwrap();

    // collection completes despite the failing finalizer
    state.gc_collect().unwrap();
    assert_eq!(state.gc_stats().finalizer_errors, 1);
    assert!(state.gc_check_invariants());
}

#[test]
fn test_gc_control_operations() {
    let mut state = new_state();
    state.gc_stop();
    assert!(!state.gc.should_step());
    state.gc_restart();

    let old_pause = state.gc_set_pause(300);
    assert_eq!(old_pause, 200);
    let old_mul = state.gc_set_step_mul(400);
    assert_eq!(old_mul, 200);

    let bytes = state.gc_count_bytes();
    assert!(bytes > 0, "fixed strings and root tables occupy memory");
}

#[test]
fn test_incremental_steps_preserve_colors() {
    let mut state = new_state();
    let t = state.new_table(4, 4).unwrap();
    state.set_global(b"t", LuaValue::table(t)).unwrap();

    // walk a full cycle step by step, checking the color invariant at
    // every pause point
    state.gc.debt = 1;
    let mut steps = 0;
    loop {
        state.gc_step_burst().unwrap();
        assert!(state.gc_check_invariants(), "invariant broken mid-cycle");
        steps += 1;
        if state.gc.phase == GcPhase::Pause || steps > 10_000 {
            break;
        }
        state.gc.debt = 1;
    }
    assert!(steps > 1, "cycle should take multiple steps");
}

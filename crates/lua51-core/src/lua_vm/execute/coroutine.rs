// Resume and yield: whole-context switches. The resumed coroutine's
// stack, frames and open upvalues are swapped into the state; the host
// call stack only nests through `resume` itself, which is exactly why a
// yield cannot cross any other host boundary.

use crate::gc::ThreadId;
use crate::lua_value::{CoroutineStatus, LuaValue, PendingCall};
use crate::lua_vm::execute::call::{precall, Precall};
use crate::lua_vm::lua_limits::MULTRET;
use crate::lua_vm::{LuaError, LuaResult, LuaState};

/// Outcome of a resume, mirroring coroutine.resume's tuple.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The coroutine returned; it is now dead.
    Returned(Vec<LuaValue>),
    /// The coroutine yielded these values.
    Yielded(Vec<LuaValue>),
    /// The coroutine raised; it is now dead. The payload is the error
    /// value.
    Failed(LuaError, LuaValue),
}

pub fn resume(state: &mut LuaState, co: ThreadId, args: Vec<LuaValue>) -> LuaResult<ResumeOutcome> {
    {
        let thread = state.pool.thread(co);
        if !thread.data.can_resume() {
            let status = thread.data.status.as_str();
            return Err(state.rt_error(format!("cannot resume {} coroutine", status)));
        }
    }
    if state.nesting >= state.config.max_host_depth {
        return Err(state.rt_error("resume nesting too deep".into()));
    }

    let parent = state.current_thread;
    let saved_boundary = state.resume_boundary;
    state.nesting += 1;

    // park the running context in its thread object and load the target's
    {
        let parent_obj = state.pool.thread_mut(parent);
        std::mem::swap(&mut parent_obj.data.context, &mut state.ctx);
        parent_obj.data.status = CoroutineStatus::Normal;
    }
    {
        let co_obj = state.pool.thread_mut(co);
        std::mem::swap(&mut co_obj.data.context, &mut state.ctx);
        co_obj.data.status = CoroutineStatus::Running;
        co_obj.data.resumer = Some(parent);
    }
    state.current_thread = co;
    state.resume_boundary = state.nesting;
    tracing::debug!(?co, "coroutine resumed");

    let run = run_resumed(state, co, args);

    // switch back, whatever happened
    let outcome = finish_resume(state, co, parent, run);
    state.resume_boundary = saved_boundary;
    state.nesting -= 1;
    outcome
}

fn run_resumed(
    state: &mut LuaState,
    co: ThreadId,
    args: Vec<LuaValue>,
) -> LuaResult<Vec<LuaValue>> {
    let started = state.pool.thread(co).data.started;
    if !started {
        // first resume: the entry closure runs with the arguments
        let entry = state.pool.thread(co).data.entry;
        state.pool.thread_mut(co).data.started = true;
        state.set_top(0);
        state.push(entry)?;
        for v in args {
            state.push(v)?;
        }
        match precall(state, 0, MULTRET)? {
            Precall::Returned => {}
            Precall::PushedLua => super::execute(state, 0)?,
        }
    } else {
        // later resumes: arguments become the results of the CALL the
        // yield interrupted
        let pending = state.ctx.pending_call.take();
        match pending {
            Some(PendingCall { func_pos, nresults }) => {
                deliver_results(state, func_pos, nresults, &args);
                restore_frame_top(state, nresults);
            }
            None => {
                // yield happened at the entry boundary (host entry)
                for v in args {
                    state.push(v)?;
                }
            }
        }
        super::execute(state, 0)?;
    }
    // the bottom frame returned: its results sit at the stack base
    let n = state.top();
    Ok((0..n).map(|i| state.stack_get(i)).collect())
}

fn deliver_results(state: &mut LuaState, func_pos: usize, nresults: i32, args: &[LuaValue]) {
    if nresults == MULTRET {
        for (i, v) in args.iter().enumerate() {
            let _ = state.stack_set(func_pos + i, *v);
        }
        state.set_top(func_pos + args.len());
    } else {
        let wanted = nresults.max(0) as usize;
        for i in 0..wanted {
            let v = args.get(i).copied().unwrap_or(LuaValue::nil());
            let _ = state.stack_set(func_pos + i, v);
        }
        state.set_top(func_pos + wanted);
    }
}

/// After delivering fixed results, the interrupted frame's register
/// window must be whole again.
fn restore_frame_top(state: &mut LuaState, nresults: i32) {
    if nresults != MULTRET {
        if let Some(frame) = state.ctx.frames.last() {
            let top = frame.top;
            if state.top() < top {
                state.set_top(top);
            }
        }
    }
}

fn finish_resume(
    state: &mut LuaState,
    co: ThreadId,
    parent: ThreadId,
    run: LuaResult<Vec<LuaValue>>,
) -> LuaResult<ResumeOutcome> {
    let outcome = match run {
        Ok(results) => {
            set_status(state, co, CoroutineStatus::Dead);
            ResumeOutcome::Returned(results)
        }
        Err(LuaError::Yield) => {
            set_status(state, co, CoroutineStatus::Suspended);
            let values = std::mem::take(&mut state.yield_values);
            ResumeOutcome::Yielded(values)
        }
        Err(e) => {
            set_status(state, co, CoroutineStatus::Dead);
            let payload = super::call::error_payload(state, e);
            ResumeOutcome::Failed(e, payload)
        }
    };

    // park the coroutine context, restore the parent's
    {
        let co_obj = state.pool.thread_mut(co);
        std::mem::swap(&mut co_obj.data.context, &mut state.ctx);
    }
    {
        let parent_obj = state.pool.thread_mut(parent);
        std::mem::swap(&mut parent_obj.data.context, &mut state.ctx);
        parent_obj.data.status = CoroutineStatus::Running;
    }
    state.current_thread = parent;
    tracing::debug!(?co, status = ?state.pool.thread(co).data.status, "coroutine suspended or finished");
    Ok(outcome)
}

fn set_status(state: &mut LuaState, co: ThreadId, status: CoroutineStatus) {
    state.pool.thread_mut(co).data.status = status;
}

/// Initiate a yield. Callable only while a coroutine is running with no
/// host boundary crossed since its resume; the values travel back to the
/// resumer through the state.
pub fn yield_values(state: &mut LuaState, values: Vec<LuaValue>) -> LuaError {
    if state.current_thread == state.main_thread() {
        return state.rt_error("attempt to yield from outside a coroutine".into());
    }
    if state.nesting != state.resume_boundary {
        let msg = "attempt to yield across a host-call boundary".to_string();
        let payload = state.new_string(msg.as_bytes()).unwrap_or(LuaValue::nil());
        state.error_message = msg;
        state.error_value = payload;
        return LuaError::CannotYieldAcrossHostBoundary;
    }
    state.yield_values = values;
    LuaError::Yield
}

/// coroutine.status, seen from the current coroutine's perspective.
pub fn status(state: &LuaState, co: ThreadId) -> CoroutineStatus {
    if co == state.current_thread {
        CoroutineStatus::Running
    } else {
        state.pool.thread(co).data.status
    }
}

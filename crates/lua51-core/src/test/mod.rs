mod support;

mod calls;
mod gc_behavior;
mod state_api;

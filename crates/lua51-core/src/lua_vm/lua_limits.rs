// Runtime limits, matching the Lua 5.1 reference constants where one exists.

/// Initial value-stack slots for a fresh coroutine (BASIC_STACK_SIZE).
pub const BASIC_STACK_SIZE: usize = 40;

/// Extra slots always kept above the frame top for metamethod staging
/// (EXTRA_STACK).
pub const EXTRA_STACK: usize = 5;

/// Default hard cap on value-stack slots per coroutine (LUAI_MAXSTACK-ish).
pub const DEFAULT_MAX_STACK: usize = 250_000;

/// Default hard cap on live frames per coroutine (LUAI_MAXCCALLS spirit).
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Bound on metamethod chains: `__index`, `__newindex`, and `__call` all
/// share this limit (MAXTAGLOOP in the reference is 100).
pub const MAX_TAG_LOOP: usize = 100;

/// SETLIST batch size (LFIELDS_PER_FLUSH).
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Results sentinel for "all results" (LUA_MULTRET).
pub const MULTRET: i32 = -1;

/// Strings at most this long participate in the quick intern probe with a
/// full byte compare; the interner stores everything either way.
pub const MAX_SHORT_LEN: usize = 40;

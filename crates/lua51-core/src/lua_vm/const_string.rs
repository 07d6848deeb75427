// Interned-once metamethod names and other fixed strings, resolved at
// state creation so the dispatch loop never re-interns.

use crate::gc::{ObjectPool, StringId};

/// Metamethod events, in cache order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
}

pub const TM_COUNT: usize = TmKind::Call as usize + 1;

const TM_NAMES: [&[u8]; TM_COUNT] = [
    b"__index",
    b"__newindex",
    b"__gc",
    b"__mode",
    b"__eq",
    b"__add",
    b"__sub",
    b"__mul",
    b"__div",
    b"__mod",
    b"__pow",
    b"__unm",
    b"__len",
    b"__lt",
    b"__le",
    b"__concat",
    b"__call",
];

pub struct ConstStrings {
    pub tm: [StringId; TM_COUNT],
    pub empty: StringId,
}

impl ConstStrings {
    /// Intern the fixed strings and pin them against collection.
    pub fn new(pool: &mut ObjectPool, current_white: u8) -> Self {
        let mut tm = [StringId::default(); TM_COUNT];
        for (i, name) in TM_NAMES.iter().enumerate() {
            let id = pool.create_string(name, current_white);
            pool.strings.get_mut(id.0).expect("fresh string").header.make_fixed();
            tm[i] = id;
        }
        let empty = pool.create_string(b"", current_white);
        pool.strings.get_mut(empty.0).expect("fresh string").header.make_fixed();
        Self { tm, empty }
    }

    #[inline(always)]
    pub fn name_of(&self, kind: TmKind) -> StringId {
        self.tm[kind as usize]
    }
}

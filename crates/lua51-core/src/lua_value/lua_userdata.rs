use crate::gc::TableId;

/// Full userdata: an opaque host payload with an optional metatable and an
/// environment table. The runtime never interprets the payload.
pub struct LuaUserdata {
    pub payload: Box<[u8]>,
    meta: Option<TableId>,
    env: Option<TableId>,
}

impl LuaUserdata {
    pub fn new(payload: Box<[u8]>, env: Option<TableId>) -> Self {
        Self { payload, meta: None, env }
    }

    #[inline]
    pub fn metatable(&self) -> Option<TableId> {
        self.meta
    }

    #[inline]
    pub fn set_metatable(&mut self, meta: Option<TableId>) {
        self.meta = meta;
    }

    #[inline]
    pub fn environment(&self) -> Option<TableId> {
        self.env
    }

    #[inline]
    pub fn set_environment(&mut self, env: Option<TableId>) {
        self.env = env;
    }
}

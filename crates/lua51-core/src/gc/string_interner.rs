use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::object_pool::{Arena, GcHeader, GcString};
use crate::gc::StringId;

/// String interner: every string in a state is deduplicated, so string
/// equality anywhere in the runtime is handle equality.
///
/// The map is weak: it does not keep strings alive. The collector calls
/// [`StringInterner::remove_dead`] while sweeping strings, and an intern
/// hit on a condemned-but-unswept string resurrects it by recoloring.
pub struct StringInterner {
    /// Content hash -> candidate handles (collision bucket).
    map: HashMap<u64, Vec<StringId>, RandomState>,
    hashbuilder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hashbuilder: RandomState::new(),
        }
    }

    pub fn intern(
        &mut self,
        bytes: &[u8],
        current_white: u8,
        strings: &mut Arena<GcString>,
    ) -> StringId {
        let hash = self.hash_bytes(bytes);

        let mut found = None;
        if let Some(ids) = self.map.get(&hash) {
            for &id in ids {
                if let Some(s) = strings.get(id.0) {
                    if &*s.bytes == bytes {
                        found = Some(id);
                        break;
                    }
                }
            }
        }
        if let Some(id) = found {
            // Resurrect a condemned string: recolor to the current white so
            // the sweep keeps it.
            let s = strings.get_mut(id.0).expect("bucket entry vanished");
            if s.header.is_white() {
                s.header.make_white(current_white);
            }
            return id;
        }

        let id = StringId(strings.alloc(GcString {
            header: GcHeader::new(current_white),
            bytes: bytes.into(),
            hash,
        }));
        self.map.entry(hash).or_default().push(id);
        id
    }

    #[inline(always)]
    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut hasher = self.hashbuilder.build_hasher();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Drop a swept string from its bucket. Called by the GC string sweep
    /// with the string's cached hash, before the arena slot is freed.
    pub fn remove_dead(&mut self, id: StringId, hash: u64) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

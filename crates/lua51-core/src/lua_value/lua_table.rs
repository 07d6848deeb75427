// Hybrid array + hash table.
//
// The array part holds integer keys 1..array.len(); everything else lives
// in an open-addressed node vector chained through "main positions": a key
// hashes to its main position, and colliders chain from there via the
// per-node `next` link. A collider that sits outside its own main position
// is displaced when the owner arrives (Brent's variation), so chains stay
// short. Removal leaves the key in place with a nil value so chains stay
// intact until the next rehash.

use crate::gc::TableId;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult};

const NO_NEXT: i32 = -1;

#[derive(Clone, Copy)]
struct Node {
    key: LuaValue,
    val: LuaValue,
    next: i32,
}

impl Node {
    const fn empty() -> Self {
        Node { key: LuaValue::nil(), val: LuaValue::nil(), next: NO_NEXT }
    }

    #[inline(always)]
    fn is_free(&self) -> bool {
        self.key.is_nil()
    }
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    node: Vec<Node>,
    /// Free-node scan position, counts down. Slots at or above this index
    /// have been handed out since the last rehash.
    lastfree: usize,
    meta: Option<TableId>,
}

/// Deterministic per-value hash. Strings hash by interned handle (same
/// bytes means same handle within a state), numbers by their bit pattern
/// with negative zero folded, reference types by handle.
#[inline]
fn hash_value(key: &LuaValue) -> u64 {
    let raw = if let Some(n) = key.as_number() {
        if n == 0.0 { 0 } else { n.to_bits() }
    } else if key.is_boolean() {
        1 + key.bvalue() as u64
    } else if key.is_lightuserdata() {
        key.pvalue() as u64
    } else {
        // collectable: handle plus tag so e.g. table 3 and function 3 differ
        match key.gc_id() {
            Some(id) => {
                let (tag, idx): (u64, u32) = match id {
                    crate::gc::GcId::String(s) => (1, s.0),
                    crate::gc::GcId::Table(t) => (2, t.0),
                    crate::gc::GcId::Function(f) => (3, f.0),
                    crate::gc::GcId::Upvalue(u) => (4, u.0),
                    crate::gc::GcId::Userdata(u) => (5, u.0),
                    crate::gc::GcId::Thread(t) => (6, t.0),
                };
                (tag << 32) | idx as u64
            }
            None => 0,
        }
    };
    // Fibonacci mixing; node sizes are powers of two.
    let h = raw.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^ (h >> 29)
}

/// Integer index of a key eligible for the array part, if any. Lua 5.1 has
/// only doubles; an array key is a number with an exact positive integer
/// value.
#[inline]
fn array_index(key: &LuaValue) -> Option<usize> {
    let n = key.as_number()?;
    if n.fract() == 0.0 && n >= 1.0 && n <= usize::MAX as f64 {
        Some(n as usize)
    } else {
        None
    }
}

impl LuaTable {
    pub fn new(asize: usize, hsize: usize) -> Self {
        let node_size = if hsize == 0 { 0 } else { hsize.next_power_of_two() };
        Self {
            array: vec![LuaValue::nil(); asize],
            node: vec![Node::empty(); node_size],
            lastfree: node_size,
            meta: None,
        }
    }

    // ============ Metatable ============

    #[inline(always)]
    pub fn metatable(&self) -> Option<TableId> {
        self.meta
    }

    #[inline(always)]
    pub fn set_metatable(&mut self, meta: Option<TableId>) {
        self.meta = meta;
    }

    // ============ Raw get ============

    /// Raw lookup; absent keys (and nil/NaN keys) answer nil. Never raises.
    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return self.array[i - 1];
            }
        }
        if key.is_nil() || self.node.is_empty() {
            return LuaValue::nil();
        }
        let mut pos = self.main_position(key);
        loop {
            let n = &self.node[pos];
            if !n.is_free() && n.key.raw_equal(key) {
                return n.val;
            }
            if n.next == NO_NEXT {
                return LuaValue::nil();
            }
            pos = n.next as usize;
        }
    }

    /// Fast path for positive integer keys (loops, SETLIST, length probe).
    pub fn get_int(&self, i: usize) -> LuaValue {
        if i >= 1 && i <= self.array.len() {
            self.array[i - 1]
        } else {
            self.raw_get(&LuaValue::number(i as f64))
        }
    }

    // ============ Raw set ============

    /// Raw store. Writing nil removes the key. Nil keys and NaN keys are
    /// rejected here (get never rejects them).
    pub fn raw_set(&mut self, key: &LuaValue, value: LuaValue) -> LuaResult<()> {
        if key.is_nil() {
            return Err(LuaError::TypeError); // table index is nil
        }
        if let Some(n) = key.as_number() {
            if n.is_nan() {
                return Err(LuaError::TypeError); // table index is NaN
            }
        }
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                self.array[i - 1] = value;
                return Ok(());
            }
        }
        self.hash_set(key, value);
        Ok(())
    }

    pub fn set_int(&mut self, i: usize, value: LuaValue) {
        if i >= 1 && i <= self.array.len() {
            self.array[i - 1] = value;
        } else {
            self.hash_set(&LuaValue::number(i as f64), value);
        }
    }

    fn hash_set(&mut self, key: &LuaValue, value: LuaValue) {
        // Overwrite in place when the key already exists (live or dead).
        if !self.node.is_empty() {
            let mut pos = self.main_position(key);
            loop {
                if !self.node[pos].is_free() && self.node[pos].key.raw_equal(key) {
                    self.node[pos].val = value;
                    return;
                }
                if self.node[pos].next == NO_NEXT {
                    break;
                }
                pos = self.node[pos].next as usize;
            }
        }
        if value.is_nil() {
            return; // removing an absent key is a no-op
        }
        self.new_key(key, value);
    }

    /// Insert a fresh key via the main-position rule; rehashes when no free
    /// node remains.
    fn new_key(&mut self, key: &LuaValue, value: LuaValue) {
        if self.node.is_empty() {
            self.rehash(key);
            self.hash_set(key, value);
            return;
        }
        let mp = self.main_position(key);
        if self.node[mp].is_free() {
            self.node[mp] = Node { key: *key, val: value, next: NO_NEXT };
            return;
        }
        let Some(free) = self.free_node() else {
            self.rehash(key);
            self.hash_set(key, value);
            return;
        };
        let other_mp = self.main_position(&self.node[mp].key);
        if other_mp != mp {
            // The occupant is a collider from another chain: move it to the
            // free slot and take its place.
            let mut prev = other_mp;
            while self.node[prev].next as usize != mp {
                prev = self.node[prev].next as usize;
            }
            self.node[prev].next = free as i32;
            self.node[free] = self.node[mp];
            self.node[mp] = Node { key: *key, val: value, next: NO_NEXT };
        } else {
            // The occupant owns this main position: the new key goes to the
            // free slot, chained right behind it.
            self.node[free] = Node { key: *key, val: value, next: self.node[mp].next };
            self.node[mp].next = free as i32;
        }
    }

    fn free_node(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].is_free() {
                return Some(self.lastfree);
            }
        }
        None
    }

    #[inline]
    fn main_position(&self, key: &LuaValue) -> usize {
        debug_assert!(!self.node.is_empty());
        (hash_value(key) as usize) & (self.node.len() - 1)
    }

    // ============ Rehash ============

    /// Recompute part sizes so the array holds the largest prefix 1..2^k
    /// with more than half of those slots populated; everything else goes
    /// to a power-of-two node part.
    fn rehash(&mut self, extra_key: &LuaValue) {
        // nums[i] = number of integer keys in (2^(i-1), 2^i]
        let mut nums = [0usize; 33];
        let mut total_int = 0usize;
        let mut total_other = 0usize;

        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                nums[ceil_log2(i + 1)] += 1;
                total_int += 1;
            }
        }
        let live_node_keys = self
            .node
            .iter()
            .filter(|n| !n.is_free() && !n.val.is_nil())
            .map(|n| n.key);
        for k in live_node_keys.chain(std::iter::once(*extra_key)) {
            match array_index(&k) {
                // keys past 2^31 never pay for array slots
                Some(i) if i < (1 << 31) => {
                    nums[ceil_log2(i)] += 1;
                    total_int += 1;
                }
                _ => total_other += 1,
            }
        }

        // Best array size: largest 2^k such that more than half of the
        // slots 1..2^k hold integer keys.
        let mut best_size = 0usize;
        let mut best_count = 0usize;
        let mut running = 0usize;
        let mut ints_left = total_int;
        for (k, &cnt) in nums.iter().enumerate() {
            if ints_left == 0 {
                break;
            }
            running += cnt;
            ints_left -= cnt;
            let size = 1usize << k;
            if k < 32 && running > size / 2 {
                best_size = size;
                best_count = running;
            }
        }

        let hash_count = total_int + total_other - best_count;
        self.resize(best_size, hash_count);
    }

    fn resize(&mut self, new_asize: usize, new_hsize: usize) {
        let old_array = std::mem::replace(&mut self.array, vec![LuaValue::nil(); new_asize]);
        let node_size = if new_hsize == 0 { 0 } else { new_hsize.next_power_of_two() };
        let old_node = std::mem::replace(&mut self.node, vec![Node::empty(); node_size]);
        self.lastfree = node_size;

        for (i, v) in old_array.into_iter().enumerate() {
            if v.is_nil() {
                continue;
            }
            if i < new_asize {
                self.array[i] = v;
            } else {
                self.hash_set(&LuaValue::number((i + 1) as f64), v);
            }
        }
        for n in old_node {
            if n.is_free() || n.val.is_nil() {
                continue; // dead entries drop here
            }
            if let Some(i) = array_index(&n.key) {
                if i <= new_asize {
                    self.array[i - 1] = n.val;
                    continue;
                }
            }
            self.hash_set(&n.key, n.val);
        }
    }

    // ============ Length ============

    /// A border: n such that t[n] is non-nil and t[n+1] is nil.
    pub fn length(&self) -> usize {
        let alen = self.array.len();
        if alen > 0 && self.array[alen - 1].is_nil() {
            // there is a border inside the array part: binary search
            let (mut lo, mut hi) = (0usize, alen);
            while hi - lo > 1 {
                let m = (lo + hi) / 2;
                if self.array[m - 1].is_nil() {
                    hi = m;
                } else {
                    lo = m;
                }
            }
            return lo;
        }
        if self.node.is_empty() {
            return alen;
        }
        // array part is full (or empty); the border may extend into the
        // hash part: exponential probe then binary search via get.
        let mut i = alen;
        let mut j = alen + 1;
        while !self.get_int(j).is_nil() {
            i = j;
            if j > usize::MAX / 2 {
                // pathological key distribution: linear scan
                let mut k = 1;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Iteration ============

    /// Deterministic successor for the `next` primitive: array part first,
    /// then nodes in slot order. A nil key starts the traversal. Returns
    /// Err on a key not present in the table.
    pub fn next(&self, key: &LuaValue) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let start = self.traversal_index(key)?;
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::number((i + 1) as f64), self.array[i])));
            }
        }
        let node_start = start.saturating_sub(self.array.len());
        for n in self.node.iter().skip(node_start) {
            if !n.is_free() && !n.val.is_nil() {
                return Ok(Some((n.key, n.val)));
            }
        }
        Ok(None)
    }

    /// 0-based traversal position one past the given key.
    fn traversal_index(&self, key: &LuaValue) -> LuaResult<usize> {
        if key.is_nil() {
            return Ok(0);
        }
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return Ok(i);
            }
        }
        if self.node.is_empty() {
            return Err(LuaError::TypeError); // invalid key to 'next'
        }
        let mut pos = self.main_position(key);
        loop {
            let n = &self.node[pos];
            if !n.is_free() && n.key.raw_equal(key) {
                return Ok(self.array.len() + pos + 1);
            }
            if n.next == NO_NEXT {
                return Err(LuaError::TypeError); // invalid key to 'next'
            }
            pos = n.next as usize;
        }
    }

    /// Live (key, value) pairs; used by GC traversal and weak clearing.
    pub fn iter_pairs(&self) -> impl Iterator<Item = (LuaValue, LuaValue)> + '_ {
        let array_iter = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (LuaValue::number((i + 1) as f64), *v));
        let node_iter = self
            .node
            .iter()
            .filter(|n| !n.is_free() && !n.val.is_nil())
            .map(|n| (n.key, n.val));
        array_iter.chain(node_iter)
    }

    /// Number of live entries (diagnostics and tests).
    pub fn entry_count(&self) -> usize {
        self.iter_pairs().count()
    }

    pub fn array_capacity(&self) -> usize {
        self.array.len()
    }

    pub fn node_capacity(&self) -> usize {
        self.node.len()
    }

    /// Drop entries whose weak components satisfy `is_dead`. Called during
    /// the atomic GC phase, after marking has converged.
    pub fn clear_weak_entries<F>(&mut self, weak_keys: bool, weak_values: bool, mut is_dead: F)
    where
        F: FnMut(&LuaValue) -> bool,
    {
        for i in 0..self.array.len() {
            let v = self.array[i];
            if !v.is_nil() && weak_values && v.is_collectable() && is_dead(&v) {
                self.array[i] = LuaValue::nil();
            }
        }
        for n in self.node.iter_mut() {
            if n.is_free() || n.val.is_nil() {
                continue;
            }
            let drop = (weak_keys && n.key.is_collectable() && is_dead(&n.key))
                || (weak_values && n.val.is_collectable() && is_dead(&n.val));
            if drop {
                n.val = LuaValue::nil(); // dead entry; key kept for chains
            }
        }
    }
}

#[inline]
fn ceil_log2(x: usize) -> usize {
    debug_assert!(x >= 1);
    (usize::BITS - (x - 1).leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> LuaValue {
        LuaValue::number(n)
    }

    #[test]
    fn test_array_part_basics() {
        let mut t = LuaTable::new(4, 0);
        t.set_int(1, num(10.0));
        t.set_int(2, num(20.0));
        assert_eq!(t.get_int(1).as_number(), Some(10.0));
        assert_eq!(t.get_int(2).as_number(), Some(20.0));
        assert!(t.get_int(3).is_nil());
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn test_hash_part_and_growth() {
        let mut t = LuaTable::new(0, 0);
        for i in 1..=100 {
            t.raw_set(&num(i as f64 + 0.5), num(i as f64)).unwrap();
        }
        for i in 1..=100 {
            assert_eq!(t.raw_get(&num(i as f64 + 0.5)).as_number(), Some(i as f64));
        }
        assert_eq!(t.entry_count(), 100);
    }

    #[test]
    fn test_integer_keys_migrate_to_array() {
        let mut t = LuaTable::new(0, 0);
        for i in 1..=64 {
            t.raw_set(&num(i as f64), num(i as f64)).unwrap();
        }
        // the rehash policy must have moved the dense prefix into the array
        assert!(t.array_capacity() >= 32);
        assert_eq!(t.length(), 64);
    }

    #[test]
    fn test_set_nil_removes() {
        let mut t = LuaTable::new(0, 4);
        t.raw_set(&num(99.5), num(1.0)).unwrap();
        assert_eq!(t.entry_count(), 1);
        t.raw_set(&num(99.5), LuaValue::nil()).unwrap();
        assert!(t.raw_get(&num(99.5)).is_nil());
        assert_eq!(t.entry_count(), 0);
    }

    #[test]
    fn test_nil_and_nan_keys() {
        let mut t = LuaTable::new(0, 0);
        assert_eq!(t.raw_set(&LuaValue::nil(), num(1.0)), Err(LuaError::TypeError));
        assert_eq!(t.raw_set(&num(f64::NAN), num(1.0)), Err(LuaError::TypeError));
        // the asymmetry: gets never raise
        assert!(t.raw_get(&LuaValue::nil()).is_nil());
        assert!(t.raw_get(&num(f64::NAN)).is_nil());
    }

    #[test]
    fn test_boolean_and_reference_keys() {
        let mut t = LuaTable::new(0, 0);
        t.raw_set(&LuaValue::boolean(true), num(1.0)).unwrap();
        t.raw_set(&LuaValue::boolean(false), num(2.0)).unwrap();
        assert_eq!(t.raw_get(&LuaValue::boolean(true)).as_number(), Some(1.0));
        assert_eq!(t.raw_get(&LuaValue::boolean(false)).as_number(), Some(2.0));
    }

    #[test]
    fn test_length_with_border_in_hash() {
        let mut t = LuaTable::new(2, 0);
        t.set_int(1, num(1.0));
        t.set_int(2, num(2.0));
        t.set_int(3, num(3.0)); // spills into the hash part
        let n = t.length();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_length_on_holes_is_a_border() {
        let mut t = LuaTable::new(8, 0);
        t.set_int(1, num(1.0));
        t.set_int(2, num(2.0));
        t.set_int(5, num(5.0));
        let n = t.length();
        // any border is conforming
        assert!(n == 2 || n == 5, "length {n} is not a border");
        assert!(!t.get_int(n).is_nil() || n == 0);
        assert!(t.get_int(n + 1).is_nil());
    }

    #[test]
    fn test_next_traverses_everything_once() {
        let mut t = LuaTable::new(2, 2);
        t.set_int(1, num(10.0));
        t.set_int(2, num(20.0));
        t.raw_set(&num(7.5), num(30.0)).unwrap();
        t.raw_set(&LuaValue::boolean(true), num(40.0)).unwrap();

        let mut seen = 0;
        let mut key = LuaValue::nil();
        while let Some((k, _v)) = t.next(&key).unwrap() {
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn test_next_rejects_unknown_key() {
        let mut t = LuaTable::new(0, 2);
        t.raw_set(&num(1.5), num(1.0)).unwrap();
        assert!(t.next(&num(2.5)).is_err());
    }

    #[test]
    fn test_no_nil_values_stored() {
        let mut t = LuaTable::new(4, 4);
        t.set_int(1, num(1.0));
        t.raw_set(&num(0.5), num(2.0)).unwrap();
        t.set_int(1, LuaValue::nil());
        t.raw_set(&num(0.5), LuaValue::nil()).unwrap();
        for (_k, v) in t.iter_pairs() {
            assert!(!v.is_nil());
        }
        assert_eq!(t.entry_count(), 0);
    }

    #[test]
    fn test_collision_chains_survive_displacement() {
        // Hammer one small node part so several keys share main positions.
        let mut t = LuaTable::new(0, 2);
        let keys: Vec<LuaValue> = (0..40).map(|i| num(i as f64 + 0.25)).collect();
        for (i, k) in keys.iter().enumerate() {
            t.raw_set(k, num(i as f64)).unwrap();
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(t.raw_get(k).as_number(), Some(i as f64), "lost key {i}");
        }
    }

    #[test]
    fn test_weak_clearing() {
        let mut t = LuaTable::new(0, 4);
        t.raw_set(&num(1.5), LuaValue::table(crate::gc::TableId(7))).unwrap();
        t.raw_set(&num(2.5), num(3.0)).unwrap();
        t.clear_weak_entries(false, true, |v| v.as_table_id() == Some(crate::gc::TableId(7)));
        assert!(t.raw_get(&num(1.5)).is_nil());
        assert_eq!(t.raw_get(&num(2.5)).as_number(), Some(3.0));
    }
}

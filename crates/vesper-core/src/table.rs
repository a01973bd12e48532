//! Hybrid array+hash tables.
//!
//! A table has an array part for integer keys 1..=n and a hash part of
//! chained nodes whose bucket count is a power of two. Keys are looked up
//! at their main position and chased along the chain; colliding inserts
//! evict nodes that are not in their own main chain. Free slots are found
//! by walking `lastfree` backward; when it crosses the start of the node
//! vector the table rehashes, choosing a new array size from a census of
//! integer keys.

use crate::gc::Arena;
use crate::mem::{AllocError, Memory};
use crate::object::{GcRef, ObjectKind};
use crate::string::TStr;
use crate::tm::{Tm, WeakMode, TM_FAST};
use crate::value::TValue;

bitflags::bitflags! {
    /// Cached table facts. Bits 0..6 record "metamethod known absent"
    /// for the fast tags; `ARRAY_HINT` records that `alimit` is a border
    /// hint rather than the array length.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TableFlags: u8 {
        const NO_INDEX    = 1 << 0;
        const NO_NEWINDEX = 1 << 1;
        const NO_GC       = 1 << 2;
        const NO_MODE     = 1 << 3;
        const NO_LEN      = 1 << 4;
        const NO_EQ       = 1 << 5;
        const ARRAY_HINT  = 1 << 6;
    }
}

/// Largest power-of-two exponent considered for the array part.
const MAX_ABITS: usize = 31;

/// A node in the hash part. `next` chains nodes whose keys share a main
/// position; -1 ends a chain. A dead node keeps its key bits so that a
/// traversal started before the deletion can still find its successor.
#[derive(Clone, Copy, Debug)]
struct Node {
    key: TValue,
    value: TValue,
    next: i32,
    dead: bool,
}

impl Node {
    fn vacant() -> Node {
        Node {
            key: TValue::empty(),
            value: TValue::empty(),
            next: -1,
            dead: false,
        }
    }

    /// A node never used as an insertion target.
    fn is_free(&self) -> bool {
        self.key.is_empty() && !self.dead
    }
}

/// Context a table needs to hash and compare keys that live on the heap:
/// long strings compare by content, boxed integers by value.
pub struct KeyCtx<'a> {
    pub strings: &'a Arena<TStr>,
    pub boxed_ints: &'a Arena<i64>,
    pub seed: u32,
}

impl KeyCtx<'_> {
    /// Integer value of a key, normalizing boxed integers and floats with
    /// zero fraction.
    fn key_int(&self, key: TValue) -> Option<i64> {
        if let Some(i) = key.as_integer() {
            return Some(i);
        }
        if let Some(r) = key.as_obj(ObjectKind::BoxedInt) {
            return Some(self.boxed_ints.get(r.index).data);
        }
        if let Some(f) = key.as_float() {
            if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                return Some(f as i64);
            }
        }
        None
    }

    fn key_eq(&self, stored: TValue, stored_dead: bool, probe: TValue, dead_ok: bool) -> bool {
        if stored_dead && !(dead_ok && probe.is_collectable()) {
            return false;
        }
        if stored.raw_bits() == probe.raw_bits() {
            return true;
        }
        if stored_dead {
            // Dead keys match by identity only.
            return false;
        }
        // Long strings compare by content; everything else by identity
        // (integer-valued keys are normalized before they get here).
        if let (Some(a), Some(b)) = (
            stored.as_obj(ObjectKind::Str),
            probe.as_obj(ObjectKind::Str),
        ) {
            let sa = &self.strings.get(a.index).data;
            let sb = &self.strings.get(b.index).data;
            return !sa.is_short() && !sb.is_short() && sa.as_bytes() == sb.as_bytes();
        }
        if let (Some(a), Some(b)) = (self.key_int(stored), self.key_int(probe)) {
            return a == b;
        }
        false
    }

    fn key_hash(&self, key: TValue, mask: usize) -> usize {
        if let Some(i) = self.key_int(key) {
            return (i as u64 as usize) & mask;
        }
        if let Some(f) = key.as_float() {
            let b = f.to_bits();
            return ((b ^ (b >> 32)) as usize) & mask;
        }
        if let Some(b) = key.as_bool() {
            return (1 + b as usize) & mask;
        }
        if let Some(r) = key.as_obj(ObjectKind::Str) {
            return self.strings.get(r.index).data.hash(self.seed) as usize & mask;
        }
        if let Some(r) = key.as_gc() {
            return (r.index as usize)
                .wrapping_mul(31)
                .wrapping_add(r.kind.sub_tag() as usize)
                & mask;
        }
        // Light userdata and anything else: mix the raw bits.
        let b = key.raw_bits();
        ((b ^ (b >> 32)) as usize) & mask
    }
}

/// Error from a raw table mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table index is nil")]
    NilIndex,
    #[error("table index is NaN")]
    NanIndex,
    #[error("not enough memory")]
    Alloc,
}

impl From<AllocError> for TableError {
    fn from(_: AllocError) -> Self {
        TableError::Alloc
    }
}

pub struct Table {
    /// Array part; a slot holds the empty marker when unset.
    array: Vec<TValue>,
    /// Border hint into the array part; exact unless `ARRAY_HINT` is set.
    alimit: u32,
    /// Hash part; empty or a power-of-two length.
    node: Vec<Node>,
    /// One past the last node not yet examined as an insertion target.
    lastfree: usize,
    pub flags: TableFlags,
    pub metatable: Option<GcRef>,
    /// Weakness decoded from the metatable's `__mode` when it was set.
    pub weak: WeakMode,
}

impl Table {
    pub fn new() -> Self {
        Table {
            array: Vec::new(),
            alimit: 0,
            node: Vec::new(),
            lastfree: 0,
            flags: TableFlags::empty(),
            metatable: None,
            weak: WeakMode::default(),
        }
    }

    /// Create a table presized for `array_hint` array slots and
    /// `hash_hint` hash entries.
    pub fn with_capacity(
        array_hint: usize,
        hash_hint: usize,
        ctx: &KeyCtx<'_>,
        mem: &mut Memory,
    ) -> Result<Self, TableError> {
        let mut t = Table::new();
        t.resize(array_hint, hash_hint, ctx, mem)?;
        Ok(t)
    }

    // ---- Metamethod-absence cache ----

    /// True if the cache records metamethod `tm` as absent.
    pub fn tm_absent_cached(&self, tm: Tm) -> bool {
        debug_assert!((tm as usize) < TM_FAST);
        self.flags
            .contains(TableFlags::from_bits_retain(1 << (tm as u8)))
    }

    pub fn cache_tm_absent(&mut self, tm: Tm) {
        debug_assert!((tm as usize) < TM_FAST);
        self.flags |= TableFlags::from_bits_retain(1 << (tm as u8));
    }

    /// Drop all cached absences; called whenever the metatable changes.
    pub fn invalidate_tm_cache(&mut self) {
        self.flags &= TableFlags::ARRAY_HINT;
    }

    // ---- Raw access ----

    /// Raw lookup. Returns the absent-key sentinel on a miss; a present
    /// entry is returned as stored.
    pub fn get(&self, key: TValue, ctx: &KeyCtx<'_>) -> TValue {
        if let Some(i) = ctx.key_int(key) {
            return self.get_int(i, ctx);
        }
        if key.is_nilish() {
            return TValue::absent_key();
        }
        if let Some(f) = key.as_float() {
            if f.is_nan() {
                return TValue::absent_key();
            }
        }
        self.get_generic(key, ctx)
    }

    /// Raw lookup with an integer key; O(1) when the key is in the array
    /// range.
    pub fn get_int(&self, i: i64, ctx: &KeyCtx<'_>) -> TValue {
        if i >= 1 && (i as u64 as usize) <= self.array.len() {
            let v = self.array[(i - 1) as usize];
            return if v.is_empty() { TValue::absent_key() } else { v };
        }
        if TValue::fits_inline(i) {
            self.get_generic(TValue::from_integer(i), ctx)
        } else {
            // Probe with the integer hash; equality resolves boxed keys.
            self.get_generic_hashed(|stored, dead| !dead && ctx.key_int(stored) == Some(i), i as u64 as usize)
        }
    }

    fn get_generic(&self, key: TValue, ctx: &KeyCtx<'_>) -> TValue {
        if self.node.is_empty() {
            return TValue::absent_key();
        }
        let mask = self.node.len() - 1;
        let mut pos = ctx.key_hash(key, mask) as i32;
        loop {
            let n = &self.node[pos as usize];
            if ctx.key_eq(n.key, n.dead, key, false) {
                return if n.value.is_empty() {
                    TValue::absent_key()
                } else {
                    n.value
                };
            }
            pos = n.next;
            if pos < 0 {
                return TValue::absent_key();
            }
        }
    }

    fn get_generic_hashed(
        &self,
        mut eq: impl FnMut(TValue, bool) -> bool,
        hash: usize,
    ) -> TValue {
        if self.node.is_empty() {
            return TValue::absent_key();
        }
        let mask = self.node.len() - 1;
        let mut pos = (hash & mask) as i32;
        loop {
            let n = &self.node[pos as usize];
            if eq(n.key, n.dead) {
                return if n.value.is_empty() {
                    TValue::absent_key()
                } else {
                    n.value
                };
            }
            pos = n.next;
            if pos < 0 {
                return TValue::absent_key();
            }
        }
    }

    /// Raw store. Nil keys and NaN keys are rejected; integer-valued
    /// float keys are normalized to integers. Storing nil erases the
    /// entry's value (the key may linger until the next rehash).
    pub fn set(
        &mut self,
        key: TValue,
        value: TValue,
        ctx: &KeyCtx<'_>,
        mem: &mut Memory,
    ) -> Result<(), TableError> {
        if key.is_nilish() {
            return Err(TableError::NilIndex);
        }
        if let Some(f) = key.as_float() {
            if f.is_nan() {
                return Err(TableError::NanIndex);
            }
        }
        let key = match ctx.key_int(key) {
            Some(i) if TValue::fits_inline(i) => TValue::from_integer(i),
            _ => key,
        };
        if let Some(i) = ctx.key_int(key) {
            if i >= 1 && (i as u64 as usize) <= self.array.len() {
                let slot = (i - 1) as usize;
                self.array[slot] = if value.is_nil() { TValue::empty() } else { value };
                return Ok(());
            }
        }
        // Hash part: update in place when present.
        if !self.node.is_empty() {
            let mask = self.node.len() - 1;
            let mut pos = ctx.key_hash(key, mask) as i32;
            loop {
                let n = &mut self.node[pos as usize];
                let (k, d, next) = (n.key, n.dead, n.next);
                if ctx.key_eq(k, d, key, false) {
                    // Erasing keeps the key; traversal and reinsertion
                    // still find it until the next rehash drops it.
                    n.value = if value.is_nil() { TValue::empty() } else { value };
                    return Ok(());
                }
                pos = next;
                if pos < 0 {
                    break;
                }
            }
        }
        if value.is_nil() {
            return Ok(()); // erasing an absent key is a no-op
        }
        self.new_key(key, value, ctx, mem)
    }

    /// Insert a key known to be absent (the slow path of `set`).
    fn new_key(
        &mut self,
        key: TValue,
        value: TValue,
        ctx: &KeyCtx<'_>,
        mem: &mut Memory,
    ) -> Result<(), TableError> {
        if self.node.is_empty() {
            self.rehash(key, ctx, mem)?;
            return self.set(key, value, ctx, mem);
        }
        let mask = self.node.len() - 1;
        let mp = ctx.key_hash(key, mask);
        if !self.node[mp].value.is_empty() {
            // Main position holds a live entry: need a free node. (A
            // node with an empty value (erased entry or dead key) is
            // recycled in place below, keeping its chain link; only live
            // occupants are ever moved, so their keys can be rehashed.)
            let f = match self.free_pos() {
                Some(f) => f,
                None => {
                    // lastfree crossed the start: grow and retry.
                    self.rehash(key, ctx, mem)?;
                    return self.set(key, value, ctx, mem);
                }
            };
            let occupant = self.node[mp];
            let othern = ctx.key_hash(occupant.key, mask);
            if othern != mp {
                // Colliding node is not in its own main chain: move it to
                // the free slot and take its place.
                let mut prev = othern;
                while self.node[prev].next != mp as i32 {
                    prev = self.node[prev].next as usize;
                }
                self.node[prev].next = f as i32;
                self.node[f] = occupant;
                self.node[mp] = Node {
                    key,
                    value,
                    next: -1,
                    dead: false,
                };
            } else {
                // Same main position: chain the new node after it.
                self.node[f] = Node {
                    key,
                    value,
                    next: self.node[mp].next,
                    dead: false,
                };
                self.node[mp].next = f as i32;
            }
        } else {
            // Recycle the slot, preserving any chain running through it.
            let next = self.node[mp].next;
            self.node[mp] = Node {
                key,
                value,
                next,
                dead: false,
            };
        }
        Ok(())
    }

    /// Walk `lastfree` backward to the next never-used node.
    fn free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].is_free() {
                return Some(self.lastfree);
            }
        }
        None
    }

    // ---- Rehashing ----

    /// Recompute optimal part sizes counting the pending key, then resize.
    fn rehash(
        &mut self,
        extra_key: TValue,
        ctx: &KeyCtx<'_>,
        mem: &mut Memory,
    ) -> Result<(), TableError> {
        let mut nums = [0u32; MAX_ABITS + 1];
        let mut na = self.count_array(&mut nums);
        let mut total = na;
        for n in &self.node {
            if !n.value.is_empty() {
                total += 1;
                na += count_int(n.key, ctx, &mut nums);
            }
        }
        total += 1;
        na += count_int(extra_key, ctx, &mut nums);
        let (asize, na) = compute_sizes(&nums, na);
        self.resize(asize, total - na, ctx, mem)
    }

    fn count_array(&self, nums: &mut [u32; MAX_ABITS + 1]) -> usize {
        let mut used = 0;
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_empty() {
                nums[ceil_log2(i + 1)] += 1;
                used += 1;
            }
        }
        used
    }

    /// Reallocate both parts. Entries that no longer fit the array part
    /// migrate into the hash part; consecutive integer keys migrate the
    /// other way.
    pub fn resize(
        &mut self,
        new_asize: usize,
        hash_entries: usize,
        ctx: &KeyCtx<'_>,
        mem: &mut Memory,
    ) -> Result<(), TableError> {
        let new_hsize = if hash_entries == 0 {
            0
        } else {
            hash_entries.next_power_of_two()
        };
        let old_mem = self.mem_size();

        let old_array = std::mem::replace(&mut self.array, vec![TValue::empty(); new_asize]);
        let old_nodes = std::mem::replace(&mut self.node, vec![Node::vacant(); new_hsize]);
        self.lastfree = new_hsize;
        self.alimit = new_asize as u32;
        self.flags.remove(TableFlags::ARRAY_HINT);

        mem.account_resize(old_mem, self.mem_size())?;

        // Reinsert everything; the new sizes were computed to fit, so
        // these inserts cannot recurse into another rehash.
        for (i, v) in old_array.into_iter().enumerate() {
            if !v.is_empty() {
                if i < new_asize {
                    self.array[i] = v;
                } else {
                    self.set(TValue::from_integer((i + 1) as i64), v, ctx, mem)?;
                }
            }
        }
        for n in old_nodes {
            if !n.value.is_empty() {
                self.set(n.key, n.value, ctx, mem)?;
            }
        }
        Ok(())
    }

    // ---- Length ----

    /// A border of the table: an `n` such that `t[n]` is present and
    /// `t[n+1]` is not. Uses `alimit` as a hint so the search is
    /// O(log n) without maintaining an exact count.
    pub fn length(&mut self, ctx: &KeyCtx<'_>) -> i64 {
        let real = self.array.len();
        let limit = (self.alimit as usize).min(real);
        if limit > 0 && self.array[limit - 1].is_empty() {
            // There is a border before the hint.
            if limit >= 2 && !self.array[limit - 2].is_empty() {
                self.set_border_hint(limit - 1, real);
                return (limit - 1) as i64;
            }
            let b = binsearch_border(&self.array, 0, limit);
            self.set_border_hint(b, real);
            return b as i64;
        }
        // Hint slot is present (or the array is empty).
        if real == 0 {
            return self.hash_length_from(0, ctx);
        }
        if !self.array[real - 1].is_empty() {
            // Array is full: the border continues into the hash part.
            return self.hash_length_from(real as i64, ctx);
        }
        let b = binsearch_border(&self.array, limit, real);
        self.set_border_hint(b, real);
        b as i64
    }

    fn set_border_hint(&mut self, border: usize, real: usize) {
        self.alimit = border as u32;
        if border != real {
            self.flags.insert(TableFlags::ARRAY_HINT);
        }
    }

    /// Unbound search through the hash part: double `j` until `t[j]` is
    /// absent, then binary search between the last present index and `j`.
    fn hash_length_from(&self, mut i: i64, ctx: &KeyCtx<'_>) -> i64 {
        if self.node.is_empty() {
            return i;
        }
        let mut j = i + 1;
        while !self.get_int(j, ctx).is_nilish() {
            i = j;
            if j > i64::MAX / 2 {
                // Pathological table; fall back to a linear scan.
                let mut n = 1;
                while !self.get_int(n, ctx).is_nilish() {
                    n += 1;
                }
                return n - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m, ctx).is_nilish() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ---- Iteration ----

    /// Find the entry following `key` in iteration order (array part,
    /// then hash part). A nil key starts the iteration. Returns
    /// `Err(())` when the key is not present; a dead key is still
    /// located and finds its successor.
    #[allow(clippy::result_unit_err)]
    pub fn next(
        &self,
        key: TValue,
        ctx: &KeyCtx<'_>,
    ) -> Result<Option<(TValue, TValue)>, ()> {
        let start = self.iter_index(key, ctx)?;
        for i in start..self.array.len() {
            if !self.array[i].is_empty() {
                return Ok(Some((TValue::from_integer((i + 1) as i64), self.array[i])));
            }
        }
        for i in start.saturating_sub(self.array.len())..self.node.len() {
            let n = &self.node[i];
            if !n.value.is_empty() {
                return Ok(Some((n.key, n.value)));
            }
        }
        Ok(None)
    }

    /// Map a key to the iteration index one past its position.
    fn iter_index(&self, key: TValue, ctx: &KeyCtx<'_>) -> Result<usize, ()> {
        if key.is_nil() {
            return Ok(0);
        }
        if let Some(i) = ctx.key_int(key) {
            if i >= 1 && (i as u64 as usize) <= self.array.len() {
                return Ok(i as usize);
            }
        }
        if self.node.is_empty() {
            return Err(());
        }
        let mask = self.node.len() - 1;
        let mut pos = ctx.key_hash(key, mask) as i32;
        loop {
            let n = &self.node[pos as usize];
            if ctx.key_eq(n.key, n.dead, key, true) {
                return Ok(self.array.len() + pos as usize + 1);
            }
            pos = n.next;
            if pos < 0 {
                return Err(());
            }
        }
    }

    // ---- GC support ----

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    pub fn array_get(&self, i: usize) -> TValue {
        self.array[i]
    }

    pub fn array_clear(&mut self, i: usize) {
        self.array[i] = TValue::empty();
    }

    pub fn nodes_len(&self) -> usize {
        self.node.len()
    }

    pub fn node_key(&self, i: usize) -> (TValue, bool) {
        (self.node[i].key, self.node[i].dead)
    }

    pub fn node_value(&self, i: usize) -> TValue {
        self.node[i].value
    }

    /// Erase a node's value. A collectable key is kept as a dead key so
    /// that in-flight traversals can still find their position.
    pub fn node_clear_value(&mut self, i: usize) {
        let n = &mut self.node[i];
        n.value = TValue::empty();
        if n.key.is_collectable() {
            n.dead = true;
        }
    }

    /// Mark a node's key dead without touching the value (used when only
    /// the key object died).
    pub fn node_kill_key(&mut self, i: usize) {
        debug_assert!(self.node[i].key.is_collectable());
        self.node[i].dead = true;
    }

    /// Bytes accounted to this table.
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.capacity() * std::mem::size_of::<TValue>()
            + self.node.capacity() * std::mem::size_of::<Node>()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary search for a border in `array[i..j]`, with slot `i` known
/// present (or i == 0) and slot `j-1` known absent. Indices are 1-based
/// table keys.
fn binsearch_border(array: &[TValue], mut i: usize, mut j: usize) -> usize {
    while j - i > 1 {
        let m = (i + j) / 2;
        if array[m - 1].is_empty() {
            j = m;
        } else {
            i = m;
        }
    }
    i
}

/// Count `key` into the integer-key census if it is a positive integer
/// within the array range.
fn count_int(key: TValue, ctx: &KeyCtx<'_>, nums: &mut [u32; MAX_ABITS + 1]) -> usize {
    match ctx.key_int(key) {
        Some(i) if i >= 1 && i <= (1i64 << MAX_ABITS) => {
            nums[ceil_log2(i as usize)] += 1;
            1
        }
        _ => 0,
    }
}

/// Choose the array size: the largest power of two such that more than
/// half the slots 1..=2^i would be used. Returns (array size, keys that
/// fit it).
fn compute_sizes(nums: &[u32; MAX_ABITS + 1], int_keys: usize) -> (usize, usize) {
    let mut a = 0usize; // keys smaller than 2^i
    let mut optimal = 0usize;
    let mut na = 0usize;
    let mut twotoi = 1usize;
    let mut i = 0;
    while twotoi > 0 && int_keys > twotoi / 2 {
        a += nums[i] as usize;
        if a > twotoi / 2 {
            optimal = twotoi;
            na = a;
        }
        i += 1;
        if i > MAX_ABITS {
            break;
        }
        twotoi *= 2;
    }
    (optimal, na)
}

/// Smallest e such that 2^e >= n, for n >= 1.
fn ceil_log2(n: usize) -> usize {
    debug_assert!(n >= 1);
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

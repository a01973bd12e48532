//! The garbage collector: typed arenas, object headers, tri-color
//! marking with write barriers, weak tables, finalization, and the
//! dual-mode (incremental/generational) cycle driver.
//!
//! Collectable objects may have one of three colors: white (not
//! reached), gray (reached, references pending), black (reached,
//! references scanned). While marking, the invariant is that a black
//! object never references a white one; every gray object sits on one
//! of the gray lists so it is visited again before the cycle ends.
//! During sweep the invariant is suspended.

use crate::func::{CClosure, LClosure, NativeFn, UpVal, UpvalState};
use crate::mem::{AllocError, Memory};
use crate::object::{GcRef, ObjectKind, Udata};
use crate::proto::{Constant, Proto};
use crate::string::{str_hash, InternTable, TStr, MAX_SHORT_LEN};
use crate::table::{KeyCtx, Table, TableError};
use crate::thread::Thread;
use crate::tm::{Tm, WeakMode, TM_COUNT, TM_NAMES};
use crate::value::TValue;

// ---- Header bit layout ----
// Bits 0-2 hold the generational age; the rest are color and life-cycle
// flags (ORDER matters for the white pair).

pub const WHITE0: u8 = 1 << 3;
pub const WHITE1: u8 = 1 << 4;
pub const BLACK: u8 = 1 << 5;
pub const FINALIZED: u8 = 1 << 6;
pub const TEST_BIT: u8 = 1 << 7;

pub const WHITE_BITS: u8 = WHITE0 | WHITE1;
const COLOR_BITS: u8 = WHITE_BITS | BLACK;
const AGE_BITS: u8 = 0x7;

// Object ages for generational collection.
pub const AGE_NEW: u8 = 0; // created in current cycle
pub const AGE_SURVIVAL: u8 = 1; // created in previous cycle
pub const AGE_OLD0: u8 = 2; // marked old by a forward barrier this cycle
pub const AGE_OLD1: u8 = 3; // first full cycle as old
pub const AGE_OLD: u8 = 4; // really old (not to be visited)
pub const AGE_TOUCHED1: u8 = 5; // old object touched this cycle
pub const AGE_TOUCHED2: u8 = 6; // old object touched in previous cycle

/// Every collectable object starts with one of these: the intrusive
/// list link and the packed mark byte.
#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    pub next: Option<GcRef>,
    pub marked: u8,
}

impl GcHeader {
    fn new(marked: u8) -> Self {
        GcHeader { next: None, marked }
    }

    pub fn is_white(&self) -> bool {
        self.marked & WHITE_BITS != 0
    }

    pub fn is_black(&self) -> bool {
        self.marked & BLACK != 0
    }

    pub fn is_gray(&self) -> bool {
        self.marked & COLOR_BITS == 0
    }

    /// Dead means "the other white": unreached in the cycle that is now
    /// sweeping.
    pub fn is_dead(&self, other_white: u8) -> bool {
        self.marked & other_white != 0
    }

    pub fn set_gray(&mut self) {
        self.marked &= !COLOR_BITS;
    }

    pub fn set_black(&mut self) {
        self.marked = (self.marked & !WHITE_BITS) | BLACK;
    }

    pub fn make_white(&mut self, current: u8) {
        self.marked = (self.marked & !COLOR_BITS) | current;
    }

    pub fn age(&self) -> u8 {
        self.marked & AGE_BITS
    }

    pub fn set_age(&mut self, age: u8) {
        self.marked = (self.marked & !AGE_BITS) | age;
    }

    pub fn is_old(&self) -> bool {
        self.age() > AGE_SURVIVAL
    }

    pub fn is_finalized(&self) -> bool {
        self.marked & FINALIZED != 0
    }

    pub fn set_finalized(&mut self, on: bool) {
        if on {
            self.marked |= FINALIZED;
        } else {
            self.marked &= !FINALIZED;
        }
    }
}

/// An arena slot: header plus payload.
#[derive(Debug)]
pub struct GcBox<T> {
    pub hdr: GcHeader,
    pub data: T,
}

/// Typed object arena with free-list reuse. A freed slot may be handed
/// out again; holding a stale `GcRef` across a collection is a caller
/// bug, exactly as a dangling pointer would be.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<GcBox<T>>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, data: T, marked: u8) -> u32 {
        let boxed = GcBox {
            hdr: GcHeader::new(marked),
            data,
        };
        if let Some(ix) = self.free.pop() {
            self.slots[ix as usize] = Some(boxed);
            ix
        } else {
            let ix = self.slots.len() as u32;
            self.slots.push(Some(boxed));
            ix
        }
    }

    pub fn get(&self, ix: u32) -> &GcBox<T> {
        self.slots[ix as usize].as_ref().expect("object was freed")
    }

    pub fn get_mut(&mut self, ix: u32) -> &mut GcBox<T> {
        self.slots[ix as usize].as_mut().expect("object was freed")
    }

    pub fn free(&mut self, ix: u32) -> GcBox<T> {
        let boxed = self.slots[ix as usize].take().expect("double free");
        self.free.push(ix);
        boxed
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys of these kinds are compared by content, so a weak table treats
/// them as values: they are kept alive rather than cleared.
fn value_like_key(r: GcRef) -> bool {
    matches!(r.kind, ObjectKind::Str | ObjectKind::BoxedInt)
}

/// Collector mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcKind {
    Incremental,
    Generational,
}

/// Collector phase. Only `Propagate` is interruptible at arbitrary
/// points; `Atomic` runs to completion in one step; the sweep phases
/// each process a bounded batch per step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPhase {
    Propagate,
    EnterAtomic,
    Atomic,
    SweepAllgc,
    SweepFinobj,
    SweepTobefnz,
    SweepEnd,
    CallFin,
    Pause,
}

/// Which intrusive list the sweep cursor is standing in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SweepList {
    AllGc,
    FinObj,
    ToBeFnz,
}

/// Objects swept per incremental step.
const SWEEP_MAX: usize = 100;
/// Work charged for running one finalizer.
pub(crate) const FINALIZE_COST: i64 = 50;
/// Bytes of traversal work per work unit.
const WORK2MEM: i64 = std::mem::size_of::<TValue>() as i64;
/// Divisor applied to the estimate when computing the pause threshold.
const PAUSE_ADJ: i64 = 100;

// Default tuning (percent, percent, log2 bytes, percent, percent).
pub const DEFAULT_PAUSE: u32 = 200;
pub const DEFAULT_STEP_MUL: u32 = 100;
pub const DEFAULT_STEP_SIZE: u32 = 13;
pub const DEFAULT_GEN_MINOR_MUL: u32 = 20;
pub const DEFAULT_GEN_MAJOR_MUL: u32 = 100;

/// The heap: all object arenas plus the collector's own state.
pub struct GcHeap {
    pub strings: Arena<TStr>,
    pub tables: Arena<Table>,
    pub lclosures: Arena<LClosure>,
    pub cclosures: Arena<CClosure>,
    pub nativefns: Arena<NativeFn>,
    pub upvals: Arena<UpVal>,
    pub protos: Arena<Proto>,
    pub threads: Arena<Thread>,
    pub userdata: Arena<Udata>,
    pub boxed_ints: Arena<i64>,

    strt: InternTable,
    pub mem: Memory,
    pub seed: u32,
    /// Preinterned metamethod name strings (fixed).
    pub tm_names: [GcRef; TM_COUNT],

    pub(crate) phase: GcPhase,
    pub kind: GcKind,
    current_white: u8,
    running: bool,
    pub(crate) emergency: bool,
    /// True while the collector itself is on the stack; allocations made
    /// by finalizers must not re-enter it.
    pub(crate) stepping: bool,

    // Object lists.
    allgc: Option<GcRef>,
    finobj: Option<GcRef>,
    tobefnz: Option<GcRef>,
    fixed: Option<GcRef>,

    // Sweep cursor: the object under the cursor and its predecessor.
    sweep_list: SweepList,
    sweep_prev: Option<GcRef>,
    sweep_cur: Option<GcRef>,

    // Gray lists.
    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    weak: Vec<GcRef>,
    ephemeron: Vec<GcRef>,
    allweak: Vec<GcRef>,

    /// Estimate of non-garbage bytes after the last cycle.
    estimate: usize,
    /// Nonzero while the generational collector is degraded to
    /// incremental stepping after a bad major collection.
    lastatomic: i64,

    // Tuning.
    pub pause: u32,
    pub step_mul: u32,
    pub step_size_log2: u32,
    pub gen_minor_mul: u32,
    pub gen_major_mul: u32,

    // Generational segment boundaries over `allgc` and `finobj`.
    survival: Option<GcRef>,
    old1: Option<GcRef>,
    reallyold: Option<GcRef>,
    firstold1: Option<GcRef>,
    finobjsur: Option<GcRef>,
    finobjold1: Option<GcRef>,
    finobjrold: Option<GcRef>,
}

impl GcHeap {
    pub fn new(seed: u32) -> Self {
        let mut heap = GcHeap {
            strings: Arena::new(),
            tables: Arena::new(),
            lclosures: Arena::new(),
            cclosures: Arena::new(),
            nativefns: Arena::new(),
            upvals: Arena::new(),
            protos: Arena::new(),
            threads: Arena::new(),
            userdata: Arena::new(),
            boxed_ints: Arena::new(),
            strt: InternTable::new(),
            mem: Memory::new(),
            seed,
            tm_names: [GcRef::new(ObjectKind::Str, 0); TM_COUNT],
            phase: GcPhase::Pause,
            kind: GcKind::Incremental,
            current_white: WHITE0,
            running: true,
            emergency: false,
            stepping: false,
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixed: None,
            sweep_list: SweepList::AllGc,
            sweep_prev: None,
            sweep_cur: None,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            estimate: 0,
            lastatomic: 0,
            pause: DEFAULT_PAUSE,
            step_mul: DEFAULT_STEP_MUL,
            step_size_log2: DEFAULT_STEP_SIZE,
            gen_minor_mul: DEFAULT_GEN_MINOR_MUL,
            gen_major_mul: DEFAULT_GEN_MAJOR_MUL,
            survival: None,
            old1: None,
            reallyold: None,
            firstold1: None,
            finobjsur: None,
            finobjold1: None,
            finobjrold: None,
        };
        for (i, name) in TM_NAMES.iter().enumerate() {
            let r = heap
                .intern(name.as_bytes())
                .expect("interning metamethod names cannot hit a limit");
            heap.fix_object(r);
            heap.tm_names[i] = r;
        }
        // Give the mutator some headroom before the first cycle.
        heap.mem.set_debt(-8 * 1024);
        heap
    }

    // ---- Colors and predicates ----

    pub fn current_white(&self) -> u8 {
        self.current_white
    }

    fn other_white(&self) -> u8 {
        self.current_white ^ WHITE_BITS
    }

    /// Must the no-black-to-white invariant hold right now?
    pub fn keep_invariant(&self) -> bool {
        matches!(
            self.phase,
            GcPhase::Propagate | GcPhase::EnterAtomic | GcPhase::Atomic
        )
    }

    fn is_sweep_phase(&self) -> bool {
        matches!(
            self.phase,
            GcPhase::SweepAllgc | GcPhase::SweepFinobj | GcPhase::SweepTobefnz | GcPhase::SweepEnd
        )
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn restart(&mut self) {
        self.running = true;
        self.mem.set_debt(0);
    }

    pub fn estimate(&self) -> usize {
        self.estimate
    }

    /// Is the object `r` dead (unreachable at the last mark) right now?
    pub fn is_dead(&self, r: GcRef) -> bool {
        self.header(r).is_dead(self.other_white())
    }

    // ---- Header access by handle ----

    pub fn header(&self, r: GcRef) -> &GcHeader {
        match r.kind {
            ObjectKind::Table => &self.tables.get(r.index).hdr,
            ObjectKind::ScriptClosure => &self.lclosures.get(r.index).hdr,
            ObjectKind::NativeClosure => &self.cclosures.get(r.index).hdr,
            ObjectKind::NativeFn => &self.nativefns.get(r.index).hdr,
            ObjectKind::Upvalue => &self.upvals.get(r.index).hdr,
            ObjectKind::BoxedInt => &self.boxed_ints.get(r.index).hdr,
            ObjectKind::Str => &self.strings.get(r.index).hdr,
            ObjectKind::Proto => &self.protos.get(r.index).hdr,
            ObjectKind::Thread => &self.threads.get(r.index).hdr,
            ObjectKind::Userdata => &self.userdata.get(r.index).hdr,
        }
    }

    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r.kind {
            ObjectKind::Table => &mut self.tables.get_mut(r.index).hdr,
            ObjectKind::ScriptClosure => &mut self.lclosures.get_mut(r.index).hdr,
            ObjectKind::NativeClosure => &mut self.cclosures.get_mut(r.index).hdr,
            ObjectKind::NativeFn => &mut self.nativefns.get_mut(r.index).hdr,
            ObjectKind::Upvalue => &mut self.upvals.get_mut(r.index).hdr,
            ObjectKind::BoxedInt => &mut self.boxed_ints.get_mut(r.index).hdr,
            ObjectKind::Str => &mut self.strings.get_mut(r.index).hdr,
            ObjectKind::Proto => &mut self.protos.get_mut(r.index).hdr,
            ObjectKind::Thread => &mut self.threads.get_mut(r.index).hdr,
            ObjectKind::Userdata => &mut self.userdata.get_mut(r.index).hdr,
        }
    }

    /// Bytes accounted to a live object.
    pub fn object_size(&self, r: GcRef) -> usize {
        match r.kind {
            ObjectKind::Table => self.tables.get(r.index).data.mem_size(),
            ObjectKind::ScriptClosure => self.lclosures.get(r.index).data.mem_size(),
            ObjectKind::NativeClosure => self.cclosures.get(r.index).data.mem_size(),
            ObjectKind::NativeFn => std::mem::size_of::<NativeFn>(),
            ObjectKind::Upvalue => std::mem::size_of::<UpVal>(),
            ObjectKind::BoxedInt => std::mem::size_of::<i64>() + 8,
            ObjectKind::Str => self.strings.get(r.index).data.mem_size(),
            ObjectKind::Proto => self.protos.get(r.index).data.mem_size(),
            ObjectKind::Thread => self.threads.get(r.index).data.mem_size(),
            ObjectKind::Userdata => {
                let u = &self.userdata.get(r.index).data;
                std::mem::size_of::<Udata>()
                    + u.data.capacity()
                    + u.user_values.capacity() * std::mem::size_of::<TValue>()
            }
        }
    }

    fn key_ctx(&self) -> KeyCtx<'_> {
        KeyCtx {
            strings: &self.strings,
            boxed_ints: &self.boxed_ints,
            seed: self.seed,
        }
    }

    // ---- Allocation ----

    /// Birth color: objects are born the current white with age NEW.
    fn birth_mark(&self) -> u8 {
        self.current_white | AGE_NEW
    }

    fn link_allgc(&mut self, r: GcRef) {
        let head = self.allgc;
        self.header_mut(r).next = head;
        self.allgc = Some(r);
        // New objects are part of the nursery; the survival boundary
        // stays where it is (it marks the *end* of the nursery).
    }

    /// Remove an object from `allgc`, keeping the sweep cursor and the
    /// generational boundaries coherent. O(list length).
    fn unlink_allgc(&mut self, r: GcRef) {
        let mut prev: Option<GcRef> = None;
        let mut cur = self.allgc;
        while let Some(c) = cur {
            if c == r {
                let next = self.header(c).next;
                match prev {
                    None => self.allgc = next,
                    Some(p) => self.header_mut(p).next = next,
                }
                if self.sweep_cur == Some(r) {
                    self.sweep_cur = next;
                } else if self.sweep_prev == Some(r) {
                    self.sweep_prev = prev;
                }
                for boundary in [
                    &mut self.survival,
                    &mut self.old1,
                    &mut self.reallyold,
                    &mut self.firstold1,
                ] {
                    if *boundary == Some(r) {
                        *boundary = next;
                    }
                }
                return;
            }
            prev = cur;
            cur = self.header(c).next;
        }
        unreachable!("object not on allgc");
    }

    pub fn new_table(
        &mut self,
        array_hint: usize,
        hash_hint: usize,
    ) -> Result<GcRef, AllocError> {
        self.mem.account_alloc(std::mem::size_of::<Table>())?;
        let table = {
            let GcHeap {
                strings,
                boxed_ints,
                seed,
                mem,
                ..
            } = self;
            let ctx = KeyCtx {
                strings,
                boxed_ints,
                seed: *seed,
            };
            match Table::with_capacity(array_hint, hash_hint, &ctx, mem) {
                Ok(t) => t,
                Err(_) => {
                    mem.account_free(std::mem::size_of::<Table>());
                    return Err(AllocError);
                }
            }
        };
        let ix = self.tables.alloc(table, self.birth_mark());
        let r = GcRef::new(ObjectKind::Table, ix);
        self.link_allgc(r);
        Ok(r)
    }

    /// Intern a short string; equal content always yields the same
    /// handle. Resurrects an interned string the sweep has not reached.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<GcRef, AllocError> {
        debug_assert!(bytes.len() <= MAX_SHORT_LEN);
        let hash = str_hash(bytes, self.seed);
        let found = {
            let strings = &self.strings;
            self.strt
                .find(hash, |ix| strings.get(ix).data.as_bytes() == bytes)
        };
        if let Some(ix) = found {
            let r = GcRef::new(ObjectKind::Str, ix);
            if self.is_dead(r) {
                // Unreached but not yet swept: flip it back to life.
                self.header_mut(r).marked ^= WHITE_BITS;
            }
            return Ok(r);
        }
        let s = TStr::new_short(bytes, self.seed);
        self.mem.account_alloc(s.mem_size())?;
        let ix = self.strings.alloc(s, self.birth_mark());
        let r = GcRef::new(ObjectKind::Str, ix);
        self.link_allgc(r);
        self.strt.insert(hash, ix);
        Ok(r)
    }

    pub fn new_long_string(&mut self, bytes: &[u8]) -> Result<GcRef, AllocError> {
        debug_assert!(bytes.len() > MAX_SHORT_LEN);
        let s = TStr::new_long(bytes);
        self.mem.account_alloc(s.mem_size())?;
        let ix = self.strings.alloc(s, self.birth_mark());
        let r = GcRef::new(ObjectKind::Str, ix);
        self.link_allgc(r);
        Ok(r)
    }

    /// Intern or create depending on length.
    pub fn new_string(&mut self, bytes: &[u8]) -> Result<GcRef, AllocError> {
        if bytes.len() <= MAX_SHORT_LEN {
            self.intern(bytes)
        } else {
            self.new_long_string(bytes)
        }
    }

    pub fn str_bytes(&self, r: GcRef) -> &[u8] {
        debug_assert_eq!(r.kind, ObjectKind::Str);
        self.strings.get(r.index).data.as_bytes()
    }

    /// A TValue holding integer `i`, boxing when it does not fit inline.
    pub fn int_value(&mut self, i: i64) -> Result<TValue, AllocError> {
        if TValue::fits_inline(i) {
            return Ok(TValue::from_integer(i));
        }
        self.mem.account_alloc(self.boxed_int_size())?;
        let ix = self.boxed_ints.alloc(i, self.birth_mark());
        let r = GcRef::new(ObjectKind::BoxedInt, ix);
        self.link_allgc(r);
        Ok(TValue::from_obj(r))
    }

    fn boxed_int_size(&self) -> usize {
        std::mem::size_of::<i64>() + 8
    }

    /// Integer value of `v`, looking through boxes.
    pub fn as_integer(&self, v: TValue) -> Option<i64> {
        if let Some(i) = v.as_integer() {
            return Some(i);
        }
        v.as_obj(ObjectKind::BoxedInt)
            .map(|r| self.boxed_ints.get(r.index).data)
    }

    pub fn new_lclosure(&mut self, proto: GcRef, upvals: Vec<GcRef>) -> Result<GcRef, AllocError> {
        let c = LClosure { proto, upvals };
        self.mem.account_alloc(c.mem_size())?;
        let ix = self.lclosures.alloc(c, self.birth_mark());
        let r = GcRef::new(ObjectKind::ScriptClosure, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_cclosure(
        &mut self,
        func: crate::func::NativeFnPtr,
        name: &'static str,
        upvalues: Vec<TValue>,
    ) -> Result<GcRef, AllocError> {
        let c = CClosure {
            func,
            name,
            upvalues,
        };
        self.mem.account_alloc(c.mem_size())?;
        let ix = self.cclosures.alloc(c, self.birth_mark());
        let r = GcRef::new(ObjectKind::NativeClosure, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_native(
        &mut self,
        func: crate::func::NativeFnPtr,
        name: &'static str,
    ) -> Result<GcRef, AllocError> {
        self.mem.account_alloc(std::mem::size_of::<NativeFn>())?;
        let ix = self.nativefns.alloc(NativeFn { func, name }, self.birth_mark());
        let r = GcRef::new(ObjectKind::NativeFn, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_proto(&mut self, proto: Proto) -> Result<GcRef, AllocError> {
        self.mem.account_alloc(proto.mem_size())?;
        let ix = self.protos.alloc(proto, self.birth_mark());
        let r = GcRef::new(ObjectKind::Proto, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_thread(&mut self) -> Result<GcRef, AllocError> {
        let t = Thread::new();
        self.mem.account_alloc(t.mem_size())?;
        let ix = self.threads.alloc(t, self.birth_mark());
        let r = GcRef::new(ObjectKind::Thread, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_userdata(&mut self, size: usize, nuvalue: usize) -> Result<GcRef, AllocError> {
        let u = Udata::new(size, nuvalue);
        self.mem.account_alloc(
            std::mem::size_of::<Udata>()
                + u.data.capacity()
                + u.user_values.capacity() * std::mem::size_of::<TValue>(),
        )?;
        let ix = self.userdata.alloc(u, self.birth_mark());
        let r = GcRef::new(ObjectKind::Userdata, ix);
        self.link_allgc(r);
        Ok(r)
    }

    pub fn new_upvalue(&mut self, uv: UpVal) -> Result<GcRef, AllocError> {
        self.mem.account_alloc(std::mem::size_of::<UpVal>())?;
        let ix = self.upvals.alloc(uv, self.birth_mark());
        let r = GcRef::new(ObjectKind::Upvalue, ix);
        self.link_allgc(r);
        Ok(r)
    }

    /// Move an object out of `allgc` into the fixed list: it will never
    /// be collected. Used for objects the state itself must keep alive
    /// (metamethod names, reserved words, the main thread).
    pub fn fix_object(&mut self, r: GcRef) {
        self.unlink_allgc(r);
        let head = self.fixed;
        let hdr = self.header_mut(r);
        hdr.next = head;
        hdr.set_gray(); // fixed objects are never swept nor blackened
        hdr.set_age(AGE_OLD);
        self.fixed = Some(r);
    }

    /// True while the object is on the ordinary `allgc` list.
    pub fn is_on_allgc(&self, r: GcRef) -> bool {
        let mut cur = self.allgc;
        while let Some(c) = cur {
            if c == r {
                return true;
            }
            cur = self.header(c).next;
        }
        false
    }

    // ---- Table operations with barriers ----

    pub fn table_get(&self, t: GcRef, key: TValue) -> TValue {
        self.tables.get(t.index).data.get(key, &self.key_ctx())
    }

    pub fn table_get_int(&self, t: GcRef, i: i64) -> TValue {
        self.tables.get(t.index).data.get_int(i, &self.key_ctx())
    }

    /// Raw `t[key] = value` with the backward write barrier tables use
    /// for element stores: a black table acquiring a white member turns
    /// gray-again rather than marking each member eagerly.
    pub fn table_set(&mut self, t: GcRef, key: TValue, value: TValue) -> Result<(), TableError> {
        let parent_black = self.header(t).is_black();
        if parent_black && (self.is_white_value(key) || self.is_white_value(value)) {
            self.barrier_back(t);
        }
        let GcHeap {
            tables,
            strings,
            boxed_ints,
            seed,
            mem,
            ..
        } = self;
        let ctx = KeyCtx {
            strings,
            boxed_ints,
            seed: *seed,
        };
        tables.get_mut(t.index).data.set(key, value, &ctx, mem)
    }

    pub fn table_len(&mut self, t: GcRef) -> i64 {
        let GcHeap {
            tables,
            strings,
            boxed_ints,
            seed,
            ..
        } = self;
        let ctx = KeyCtx {
            strings,
            boxed_ints,
            seed: *seed,
        };
        tables.get_mut(t.index).data.length(&ctx)
    }

    #[allow(clippy::result_unit_err)]
    pub fn table_next(&self, t: GcRef, key: TValue) -> Result<Option<(TValue, TValue)>, ()> {
        self.tables.get(t.index).data.next(key, &self.key_ctx())
    }

    /// Assign a metatable to a table. Uses the forward barrier, refreshes
    /// the weakness cache, invalidates the metamethod-absence cache, and
    /// separates the object for finalization when `__gc` appears.
    pub fn set_table_metatable(&mut self, t: GcRef, mt: Option<GcRef>) {
        if let Some(m) = mt {
            if self.header(t).is_black() && self.header(m).is_white() {
                self.barrier_forward(t, m);
            }
        }
        let weak = mt.map_or(WeakMode::default(), |m| self.decode_weakness(m));
        {
            let tbl = &mut self.tables.get_mut(t.index).data;
            tbl.metatable = mt;
            tbl.invalidate_tm_cache();
            tbl.weak = weak;
        }
        if let Some(m) = mt {
            self.check_finalizer(t, m);
        }
    }

    pub fn set_userdata_metatable(&mut self, u: GcRef, mt: Option<GcRef>) {
        if let Some(m) = mt {
            if self.header(u).is_black() && self.header(m).is_white() {
                self.barrier_forward(u, m);
            }
        }
        self.userdata.get_mut(u.index).data.metatable = mt;
        if let Some(m) = mt {
            self.check_finalizer(u, m);
        }
    }

    fn decode_weakness(&self, mt: GcRef) -> WeakMode {
        let mode_name = self.tm_names[Tm::Mode as usize];
        let v = self.table_get(mt, TValue::from_obj(mode_name));
        match v.as_obj(ObjectKind::Str) {
            Some(s) => WeakMode::from_mode_str(self.strings.get(s.index).data.as_bytes()),
            None => WeakMode::default(),
        }
    }

    /// Metamethod lookup on a table, going through the absence cache.
    pub fn table_tm(&mut self, t: GcRef, tm: Tm) -> TValue {
        let mt = match self.tables.get(t.index).data.metatable {
            Some(mt) => mt,
            None => return TValue::nil(),
        };
        if (tm as usize) < crate::tm::TM_FAST && self.tables.get(t.index).data.tm_absent_cached(tm)
        {
            return TValue::nil();
        }
        let v = self
            .table_get(mt, TValue::from_obj(self.tm_names[tm as usize]))
            .or_nil();
        if v.is_nil() && (tm as usize) < crate::tm::TM_FAST {
            self.tables.get_mut(t.index).data.cache_tm_absent(tm);
        }
        v
    }

    /// The `__gc` metamethod of an object's metatable, if any.
    pub fn gc_metamethod(&self, obj: GcRef) -> TValue {
        let mt = match obj.kind {
            ObjectKind::Table => self.tables.get(obj.index).data.metatable,
            ObjectKind::Userdata => self.userdata.get(obj.index).data.metatable,
            _ => None,
        };
        match mt {
            Some(mt) => self
                .table_get(mt, TValue::from_obj(self.tm_names[Tm::Gc as usize]))
                .or_nil(),
            None => TValue::nil(),
        }
    }

    /// If `mt` carries `__gc` and `obj` is not already marked for
    /// finalization, move `obj` from `allgc` to `finobj`.
    fn check_finalizer(&mut self, obj: GcRef, mt: GcRef) {
        if self.header(obj).is_finalized() {
            return;
        }
        let gc_name = TValue::from_obj(self.tm_names[Tm::Gc as usize]);
        if self.table_get(mt, gc_name).or_nil().is_nil() {
            return;
        }
        self.unlink_allgc(obj);
        let head = self.finobj;
        let hdr = self.header_mut(obj);
        hdr.next = head;
        hdr.set_finalized(true);
        self.finobj = Some(obj);
    }

    // ---- Upvalue plumbing ----

    /// Find or create an open upvalue for `thread` at stack `level`. The
    /// per-thread list is kept sorted by decreasing level.
    pub fn find_upvalue(&mut self, thread: GcRef, level: usize) -> Result<GcRef, AllocError> {
        let pos = {
            let th = &self.threads.get(thread.index).data;
            let mut pos = th.open_upvals.len();
            let mut found = None;
            for (i, &uv) in th.open_upvals.iter().enumerate() {
                let l = self.upvals.get(uv.index).data.level().expect("open list");
                if l == level {
                    found = Some(uv);
                    break;
                }
                if l < level {
                    pos = i;
                    break;
                }
            }
            match found {
                Some(uv) => return Ok(uv),
                None => pos,
            }
        };
        let uv = self.new_upvalue(UpVal::new_open(thread, level))?;
        self.threads
            .get_mut(thread.index)
            .data
            .open_upvals
            .insert(pos, uv);
        Ok(uv)
    }

    /// Close every upvalue at or above `level`: copy the stack slot into
    /// the upvalue and unlink it. Runs the forward barrier for black
    /// upvalues capturing white values.
    pub fn close_upvalues(&mut self, thread: GcRef, level: usize) {
        loop {
            let (uv, l) = {
                let th = &self.threads.get(thread.index).data;
                match th.open_upvals.first() {
                    Some(&uv) => (uv, self.upvals.get(uv.index).data.level().expect("open")),
                    None => return,
                }
            };
            if l < level {
                return;
            }
            let value = self.threads.get(thread.index).data.slot(l);
            self.threads.get_mut(thread.index).data.open_upvals.remove(0);
            self.upvals.get_mut(uv.index).data.close(value);
            if self.header(uv).is_black() {
                if let Some(child) = value.as_gc() {
                    if self.header(child).is_white() {
                        self.barrier_forward(uv, child);
                    }
                }
            }
        }
    }

    // ---- Write barriers ----

    /// Forward barrier: a black parent acquired a white child; mark the
    /// child immediately so the invariant holds. Used for metatable
    /// stores and upvalue closes.
    pub fn barrier_forward(&mut self, parent: GcRef, child: GcRef) {
        debug_assert!(self.header(parent).is_black() && self.header(child).is_white());
        if self.keep_invariant() {
            self.mark_object(child);
            if self.header(parent).is_old() {
                // A young object referenced from an old one must not be
                // swept young again.
                debug_assert!(!self.header(child).is_old());
                self.header_mut(child).set_age(AGE_OLD0);
            }
        } else if self.kind == GcKind::Incremental {
            // Sweep will whiten the parent eventually; do it now so the
            // pair is consistent.
            debug_assert!(self.is_sweep_phase() || self.phase == GcPhase::Pause);
            let white = self.current_white;
            self.header_mut(parent).make_white(white);
        }
    }

    /// Backward barrier: a black table acquired a white member; re-gray
    /// the table so the atomic phase revisits it once, however many
    /// members were stored.
    pub fn barrier_back(&mut self, parent: GcRef) {
        debug_assert!(self.header(parent).is_black());
        let age = self.header(parent).age();
        if age != AGE_TOUCHED2 {
            // TOUCHED2 objects are already on the grayagain list.
            self.grayagain.push(parent);
        }
        self.header_mut(parent).set_gray();
        if self.header(parent).is_old() || age == AGE_TOUCHED2 {
            self.header_mut(parent).set_age(AGE_TOUCHED1);
        }
    }

    fn is_white_value(&self, v: TValue) -> bool {
        v.as_gc().is_some_and(|r| self.header(r).is_white())
    }

    // ---- Marking ----

    pub(crate) fn mark_value(&mut self, v: TValue) {
        if let Some(r) = v.as_gc() {
            self.mark_object(r);
        }
    }

    /// Turn a white object gray (queued) or black (leaf).
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        if !self.header(r).is_white() {
            return;
        }
        match r.kind {
            ObjectKind::Str | ObjectKind::BoxedInt | ObjectKind::NativeFn => {
                self.header_mut(r).set_black();
            }
            ObjectKind::Upvalue => {
                // Open upvalues read through the owning stack, which is a
                // root; closed ones own their value.
                self.header_mut(r).set_black();
                let v = match self.upvals.get(r.index).data.state {
                    UpvalState::Closed(v) => Some(v),
                    UpvalState::Open { .. } => None,
                };
                if let Some(v) = v {
                    self.mark_value(v);
                }
            }
            _ => {
                self.header_mut(r).set_gray();
                self.gray.push(r);
            }
        }
    }

    /// Pop-and-scan one gray object; returns traversal work in bytes.
    fn propagate_mark(&mut self, r: GcRef) -> i64 {
        self.header_mut(r).set_black();
        let work = self.object_size(r) as i64;
        match r.kind {
            ObjectKind::Table => self.traverse_table(r),
            ObjectKind::ScriptClosure => self.traverse_lclosure(r),
            ObjectKind::NativeClosure => self.traverse_cclosure(r),
            ObjectKind::Proto => self.traverse_proto(r),
            ObjectKind::Thread => self.traverse_thread(r),
            ObjectKind::Userdata => self.traverse_userdata(r),
            _ => debug_assert!(false, "leaf object on gray list"),
        }
        work
    }

    /// Propagate a single gray object, if any.
    pub(crate) fn propagate_one(&mut self) -> Option<i64> {
        let r = self.gray.pop()?;
        Some(self.propagate_mark(r))
    }

    fn propagate_all(&mut self) -> i64 {
        let mut work = 0;
        while let Some(r) = self.gray.pop() {
            work += self.propagate_mark(r);
        }
        work
    }

    fn traverse_table(&mut self, r: GcRef) {
        let (weak, mt) = {
            let t = &self.tables.get(r.index).data;
            (t.weak, t.metatable)
        };
        if let Some(mt) = mt {
            self.mark_object(mt);
        }
        match (weak.keys, weak.values) {
            (false, false) => self.traverse_strong_table(r),
            (false, true) => self.traverse_weak_value_table(r),
            (true, false) => {
                self.traverse_ephemeron(r);
            }
            (true, true) => {
                // Nothing to traverse; both sides wait for clearing.
                self.header_mut(r).set_gray();
                self.allweak.push(r);
            }
        }
    }

    fn traverse_strong_table(&mut self, r: GcRef) {
        let mut children: Vec<TValue> = Vec::new();
        let mut dead_nodes: Vec<usize> = Vec::new();
        {
            let t = &self.tables.get(r.index).data;
            for i in 0..t.array_len() {
                let v = t.array_get(i);
                if !v.is_empty() {
                    children.push(v);
                }
            }
            for i in 0..t.nodes_len() {
                let (k, dead) = t.node_key(i);
                let v = t.node_value(i);
                if v.is_empty() {
                    if k.is_collectable() && !dead {
                        dead_nodes.push(i);
                    }
                } else {
                    children.push(k);
                    children.push(v);
                }
            }
        }
        let t = &mut self.tables.get_mut(r.index).data;
        for i in dead_nodes {
            t.node_kill_key(i);
        }
        for v in children {
            self.mark_value(v);
        }
    }

    fn traverse_weak_value_table(&mut self, r: GcRef) {
        let mut keys: Vec<TValue> = Vec::new();
        let mut dead_nodes: Vec<usize> = Vec::new();
        {
            let t = &self.tables.get(r.index).data;
            for i in 0..t.nodes_len() {
                let (k, dead) = t.node_key(i);
                let v = t.node_value(i);
                if v.is_empty() {
                    if k.is_collectable() && !dead {
                        dead_nodes.push(i);
                    }
                } else {
                    keys.push(k);
                }
            }
        }
        {
            let t = &mut self.tables.get_mut(r.index).data;
            for i in dead_nodes {
                t.node_kill_key(i);
            }
        }
        for k in keys {
            self.mark_value(k);
        }
        // Values stay unmarked; the table is revisited in the atomic
        // phase and then queued for value clearing.
        self.header_mut(r).set_gray();
        if self.phase == GcPhase::Atomic {
            self.weak.push(r);
        } else {
            self.grayagain.push(r);
        }
    }

    /// Scan a weak-keyed table. Values of reachable keys are marked;
    /// returns true if this pass marked anything new.
    fn traverse_ephemeron(&mut self, r: GcRef) -> bool {
        let mut to_mark: Vec<TValue> = Vec::new();
        let mut keys_to_mark: Vec<GcRef> = Vec::new();
        let mut dead_nodes: Vec<usize> = Vec::new();
        let mut has_white_keys = false;
        let mut has_white_white = false;
        {
            let t = &self.tables.get(r.index).data;
            // Array entries have non-collectable keys: plain strong values.
            for i in 0..t.array_len() {
                let v = t.array_get(i);
                if !v.is_empty() && self.is_white_value(v) {
                    to_mark.push(v);
                }
            }
            for i in 0..t.nodes_len() {
                let (k, dead) = t.node_key(i);
                let v = t.node_value(i);
                if v.is_empty() {
                    if k.is_collectable() && !dead {
                        dead_nodes.push(i);
                    }
                    continue;
                }
                let key_unreached = match k.as_gc() {
                    None => false,
                    Some(kr) if value_like_key(kr) => {
                        // String and boxed-integer keys are values, never
                        // weak: keep them alive instead.
                        keys_to_mark.push(kr);
                        false
                    }
                    Some(kr) => self.header(kr).is_white(),
                };
                if key_unreached {
                    has_white_keys = true;
                    if self.is_white_value(v) {
                        has_white_white = true;
                    }
                } else if self.is_white_value(v) {
                    // Key is reachable: the value is too.
                    to_mark.push(v);
                }
            }
        }
        for k in keys_to_mark {
            self.mark_object(k);
        }
        {
            let t = &mut self.tables.get_mut(r.index).data;
            for i in dead_nodes {
                t.node_kill_key(i);
            }
        }
        let marked = !to_mark.is_empty();
        for v in to_mark {
            self.mark_value(v);
        }
        if self.phase == GcPhase::Propagate {
            self.header_mut(r).set_gray();
            self.grayagain.push(r);
        } else if has_white_white {
            // A white key guarding a white value: must reprocess until
            // the fixed point.
            self.header_mut(r).set_gray();
            self.ephemeron.push(r);
        } else if has_white_keys {
            // Only clearing remains.
            self.header_mut(r).set_gray();
            self.allweak.push(r);
        }
        marked
    }

    fn traverse_lclosure(&mut self, r: GcRef) {
        let (proto, upvals) = {
            let c = &self.lclosures.get(r.index).data;
            (c.proto, c.upvals.clone())
        };
        self.mark_object(proto);
        for uv in upvals {
            self.mark_object(uv);
        }
    }

    fn traverse_cclosure(&mut self, r: GcRef) {
        let upvalues = self.cclosures.get(r.index).data.upvalues.clone();
        for v in upvalues {
            self.mark_value(v);
        }
    }

    fn traverse_proto(&mut self, r: GcRef) {
        let mut children: Vec<GcRef> = Vec::new();
        {
            let p = &self.protos.get(r.index).data;
            if let Some(s) = p.source {
                children.push(s);
            }
            for k in &p.constants {
                if let Constant::String(s) = k {
                    children.push(*s);
                }
            }
            children.extend(p.protos.iter().copied());
            for u in &p.upvalues {
                if let Some(n) = u.name {
                    children.push(n);
                }
            }
            for lv in &p.local_vars {
                children.push(lv.name);
            }
        }
        for c in children {
            self.mark_object(c);
        }
    }

    fn traverse_userdata(&mut self, r: GcRef) {
        let (mt, uvs) = {
            let u = &self.userdata.get(r.index).data;
            (u.metatable, u.user_values.clone())
        };
        if let Some(mt) = mt {
            self.mark_object(mt);
        }
        for v in uvs {
            self.mark_value(v);
        }
    }

    fn traverse_thread(&mut self, r: GcRef) {
        let (slots, upvals) = {
            let t = &self.threads.get(r.index).data;
            (t.live_slots().to_vec(), t.open_upvals.clone())
        };
        for v in slots {
            self.mark_value(v);
        }
        for uv in upvals {
            self.mark_object(uv);
        }
        if self.phase == GcPhase::Propagate {
            // Threads keep mutating their stacks; revisit in atomic.
            self.header_mut(r).set_gray();
            self.grayagain.push(r);
        }
    }

    // ---- Weak clearing and ephemeron convergence ----

    fn converge_ephemerons(&mut self) -> i64 {
        let mut work = 0;
        loop {
            let list = std::mem::take(&mut self.ephemeron);
            if list.is_empty() {
                break;
            }
            let mut changed = false;
            for r in list {
                self.header_mut(r).set_black();
                if self.traverse_ephemeron(r) {
                    changed = true;
                    work += self.propagate_all();
                }
            }
            if !changed {
                break;
            }
        }
        work
    }

    /// Clear entries with dead values from the given weak tables.
    fn clear_by_values(&mut self, tables: &[GcRef]) {
        for &r in tables {
            let mut dead_array: Vec<usize> = Vec::new();
            let mut dead_nodes: Vec<usize> = Vec::new();
            {
                let t = &self.tables.get(r.index).data;
                for i in 0..t.array_len() {
                    let v = t.array_get(i);
                    if !v.is_empty() && self.is_white_value(v) {
                        dead_array.push(i);
                    }
                }
                for i in 0..t.nodes_len() {
                    let v = t.node_value(i);
                    if !v.is_empty() && self.is_white_value(v) {
                        dead_nodes.push(i);
                    }
                }
            }
            let t = &mut self.tables.get_mut(r.index).data;
            for i in dead_array {
                t.array_clear(i);
            }
            for i in dead_nodes {
                t.node_clear_value(i);
            }
        }
    }

    /// Clear entries with dead keys from the given weak tables. String
    /// and boxed-integer keys behave as values and never clear an entry.
    fn clear_by_keys(&mut self, tables: &[GcRef]) {
        for &r in tables {
            let mut dead_nodes: Vec<usize> = Vec::new();
            {
                let t = &self.tables.get(r.index).data;
                for i in 0..t.nodes_len() {
                    let (k, dead) = t.node_key(i);
                    let v = t.node_value(i);
                    if v.is_empty() || dead {
                        continue;
                    }
                    if let Some(kr) = k.as_gc() {
                        if !value_like_key(kr) && self.header(kr).is_white() {
                            dead_nodes.push(i);
                        }
                    }
                }
            }
            let t = &mut self.tables.get_mut(r.index).data;
            for i in dead_nodes {
                t.node_clear_value(i);
            }
        }
    }

    // ---- Finalization plumbing ----

    /// Move unreachable (or, at close time, all) objects from `finobj`
    /// to the tail of `tobefnz`, in separation order.
    pub(crate) fn separate_tobefnz(&mut self, all: bool) {
        let mut prev: Option<GcRef> = None;
        let mut cur = self.finobj;
        while let Some(c) = cur {
            let next = self.header(c).next;
            if all || self.header(c).is_white() {
                match prev {
                    None => self.finobj = next,
                    Some(p) => self.header_mut(p).next = next,
                }
                self.header_mut(c).next = None;
                self.append_tobefnz(c);
            } else {
                prev = cur;
            }
            cur = next;
        }
    }

    fn append_tobefnz(&mut self, r: GcRef) {
        match self.tobefnz {
            None => self.tobefnz = Some(r),
            Some(head) => {
                let mut tail = head;
                while let Some(n) = self.header(tail).next {
                    tail = n;
                }
                self.header_mut(tail).next = Some(r);
            }
        }
    }

    pub(crate) fn has_pending_finalizers(&self) -> bool {
        self.tobefnz.is_some()
    }

    /// Detach the first object awaiting finalization and put it back on
    /// `allgc` as an ordinary object.
    pub(crate) fn pop_tobefnz(&mut self) -> Option<GcRef> {
        let r = self.tobefnz?;
        self.tobefnz = self.header(r).next;
        self.header_mut(r).next = self.allgc;
        self.allgc = Some(r);
        let sweeping = self.is_sweep_phase();
        let white = self.current_white;
        let hdr = self.header_mut(r);
        hdr.set_finalized(false);
        if sweeping {
            hdr.make_white(white);
        }
        Some(r)
    }

    /// Resurrect everything queued for finalization so finalizers see
    /// live objects.
    fn mark_tobefnz(&mut self) {
        let mut cur = self.tobefnz;
        while let Some(c) = cur {
            self.mark_object(c);
            cur = self.header(c).next;
        }
    }

    // ---- Sweeping ----

    pub(crate) fn enter_sweep(&mut self) {
        self.phase = GcPhase::SweepAllgc;
        self.sweep_list = SweepList::AllGc;
        self.sweep_prev = None;
        self.sweep_cur = self.allgc;
    }

    /// Sweep up to `SWEEP_MAX` objects; advances phase when the current
    /// list is exhausted. Returns the number of objects visited.
    pub(crate) fn sweep_step(&mut self) -> i64 {
        let ow = self.other_white();
        let white = self.current_white;
        let mut visited = 0i64;
        while visited < SWEEP_MAX as i64 {
            let cur = match self.sweep_cur {
                Some(c) => c,
                None => {
                    self.advance_sweep_list();
                    return visited;
                }
            };
            visited += 1;
            let next = self.header(cur).next;
            if self.header(cur).is_dead(ow) {
                match self.sweep_prev {
                    None => match self.sweep_list {
                        SweepList::AllGc => self.allgc = next,
                        SweepList::FinObj => self.finobj = next,
                        SweepList::ToBeFnz => self.tobefnz = next,
                    },
                    Some(p) => self.header_mut(p).next = next,
                }
                self.free_object(cur);
            } else {
                // Keep age and finalized bit; refresh the color.
                self.header_mut(cur).make_white(white);
                self.sweep_prev = Some(cur);
            }
            self.sweep_cur = next;
        }
        visited
    }

    fn advance_sweep_list(&mut self) {
        match self.sweep_list {
            SweepList::AllGc => {
                self.sweep_list = SweepList::FinObj;
                self.sweep_prev = None;
                self.sweep_cur = self.finobj;
                self.phase = GcPhase::SweepFinobj;
            }
            SweepList::FinObj => {
                self.sweep_list = SweepList::ToBeFnz;
                self.sweep_prev = None;
                self.sweep_cur = self.tobefnz;
                self.phase = GcPhase::SweepTobefnz;
            }
            SweepList::ToBeFnz => {
                self.phase = GcPhase::SweepEnd;
            }
        }
    }

    pub(crate) fn free_object(&mut self, r: GcRef) {
        self.mem.account_free(self.object_size(r));
        match r.kind {
            ObjectKind::Str => {
                let boxed = self.strings.free(r.index);
                if boxed.data.is_short() {
                    let hash = boxed.data.hash(self.seed);
                    self.strt.remove(hash, r.index);
                }
            }
            ObjectKind::Table => {
                self.tables.free(r.index);
            }
            ObjectKind::ScriptClosure => {
                self.lclosures.free(r.index);
            }
            ObjectKind::NativeClosure => {
                self.cclosures.free(r.index);
            }
            ObjectKind::NativeFn => {
                self.nativefns.free(r.index);
            }
            ObjectKind::Upvalue => {
                self.upvals.free(r.index);
            }
            ObjectKind::BoxedInt => {
                self.boxed_ints.free(r.index);
            }
            ObjectKind::Proto => {
                self.protos.free(r.index);
            }
            ObjectKind::Thread => {
                self.threads.free(r.index);
            }
            ObjectKind::Userdata => {
                self.userdata.free(r.index);
            }
        }
    }

    // ---- Cycle driver pieces shared with the state ----

    pub(crate) fn clear_gray_lists(&mut self) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
    }

    pub(crate) fn take_grayagain(&mut self) -> Vec<GcRef> {
        std::mem::take(&mut self.grayagain)
    }

    /// The atomic part of a cycle, given that the roots have just been
    /// re-marked by the caller. Returns the work done.
    pub(crate) fn atomic_body(&mut self) -> i64 {
        self.phase = GcPhase::Atomic;
        let mut work = self.propagate_all();

        // Revisit everything deferred during propagation.
        let ga = self.take_grayagain();
        for r in ga {
            // Entries are gray (or black TOUCHED2 survivors from a
            // generational cycle); re-traverse them.
            self.header_mut(r).set_gray();
            self.gray.push(r);
        }
        work += self.propagate_all();

        work += self.converge_ephemerons();
        // Clear values before finalization separates the dead.
        let weak = self.weak.clone();
        let allweak = self.allweak.clone();
        self.clear_by_values(&weak);
        self.clear_by_values(&allweak);

        self.separate_tobefnz(false);
        self.mark_tobefnz();
        work += self.propagate_all();
        work += self.converge_ephemerons();

        // Dead keys: ephemerons that never converged plus all-weak pairs.
        let eph = self.ephemeron.clone();
        let allweak = self.allweak.clone();
        self.clear_by_keys(&eph);
        self.clear_by_keys(&allweak);

        // Resurrection may have revived some values; clear once more.
        let weak = self.weak.clone();
        let allweak = self.allweak.clone();
        self.clear_by_values(&weak);
        self.clear_by_values(&allweak);

        self.current_white ^= WHITE_BITS;
        work.max(1)
    }

    // ---- Generational helpers ----

    /// Age OLD1 objects in [from, limit) to OLD, re-marking black ones so
    /// their young children survive the coming minor sweep.
    fn mark_old(&mut self, from: Option<GcRef>, limit: Option<GcRef>) {
        let mut cur = from;
        while cur != limit {
            let c = cur.expect("limit not on list");
            if self.header(c).age() == AGE_OLD1 {
                debug_assert!(!self.header(c).is_white());
                self.header_mut(c).set_age(AGE_OLD);
                if self.header(c).is_black() {
                    self.header_mut(c).set_gray();
                    self.gray.push(c);
                }
            }
            cur = self.header(c).next;
        }
    }

    /// Generational sweep of [position, limit): frees dead young
    /// objects, ages survivors, and whitens NEW survivors. `position` is
    /// the predecessor of the segment (None = list head); returns the
    /// predecessor of `limit`.
    fn sweep_gen(
        &mut self,
        list: SweepList,
        mut position: Option<GcRef>,
        limit: Option<GcRef>,
    ) -> Option<GcRef> {
        const NEXT_AGE: [u8; 7] = [
            AGE_SURVIVAL, // from NEW
            AGE_OLD1,     // from SURVIVAL
            AGE_OLD1,     // from OLD0
            AGE_OLD,      // from OLD1
            AGE_OLD,      // from OLD (unchanged)
            AGE_TOUCHED1, // from TOUCHED1 (unchanged; grayagain handles it)
            AGE_TOUCHED2, // from TOUCHED2 (unchanged)
        ];
        let white = self.current_white;
        loop {
            let cur = match position {
                None => match list {
                    SweepList::AllGc => self.allgc,
                    SweepList::FinObj => self.finobj,
                    SweepList::ToBeFnz => self.tobefnz,
                },
                Some(p) => self.header(p).next,
            };
            let c = match cur {
                Some(c) if cur != limit => c,
                _ => return position,
            };
            if self.header(c).is_white() {
                debug_assert!(!self.header(c).is_old() && self.is_dead(c));
                let next = self.header(c).next;
                match position {
                    None => match list {
                        SweepList::AllGc => self.allgc = next,
                        SweepList::FinObj => self.finobj = next,
                        SweepList::ToBeFnz => self.tobefnz = next,
                    },
                    Some(p) => self.header_mut(p).next = next,
                }
                if self.firstold1 == Some(c) {
                    self.firstold1 = next;
                }
                self.free_object(c);
            } else {
                let age = self.header(c).age();
                if age == AGE_NEW {
                    // Survivors of the nursery go back to white.
                    let hdr = self.header_mut(c);
                    hdr.make_white(white);
                    hdr.set_age(AGE_SURVIVAL);
                } else {
                    self.header_mut(c).set_age(NEXT_AGE[age as usize]);
                    if self.header(c).age() == AGE_OLD1 && self.firstold1.is_none() {
                        self.firstold1 = Some(c);
                    }
                }
                position = cur;
            }
        }
    }

    fn next_of(&self, position: Option<GcRef>, list: SweepList) -> Option<GcRef> {
        match position {
            None => match list {
                SweepList::AllGc => self.allgc,
                SweepList::FinObj => self.finobj,
                SweepList::ToBeFnz => self.tobefnz,
            },
            Some(p) => self.header(p).next,
        }
    }

    /// After a minor cycle, fix the gray lists: touched-once objects stay
    /// listed for the next cycle, threads stay gray, everything else
    /// leaves the lists black.
    fn correct_gray_lists(&mut self) {
        let mut pending: Vec<GcRef> = Vec::new();
        pending.append(&mut self.grayagain);
        pending.append(&mut self.weak);
        pending.append(&mut self.allweak);
        pending.append(&mut self.ephemeron);
        let mut keep: Vec<GcRef> = Vec::new();
        for r in pending {
            let hdr = self.header(r);
            if hdr.is_white() {
                continue; // dead; sweep already handled it
            }
            let age = hdr.age();
            if age == AGE_TOUCHED1 {
                let hdr = self.header_mut(r);
                hdr.set_black();
                hdr.set_age(AGE_TOUCHED2);
                keep.push(r); // stays listed for the next barrier
            } else if r.kind == ObjectKind::Thread {
                self.header_mut(r).set_gray();
                keep.push(r);
            } else {
                if age == AGE_TOUCHED2 {
                    self.header_mut(r).set_age(AGE_OLD);
                }
                self.header_mut(r).set_black();
            }
        }
        self.grayagain = keep;
    }

    /// Minor collection: mark through young objects, then sweep the
    /// young prefixes of the lists, aging survivors.
    pub(crate) fn young_collection_sweep(&mut self) {
        self.phase = GcPhase::SweepAllgc;
        let psurvival = self.sweep_gen(SweepList::AllGc, None, self.survival);
        self.sweep_gen(SweepList::AllGc, psurvival, self.old1);
        self.reallyold = self.old1;
        self.old1 = self.next_of(psurvival, SweepList::AllGc);
        self.survival = self.allgc;

        let psurvival = self.sweep_gen(SweepList::FinObj, None, self.finobjsur);
        self.sweep_gen(SweepList::FinObj, psurvival, self.finobjold1);
        self.finobjrold = self.finobjold1;
        self.finobjold1 = self.next_of(psurvival, SweepList::FinObj);
        self.finobjsur = self.finobj;

        self.sweep_gen(SweepList::ToBeFnz, None, None);

        self.correct_gray_lists();
        self.phase = GcPhase::Propagate; // generational resting state
    }

    pub(crate) fn young_mark_old_regions(&mut self) {
        if self.firstold1.is_some() {
            self.mark_old(self.firstold1, self.reallyold);
            self.firstold1 = None;
        }
        self.mark_old(self.finobj, self.finobjrold);
        self.mark_old(self.tobefnz, None);
    }

    /// Sweep a whole list making every survivor OLD (entering
    /// generational mode after a full collection).
    fn sweep_to_old(&mut self, list: SweepList) {
        let mut position: Option<GcRef> = None;
        loop {
            let cur = self.next_of(position, list);
            let c = match cur {
                Some(c) => c,
                None => return,
            };
            if self.header(c).is_white() {
                let next = self.header(c).next;
                match position {
                    None => match list {
                        SweepList::AllGc => self.allgc = next,
                        SweepList::FinObj => self.finobj = next,
                        SweepList::ToBeFnz => self.tobefnz = next,
                    },
                    Some(p) => self.header_mut(p).next = next,
                }
                self.free_object(c);
            } else {
                self.header_mut(c).set_age(AGE_OLD);
                if c.kind == ObjectKind::Thread {
                    self.header_mut(c).set_gray();
                    self.grayagain.push(c);
                } else {
                    self.header_mut(c).set_black();
                }
                position = cur;
            }
        }
    }

    /// Finish entering generational mode right after an atomic step.
    pub(crate) fn atomic_to_gen(&mut self) {
        self.clear_gray_lists();
        self.sweep_to_old(SweepList::AllGc);
        self.reallyold = self.allgc;
        self.old1 = self.allgc;
        self.survival = self.allgc;
        self.firstold1 = None;
        self.sweep_to_old(SweepList::FinObj);
        self.finobjrold = self.finobj;
        self.finobjold1 = self.finobj;
        self.finobjsur = self.finobj;
        self.sweep_to_old(SweepList::ToBeFnz);
        self.kind = GcKind::Generational;
        self.lastatomic = 0;
        self.estimate = self.mem.used();
        self.phase = GcPhase::Propagate;
    }

    /// Whiten every object and return to incremental mode at Pause.
    pub(crate) fn enter_incremental(&mut self) {
        let white = self.current_white;
        for list in [SweepList::AllGc, SweepList::FinObj, SweepList::ToBeFnz] {
            let mut cur = match list {
                SweepList::AllGc => self.allgc,
                SweepList::FinObj => self.finobj,
                SweepList::ToBeFnz => self.tobefnz,
            };
            while let Some(c) = cur {
                let hdr = self.header_mut(c);
                hdr.make_white(white);
                hdr.set_age(AGE_NEW);
                cur = hdr.next;
            }
        }
        self.survival = None;
        self.old1 = None;
        self.reallyold = None;
        self.firstold1 = None;
        self.finobjsur = None;
        self.finobjold1 = None;
        self.finobjrold = None;
        self.clear_gray_lists();
        self.kind = GcKind::Incremental;
        self.lastatomic = 0;
        self.phase = GcPhase::Pause;
    }

    // ---- Scheduling arithmetic ----

    pub(crate) fn set_pause(&mut self) {
        let estimate = (self.estimate as i64 / PAUSE_ADJ).max(1);
        let threshold = estimate.saturating_mul(self.pause as i64);
        let debt = (self.mem.used() as i64 - threshold).min(0);
        self.mem.set_debt(debt as isize);
        log::debug!(
            "gc cycle done: {} bytes live, next cycle at {} bytes",
            self.mem.used(),
            threshold
        );
    }

    pub(crate) fn set_minor_debt(&mut self) {
        let debt = -((self.mem.used() as i64 / 100) * self.gen_minor_mul as i64);
        self.mem.set_debt(debt as isize);
    }

    pub(crate) fn set_estimate(&mut self, v: usize) {
        self.estimate = v;
    }

    pub(crate) fn lastatomic(&self) -> i64 {
        self.lastatomic
    }

    pub(crate) fn set_lastatomic(&mut self, v: i64) {
        self.lastatomic = v;
    }

    pub(crate) fn step_budget(&self) -> (i64, i64) {
        let stepmul = (self.step_mul as i64) | 1;
        let debt = (self.mem.debt() as i64 / WORK2MEM) * stepmul;
        let stepsize = if self.step_size_log2 < 40 {
            ((1i64 << self.step_size_log2) / WORK2MEM) * stepmul
        } else {
            i64::MAX / 2
        };
        (debt, stepsize)
    }

    pub(crate) fn convert_work_to_debt(&mut self, debt: i64) {
        let stepmul = (self.step_mul as i64) | 1;
        let bytes = (debt / stepmul) * WORK2MEM;
        self.mem.set_debt(bytes as isize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_colors() {
        let mut h = GcHeader::new(WHITE0);
        assert!(h.is_white());
        assert!(!h.is_black());
        assert!(!h.is_gray());
        h.set_gray();
        assert!(h.is_gray());
        h.set_black();
        assert!(h.is_black());
        assert!(!h.is_white());
        h.make_white(WHITE1);
        assert!(h.is_white());
        assert!(h.is_dead(WHITE1));
        assert!(!h.is_dead(WHITE0));
    }

    #[test]
    fn test_header_age_independent_of_color() {
        let mut h = GcHeader::new(WHITE0 | AGE_NEW);
        h.set_age(AGE_TOUCHED1);
        assert_eq!(h.age(), AGE_TOUCHED1);
        h.set_black();
        assert_eq!(h.age(), AGE_TOUCHED1);
        h.make_white(WHITE1);
        assert_eq!(h.age(), AGE_TOUCHED1);
        assert!(h.is_old());
    }

    #[test]
    fn test_arena_reuse() {
        let mut a: Arena<i64> = Arena::new();
        let i0 = a.alloc(10, WHITE0);
        let i1 = a.alloc(20, WHITE0);
        assert_eq!(a.get(i0).data, 10);
        assert_eq!(a.live_count(), 2);
        a.free(i0);
        assert_eq!(a.live_count(), 1);
        let i2 = a.alloc(30, WHITE0);
        assert_eq!(i2, i0, "freed slot is reused");
        assert_eq!(a.get(i2).data, 30);
        assert_eq!(a.get(i1).data, 20);
    }

    #[test]
    #[should_panic(expected = "object was freed")]
    fn test_arena_use_after_free_panics() {
        let mut a: Arena<i64> = Arena::new();
        let i = a.alloc(1, WHITE0);
        a.free(i);
        a.get(i);
    }

    #[test]
    fn test_intern_identity_and_idempotence() {
        let mut heap = GcHeap::new(7);
        let used = heap.mem.used();
        let a = heap.intern(b"hello").unwrap();
        let after_first = heap.mem.used();
        let b = heap.intern(b"hello").unwrap();
        assert_eq!(a, b, "equal short strings share a handle");
        assert_eq!(
            heap.mem.used(),
            after_first,
            "re-interning allocates nothing"
        );
        assert!(after_first > used);
    }

    #[test]
    fn test_long_strings_not_interned() {
        let mut heap = GcHeap::new(7);
        let bytes = vec![b'a'; 100];
        let a = heap.new_string(&bytes).unwrap();
        let b = heap.new_string(&bytes).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.str_bytes(a), heap.str_bytes(b));
    }

    #[test]
    fn test_boxed_integer_roundtrip() {
        let mut heap = GcHeap::new(7);
        let small = heap.int_value(42).unwrap();
        assert_eq!(small.as_integer(), Some(42));
        let big = heap.int_value(i64::MAX).unwrap();
        assert!(big.is_collectable());
        assert_eq!(heap.as_integer(big), Some(i64::MAX));
    }

    #[test]
    fn test_new_objects_are_current_white() {
        let mut heap = GcHeap::new(7);
        let t = heap.new_table(0, 0).unwrap();
        assert!(heap.header(t).is_white());
        assert!(!heap.is_dead(t));
        assert_eq!(heap.header(t).age(), AGE_NEW);
    }

    #[test]
    fn test_fixed_objects_not_on_allgc() {
        let heap = GcHeap::new(7);
        // The metamethod names were interned and fixed by construction.
        let mut cur = heap.allgc;
        while let Some(c) = cur {
            for name in heap.tm_names {
                assert_ne!(c, name);
            }
            cur = heap.header(c).next;
        }
    }

    #[test]
    fn test_table_set_get_through_heap() {
        let mut heap = GcHeap::new(7);
        let t = heap.new_table(0, 0).unwrap();
        let k = heap.intern(b"key").unwrap();
        heap.table_set(t, TValue::from_obj(k), TValue::from_integer(5))
            .unwrap();
        assert_eq!(
            heap.table_get(t, TValue::from_obj(k)),
            TValue::from_integer(5)
        );
    }

    #[test]
    fn test_barrier_back_fires_once_for_bulk_inserts() {
        let mut heap = GcHeap::new(7);
        let t = heap.new_table(0, 0).unwrap();
        // Pretend mid-propagation: the table has already been scanned.
        heap.phase = GcPhase::Propagate;
        heap.header_mut(t).set_black();
        let children: Vec<GcRef> = (0..32).map(|_| heap.new_table(0, 0).unwrap()).collect();
        for (i, c) in children.iter().enumerate() {
            heap.table_set(t, TValue::from_integer(i as i64 + 1), TValue::from_obj(*c))
                .unwrap();
        }
        // One gray-again transition total, not one per insert.
        assert_eq!(heap.grayagain.len(), 1);
        assert_eq!(heap.grayagain[0], t);
        assert!(heap.header(t).is_gray());
    }

    #[test]
    fn test_forward_barrier_marks_child() {
        let mut heap = GcHeap::new(7);
        let t = heap.new_table(0, 0).unwrap();
        let mt = heap.new_table(0, 0).unwrap();
        heap.phase = GcPhase::Propagate;
        heap.header_mut(t).set_black();
        assert!(heap.header(mt).is_white());
        heap.set_table_metatable(t, Some(mt));
        // Metatable stores use the forward barrier: the child is marked,
        // the parent stays black.
        assert!(!heap.header(mt).is_white());
        assert!(heap.header(t).is_black());
    }

    #[test]
    fn test_find_upvalue_reuses_open_slot() {
        let mut heap = GcHeap::new(7);
        let th = heap.new_thread().unwrap();
        heap.threads
            .get_mut(th.index)
            .data
            .push(TValue::from_integer(9))
            .unwrap();
        let a = heap.find_upvalue(th, 0).unwrap();
        let b = heap.find_upvalue(th, 0).unwrap();
        assert_eq!(a, b);
        heap.close_upvalues(th, 0);
        assert!(!heap.upvals.get(a.index).data.is_open());
        match heap.upvals.get(a.index).data.state {
            UpvalState::Closed(v) => assert_eq!(v, TValue::from_integer(9)),
            _ => unreachable!(),
        }
        // A new capture at the same level creates a fresh upvalue.
        let c = heap.find_upvalue(th, 0).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_open_upvalue_list_sorted_descending() {
        let mut heap = GcHeap::new(7);
        let th = heap.new_thread().unwrap();
        for i in 0..5 {
            heap.threads
                .get_mut(th.index)
                .data
                .push(TValue::from_integer(i))
                .unwrap();
        }
        heap.find_upvalue(th, 1).unwrap();
        heap.find_upvalue(th, 3).unwrap();
        heap.find_upvalue(th, 2).unwrap();
        let levels: Vec<usize> = heap.threads.get(th.index).data.open_upvals.iter()
            .map(|uv| heap.upvals.get(uv.index).data.level().unwrap())
            .collect();
        assert_eq!(levels, vec![3, 2, 1]);
    }
}

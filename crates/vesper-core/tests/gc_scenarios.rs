//! End-to-end collector scenarios: weak tables, ephemerons,
//! finalization, generational aging, and root anchoring.

use std::sync::atomic::{AtomicUsize, Ordering};

use vesper_core::error::RuntimeError;
use vesper_core::gc::{GcKind, AGE_NEW, AGE_SURVIVAL};
use vesper_core::object::GcRef;
use vesper_core::state::GlobalState;
use vesper_core::value::TValue;

fn int(i: i64) -> TValue {
    TValue::from_integer(i)
}

fn obj(r: GcRef) -> TValue {
    TValue::from_obj(r)
}

/// Anchor a value in the registry under the given name.
fn anchor(state: &mut GlobalState, name: &str, v: TValue) {
    let key = state.new_string(name.as_bytes()).unwrap();
    state.table_set(state.registry(), obj(key), v).unwrap();
}

/// A metatable with the given `__mode` string.
fn weak_metatable(state: &mut GlobalState, mode: &str) -> GcRef {
    let mt = state.new_table(0, 1).unwrap();
    let key = state.new_string(b"__mode").unwrap();
    let val = state.new_string(mode.as_bytes()).unwrap();
    state.table_set(mt, obj(key), obj(val)).unwrap();
    mt
}

// ---- Weak values ----

#[test]
fn weak_value_entry_cleared_when_value_dies() {
    let mut state = GlobalState::new();
    state.heap.stop(); // keep the schedule out of the way during setup
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "v");
    state.heap.set_table_metatable(t, Some(mt));

    let doomed = state.new_string(b"nothing else holds me").unwrap();
    state.table_set(t, int(1), obj(doomed)).unwrap();
    let kept = state.new_string(b"the registry holds me").unwrap();
    anchor(&mut state, "kept", obj(kept));
    state.table_set(t, int(2), obj(kept)).unwrap();

    state.heap.restart();
    state.full_collection(false);

    assert!(state.table_get(t, int(1)).is_nil(), "dead value not cleared");
    assert_eq!(state.table_get(t, int(2)), obj(kept), "live value lost");
}

#[test]
fn strong_table_keeps_otherwise_dead_values() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let s = state.new_string(b"held only by the table").unwrap();
    state.table_set(t, int(1), obj(s)).unwrap();
    state.heap.restart();
    state.full_collection(false);
    assert_eq!(state.table_get(t, int(1)), obj(s));
    assert_eq!(state.heap.str_bytes(s), b"held only by the table");
}

// ---- Ephemerons ----

#[test]
fn ephemeron_entry_cleared_when_key_only_reachable_through_value() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "k");
    state.heap.set_table_metatable(t, Some(mt));

    // V holds K, and V is only reachable through t[K]: the pair is a
    // self-sustaining cycle that must be collected.
    let k = state.new_table(0, 0).unwrap();
    let v = state.new_table(0, 0).unwrap();
    state.table_set(v, int(1), obj(k)).unwrap();
    state.table_set(t, obj(k), obj(v)).unwrap();

    state.heap.restart();
    state.full_collection(false);

    assert_eq!(
        state.heap.table_next(t, TValue::nil()),
        Ok(None),
        "self-sustaining ephemeron pair must be cleared"
    );
}

#[test]
fn ephemeron_value_survives_while_key_reachable() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "k");
    state.heap.set_table_metatable(t, Some(mt));

    let k = state.new_table(0, 0).unwrap();
    anchor(&mut state, "k", obj(k));
    let v = state.new_table(0, 0).unwrap();
    state.table_set(t, obj(k), obj(v)).unwrap();

    state.heap.restart();
    state.full_collection(false);

    assert_eq!(state.table_get(t, obj(k)), obj(v));
}

#[test]
fn ephemeron_chain_converges() {
    // k2 is reachable only through the value of k1's entry, which is
    // reachable because k1 is anchored. Both entries must survive; a
    // single marking pass over the ephemeron table would miss k2.
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "k");
    state.heap.set_table_metatable(t, Some(mt));

    let k1 = state.new_table(0, 0).unwrap();
    anchor(&mut state, "k1", obj(k1));
    let k2 = state.new_table(0, 0).unwrap();
    let v1 = state.new_table(0, 0).unwrap();
    state.table_set(v1, int(1), obj(k2)).unwrap();
    let v2 = state.new_string(b"value of the second entry").unwrap();
    state.table_set(t, obj(k1), obj(v1)).unwrap();
    state.table_set(t, obj(k2), obj(v2)).unwrap();

    state.heap.restart();
    state.full_collection(false);

    assert_eq!(state.table_get(t, obj(k1)), obj(v1));
    assert_eq!(state.table_get(t, obj(k2)), obj(v2));
}

#[test]
fn all_weak_table_clears_both_sides() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "kv");
    state.heap.set_table_metatable(t, Some(mt));

    let k = state.new_table(0, 0).unwrap();
    let v = state.new_table(0, 0).unwrap();
    state.table_set(t, obj(k), obj(v)).unwrap();

    state.heap.restart();
    state.full_collection(false);
    assert_eq!(state.heap.table_next(t, TValue::nil()), Ok(None));
}

// ---- Finalization ----

static FINALIZER_RUNS: AtomicUsize = AtomicUsize::new(0);

fn counting_finalizer(
    _state: &mut GlobalState,
    args: &[TValue],
) -> Result<Vec<TValue>, RuntimeError> {
    assert!(args[0].is_table(), "finalizer sees the resurrected object");
    FINALIZER_RUNS.fetch_add(1, Ordering::SeqCst);
    Ok(Vec::new())
}

fn failing_finalizer(
    _state: &mut GlobalState,
    _args: &[TValue],
) -> Result<Vec<TValue>, RuntimeError> {
    Err(RuntimeError::Runtime("finalizer exploded".to_string()))
}

fn gc_metatable(
    state: &mut GlobalState,
    f: fn(&mut GlobalState, &[TValue]) -> Result<Vec<TValue>, RuntimeError>,
) -> GcRef {
    let mt = state.new_table(0, 1).unwrap();
    let key = state.new_string(b"__gc").unwrap();
    let fin = state.heap.new_native(f, "finalizer").unwrap();
    state.table_set(mt, obj(key), obj(fin)).unwrap();
    anchor(state, "__gc_mt", obj(mt));
    mt
}

#[test]
fn finalizer_runs_once_then_object_is_collected() {
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    let mut state = GlobalState::new();
    state.heap.stop();
    let mt = gc_metatable(&mut state, counting_finalizer);
    let victim = state.new_table(0, 0).unwrap();
    state.heap.set_table_metatable(victim, Some(mt));
    state.heap.restart();

    // First cycle: the victim is unreachable, so it is resurrected onto
    // the finalization queue and its finalizer runs.
    state.full_collection(false);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);

    // Second cycle: the victim is an ordinary dead object now; the
    // finalizer must not run again.
    state.full_collection(false);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
}

#[test]
fn reachable_object_is_not_finalized() {
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    let mut state = GlobalState::new();
    state.heap.stop();
    let mt = gc_metatable(&mut state, counting_finalizer);
    let survivor = state.new_table(0, 0).unwrap();
    state.heap.set_table_metatable(survivor, Some(mt));
    anchor(&mut state, "survivor", obj(survivor));
    state.heap.restart();
    state.full_collection(false);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 0);
}

#[test]
fn emergency_collection_defers_finalizers() {
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    let mut state = GlobalState::new();
    state.heap.stop();
    let mt = gc_metatable(&mut state, counting_finalizer);
    let victim = state.new_table(0, 0).unwrap();
    state.heap.set_table_metatable(victim, Some(mt));
    state.heap.restart();

    // An emergency collection cannot call back into script code, so
    // the finalizer stays queued.
    state.full_collection(true);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 0);

    // The next ordinary collection drains the queue.
    state.full_collection(false);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
}

#[test]
fn finalizer_error_becomes_warning() {
    static WARNINGS: AtomicUsize = AtomicUsize::new(0);
    fn count_warning(_msg: &str) {
        WARNINGS.fetch_add(1, Ordering::SeqCst);
    }
    let mut state = GlobalState::new();
    state.set_warnf(Some(count_warning));
    state.heap.stop();
    let mt = gc_metatable(&mut state, failing_finalizer);
    let victim = state.new_table(0, 0).unwrap();
    state.heap.set_table_metatable(victim, Some(mt));
    state.heap.restart();
    let before = WARNINGS.load(Ordering::SeqCst);
    state.full_collection(false);
    assert_eq!(WARNINGS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn close_runs_all_pending_finalizers() {
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    let mut state = GlobalState::new();
    state.heap.stop();
    let mt = gc_metatable(&mut state, counting_finalizer);
    // Still reachable, but close() finalizes everything regardless.
    let held = state.new_table(0, 0).unwrap();
    state.heap.set_table_metatable(held, Some(mt));
    anchor(&mut state, "held", obj(held));
    state.close();
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
}

// ---- Generational mode ----

#[test]
fn minor_collections_age_survivors_and_free_garbage() {
    let mut state = GlobalState::new();
    state.set_gc_mode(GcKind::Generational);

    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    assert_eq!(state.heap.header(t).age(), AGE_NEW);

    state.gc_step(); // minor collection
    assert_eq!(state.heap.header(t).age(), AGE_SURVIVAL);

    state.gc_step();
    state.gc_step();
    assert!(
        state.heap.header(t).is_old(),
        "three cycles promote a survivor to an old age"
    );

    // Young garbage disappears on the next minor cycle.
    let settled = state.heap.mem.used();
    for _ in 0..50 {
        state.heap.new_table(0, 0).unwrap();
    }
    assert!(state.heap.mem.used() > settled);
    state.gc_step();
    assert_eq!(state.heap.mem.used(), settled);
}

#[test]
fn old_table_keeps_young_store_via_backward_barrier() {
    let mut state = GlobalState::new();
    state.set_gc_mode(GcKind::Generational);
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    for _ in 0..3 {
        state.gc_step();
    }
    assert!(state.heap.header(t).is_old());

    // Store a brand-new object into the old (black) table. Without the
    // backward barrier the minor cycle would never see it.
    let young = state.new_string(b"young value in an old table").unwrap();
    state.table_set(t, int(1), obj(young)).unwrap();
    state.gc_step();
    state.gc_step();

    let got = state.table_get(t, int(1));
    assert_eq!(got, obj(young));
    assert_eq!(
        state.heap.str_bytes(got.as_gc().unwrap()),
        b"young value in an old table"
    );
}

#[test]
fn generational_weak_values_still_clear_on_major() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    let mt = weak_metatable(&mut state, "v");
    state.heap.set_table_metatable(t, Some(mt));
    let doomed = state.new_string(b"doomed under gen mode").unwrap();
    state.table_set(t, int(1), obj(doomed)).unwrap();
    state.heap.restart();
    state.set_gc_mode(GcKind::Generational);
    // Entering generational mode runs a full cycle.
    assert!(state.table_get(t, int(1)).is_nil());
}

// ---- Roots and anchoring ----

#[test]
fn pushed_root_pins_object_until_popped() {
    let mut state = GlobalState::new();
    let scratch = state.new_table(0, 0).unwrap();
    let name = state.new_string(b"scanner-scratch").unwrap();
    state
        .table_set(scratch, obj(name), TValue::from_bool(true))
        .unwrap();
    state.push_root(scratch);

    state.full_collection(false);
    // Pinned: both the table and its key survive.
    assert_eq!(
        state.table_get(scratch, obj(name)),
        TValue::from_bool(true)
    );
    let pinned_usage = state.heap.mem.used();

    state.pop_root(scratch);
    state.full_collection(false);
    assert!(
        state.heap.mem.used() < pinned_usage,
        "released anchor must free the table"
    );
}

// ---- Accounting invariants ----

#[test]
fn repeated_collections_leave_usage_fixed() {
    let mut state = GlobalState::new();
    let t = state.new_table(0, 0).unwrap();
    anchor(&mut state, "t", obj(t));
    for i in 0..64 {
        state.table_set(t, int(i), int(i * 2)).unwrap();
    }
    state.full_collection(false);
    let settled = state.heap.mem.used();
    for _ in 0..3 {
        state.full_collection(false);
        assert_eq!(state.heap.mem.used(), settled);
    }
}

#[test]
fn interning_twice_does_not_grow_the_heap() {
    let mut state = GlobalState::new();
    state.heap.stop();
    let a = state.new_string(b"idempotent").unwrap();
    let used = state.heap.mem.used();
    let b = state.new_string(b"idempotent").unwrap();
    assert_eq!(a, b);
    assert_eq!(state.heap.mem.used(), used);
}

//! Heap handles, object kinds, and full userdata.

use crate::value::TValue;

/// The kind of a collectable object. The discriminant doubles as the
/// sub-tag stored in a GC-tagged value payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Table = 0,
    ScriptClosure = 1,
    NativeClosure = 2,
    NativeFn = 3,
    Upvalue = 4,
    BoxedInt = 5,
    Str = 6,
    Proto = 7,
    Thread = 8,
    Userdata = 9,
}

impl ObjectKind {
    /// Convert from a sub-tag value.
    pub fn from_sub_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(ObjectKind::Table),
            1 => Some(ObjectKind::ScriptClosure),
            2 => Some(ObjectKind::NativeClosure),
            3 => Some(ObjectKind::NativeFn),
            4 => Some(ObjectKind::Upvalue),
            5 => Some(ObjectKind::BoxedInt),
            6 => Some(ObjectKind::Str),
            7 => Some(ObjectKind::Proto),
            8 => Some(ObjectKind::Thread),
            9 => Some(ObjectKind::Userdata),
            _ => None,
        }
    }

    pub fn sub_tag(self) -> u64 {
        self as u64
    }
}

/// A typed handle to an object in the GC heap.
///
/// Handles are plain (kind, arena index) pairs. A freed slot may be
/// reused, so holding a handle across a collection without keeping the
/// object reachable is a caller bug, exactly as a raw pointer would be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub kind: ObjectKind,
    pub index: u32,
}

impl GcRef {
    pub fn new(kind: ObjectKind, index: u32) -> Self {
        GcRef { kind, index }
    }
}

/// Full userdata: an opaque byte buffer with user values and an
/// optional metatable.
#[derive(Debug)]
pub struct Udata {
    pub data: Vec<u8>,
    pub user_values: Vec<TValue>,
    pub metatable: Option<GcRef>,
}

impl Udata {
    pub fn new(size: usize, nuvalue: usize) -> Self {
        Udata {
            data: vec![0; size],
            user_values: vec![TValue::nil(); nuvalue],
            metatable: None,
        }
    }
}

/// The script-visible type name for a value.
pub fn type_name(val: TValue) -> &'static str {
    if val.is_nil() {
        "nil"
    } else if val.is_bool() {
        "boolean"
    } else if val.is_number() {
        "number"
    } else if let Some(r) = val.as_gc() {
        match r.kind {
            ObjectKind::Table => "table",
            ObjectKind::ScriptClosure | ObjectKind::NativeClosure | ObjectKind::NativeFn => "function",
            ObjectKind::Str => "string",
            ObjectKind::BoxedInt => "number",
            ObjectKind::Thread => "thread",
            ObjectKind::Userdata => "userdata",
            ObjectKind::Upvalue => "upvalue",
            ObjectKind::Proto => "proto",
        }
    } else if val.is_light_userdata() {
        "userdata"
    } else {
        "no value"
    }
}

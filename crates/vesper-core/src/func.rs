//! Closures, native functions, and upvalues.

use crate::error::RuntimeError;
use crate::object::GcRef;
use crate::value::TValue;

/// Signature of a native function callable from script code. The state
/// argument is the owning global state; `args` are the call arguments.
pub type NativeFnPtr =
    fn(state: &mut crate::state::GlobalState, args: &[TValue]) -> Result<Vec<TValue>, RuntimeError>;

/// A script closure: a prototype plus its captured upvalues.
#[derive(Debug)]
pub struct LClosure {
    pub proto: GcRef,
    pub upvals: Vec<GcRef>,
}

impl LClosure {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LClosure>() + self.upvals.capacity() * std::mem::size_of::<GcRef>()
    }
}

/// A native closure: a function pointer with captured values.
pub struct CClosure {
    pub func: NativeFnPtr,
    pub name: &'static str,
    pub upvalues: Vec<TValue>,
}

impl CClosure {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<CClosure>() + self.upvalues.capacity() * std::mem::size_of::<TValue>()
    }
}

impl std::fmt::Debug for CClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cclosure({}, {} upvalues)", self.name, self.upvalues.len())
    }
}

/// A bare native function, with no captured state.
pub struct NativeFn {
    pub func: NativeFnPtr,
    pub name: &'static str,
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native({})", self.name)
    }
}

/// Where an upvalue's value lives.
///
/// Open upvalues reference a live stack slot of their owning thread and
/// are linked into that thread's open list, sorted by stack level.
/// Closing copies the slot into the upvalue; the transition is one-way.
#[derive(Debug)]
pub enum UpvalState {
    Open { thread: GcRef, level: usize },
    Closed(TValue),
}

#[derive(Debug)]
pub struct UpVal {
    pub state: UpvalState,
    /// Set when the captured variable is to-be-closed.
    pub tbc: bool,
}

impl UpVal {
    pub fn new_open(thread: GcRef, level: usize) -> Self {
        UpVal {
            state: UpvalState::Open { thread, level },
            tbc: false,
        }
    }

    pub fn new_closed(value: TValue) -> Self {
        UpVal {
            state: UpvalState::Closed(value),
            tbc: false,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalState::Open { .. })
    }

    /// Stack level of an open upvalue.
    pub fn level(&self) -> Option<usize> {
        match self.state {
            UpvalState::Open { level, .. } => Some(level),
            UpvalState::Closed(_) => None,
        }
    }

    /// Close over `value`; must still be open.
    pub fn close(&mut self, value: TValue) {
        debug_assert!(self.is_open(), "closing an already-closed upvalue");
        self.state = UpvalState::Closed(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn test_upvalue_close_is_one_way() {
        let th = GcRef::new(ObjectKind::Thread, 0);
        let mut uv = UpVal::new_open(th, 5);
        assert!(uv.is_open());
        assert_eq!(uv.level(), Some(5));
        uv.close(TValue::from_integer(7));
        assert!(!uv.is_open());
        assert_eq!(uv.level(), None);
        match uv.state {
            UpvalState::Closed(v) => assert_eq!(v, TValue::from_integer(7)),
            _ => panic!("expected closed"),
        }
    }

    #[test]
    fn test_closed_upvalue_starts_closed() {
        let uv = UpVal::new_closed(TValue::nil());
        assert!(!uv.is_open());
    }
}

//! Tagged machine words of the virtual value stack.
//!
//! The wire discipline distinguishes unboxed integers (low bit set) from
//! boxed heap pointers. With the heap owned by this crate the distinction
//! becomes a plain enum; the collector tells references apart by variant
//! instead of by bit twiddling.

use std::fmt::{Display, Formatter};

/// Handle to a live heap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

/// A resolved storage location, as produced by `LDA`.
///
/// `Stack` covers locals, arguments and globals (the globals area lives
/// inside the stack buffer so the collector scans it with the stack).
/// `Capture` points into a closure's capture vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Stack(usize),
    Capture(ObjRef, usize),
}

/// One slot of the operand stack.
///
/// `Int` is the unboxed integer of the bytecode format, `Ref` a boxed
/// pointer. `Slot` only ever appears between an `LDA` and the `STA` that
/// consumes it. `Meta` holds frame bookkeeping (saved frame pointer,
/// counts, return addresses) and is never observable by the interpreted
/// program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    Int(i32),
    Ref(ObjRef),
    Slot(SlotRef),
    Meta(usize),
}

impl Word {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Word::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Word::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_meta(&self) -> Option<usize> {
        match self {
            Word::Meta(v) => Some(*v),
            _ => None,
        }
    }

    /// Coarse kind name for diagnostics; the heap refines `Ref` into
    /// string/array/sexp/closure.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Word::Int(_) => "integer",
            Word::Ref(_) => "boxed value",
            Word::Slot(_) => "location reference",
            Word::Meta(_) => "frame metadata",
        }
    }
}

impl Default for Word {
    fn default() -> Self {
        Word::Int(0)
    }
}

impl Display for Word {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Word::Int(v) => write!(f, "Int({})", v),
            Word::Ref(r) => write!(f, "Ref(#{})", r.0),
            Word::Slot(SlotRef::Stack(i)) => write!(f, "Slot(stack:{})", i),
            Word::Slot(SlotRef::Capture(r, i)) => write!(f, "Slot(#{}[{}])", r.0, i),
            Word::Meta(v) => write!(f, "Meta({})", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let i = Word::Int(-7);
        let m = Word::Meta(42);

        assert_eq!(i.as_int(), Some(-7));
        assert_eq!(i.as_obj(), None);
        assert_eq!(m.as_meta(), Some(42));
        assert_eq!(m.as_int(), None);
        assert_eq!(Word::default(), Word::Int(0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Word::Int(5).to_string(), "Int(5)");
        assert_eq!(Word::Ref(ObjRef(3)).to_string(), "Ref(#3)");
        assert_eq!(Word::Meta(1).to_string(), "Meta(1)");
    }
}

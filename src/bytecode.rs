//! Descriptor of Lama bytecode

use std::fmt::{Display, Formatter};

/// Binary operator, encoded in the low nibble of a `BINOP` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    ADD = 0x1,  // +
    SUB = 0x2,  // -
    MUL = 0x3,  // *
    DIV = 0x4,  // /
    MOD = 0x5,  // %
    LT = 0x6,   // <
    LEQ = 0x7,  // <=
    GT = 0x8,   // >
    GEQ = 0x9,  // >=
    EQ = 0xa,   // ==
    NEQ = 0xb,  // !=
    AND = 0xc,  // &&, tests if both integer operands are non-zero
    OR = 0xd,   // !!, tests if either of the operands is non-zero
}

impl TryFrom<u8> for Op {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x1 => Op::ADD,
            0x2 => Op::SUB,
            0x3 => Op::MUL,
            0x4 => Op::DIV,
            0x5 => Op::MOD,
            0x6 => Op::LT,
            0x7 => Op::LEQ,
            0x8 => Op::GT,
            0x9 => Op::GEQ,
            0xa => Op::EQ,
            0xb => Op::NEQ,
            0xc => Op::AND,
            0xd => Op::OR,
            _ => return Err(()),
        })
    }
}

/// Where a `LD`/`LDA`/`ST` (or a closure capture descriptor) points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRel {
    Global = 0x0,
    Local = 0x1,
    Arg = 0x2,     // Function argument
    Capture = 0x3, // Captured by closure
}

impl TryFrom<u8> for ValueRel {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => ValueRel::Global,
            0x1 => ValueRel::Local,
            0x2 => ValueRel::Arg,
            0x3 => ValueRel::Capture,
            _ => return Err(()),
        })
    }
}

impl Display for ValueRel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueRel::Global => write!(f, "global"),
            ValueRel::Local => write!(f, "local"),
            ValueRel::Arg => write!(f, "argument"),
            ValueRel::Capture => write!(f, "capture"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareJumpKind {
    ISZERO,    // jump if operand is zero
    ISNONZERO, // jump if operand is non-zero
}

/// Pattern test, encoded in the low nibble of a `PATT` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PattKind {
    BothAreStr = 0x0, // `PATT =str`
    IsStr = 0x1,      // `PATT #string`
    IsArray = 0x2,    // `PATT #array`
    IsSExp = 0x3,     // `PATT #sexp`
    IsRef = 0x4,      // `PATT #ref`
    IsVal = 0x5,      // `PATT #val`
    IsLambda = 0x6,   // `PATT #fun`
}

impl TryFrom<u8> for PattKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => PattKind::BothAreStr,
            0x1 => PattKind::IsStr,
            0x2 => PattKind::IsArray,
            0x3 => PattKind::IsSExp,
            0x4 => PattKind::IsRef,
            0x5 => PattKind::IsVal,
            0x6 => PattKind::IsLambda,
            _ => return Err(()),
        })
    }
}

/// Opcodes whose full byte is the instruction; their immediate operands
/// are read by the engine after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `CONST k` — push the boxed immediate.
    Const = 0x10,
    /// `STRING s` — allocate the string at offset `s` of the string table.
    String = 0x11,
    /// `SEXP s n` — allocate an s-expression with tag `s` and `n` members
    /// taken from the stack.
    Sexp = 0x12,
    /// Indirect store through a variable reference. Deprecated.
    Sti = 0x13,
    /// Indirect store to a variable reference or into an aggregate.
    Sta = 0x14,
    /// `JMP l` — unconditional jump to code offset `l`.
    Jmp = 0x15,
    /// Marks the end of a procedure body; returns the top value to the
    /// caller, or halts when the outermost frame returns.
    End = 0x16,
    /// Reserved; the compiler never emits it.
    Ret = 0x17,
    /// Removes the top value from the stack.
    Drop = 0x18,
    /// Duplicates the top value.
    Dup = 0x19,
    /// Exchanges the top two values.
    Swap = 0x1a,
    /// Look up an element of an array/string/sexp by index.
    Elem = 0x1b,
    /// `CJMPz l` — pop an integer, jump if zero.
    CjmpZ = 0x50,
    /// `CJMPnz l` — pop an integer, jump if non-zero.
    CjmpNz = 0x51,
    /// `BEGIN a n` — establish a call frame with `a` declared arguments
    /// and `n` locals initialized to boxed 0.
    Begin = 0x52,
    /// `CBEGIN a n` — as `BEGIN`, for closure entry points.
    Cbegin = 0x53,
    /// `CLOSURE l m (rel, idx) x m` — allocate a closure over entry `l`
    /// capturing `m` locations.
    Closure = 0x54,
    /// `CALLC n` — call the closure sitting under the top `n` arguments.
    Callc = 0x55,
    /// `CALL l n` — call the procedure at offset `l` with `n` arguments.
    Call = 0x56,
    /// `TAG s n` — test the top value for an s-expression with tag `s`
    /// and `n` members.
    Tag = 0x57,
    /// `ARRAY n` — test the top value for an array of length `n`.
    Array = 0x58,
    /// `FAIL ln col` — pattern-match failure at the given source position.
    Fail = 0x59,
    /// `LINE ln` — source line marker, diagnostics only.
    Line = 0x5a,
    /// `CALL Lread`
    CallRead = 0x70,
    /// `CALL Lwrite`
    CallWrite = 0x71,
    /// `CALL Llength`
    CallLength = 0x72,
    /// `CALL Lstring`
    CallString = 0x73,
    /// `CALL Barray n`
    CallArray = 0x74,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x10 => Opcode::Const,
            0x11 => Opcode::String,
            0x12 => Opcode::Sexp,
            0x13 => Opcode::Sti,
            0x14 => Opcode::Sta,
            0x15 => Opcode::Jmp,
            0x16 => Opcode::End,
            0x17 => Opcode::Ret,
            0x18 => Opcode::Drop,
            0x19 => Opcode::Dup,
            0x1a => Opcode::Swap,
            0x1b => Opcode::Elem,
            0x50 => Opcode::CjmpZ,
            0x51 => Opcode::CjmpNz,
            0x52 => Opcode::Begin,
            0x53 => Opcode::Cbegin,
            0x54 => Opcode::Closure,
            0x55 => Opcode::Callc,
            0x56 => Opcode::Call,
            0x57 => Opcode::Tag,
            0x58 => Opcode::Array,
            0x59 => Opcode::Fail,
            0x5a => Opcode::Line,
            0x70 => Opcode::CallRead,
            0x71 => Opcode::CallWrite,
            0x72 => Opcode::CallLength,
            0x73 => Opcode::CallString,
            0x74 => Opcode::CallArray,
            _ => return Err(()),
        })
    }
}

//! VM Interpreter

use crate::bytecode::{CompareJumpKind, Op, Opcode, PattKind, ValueRel};
use crate::bytefile::{Bytefile, BytefileError};
use crate::decoder::{self, DecoderError, Family};
use crate::frame::{self, FrameMetadata, RETURN_HALT};
use crate::runtime::{self, Heap, Io, Obj, Tag};
use crate::value::{ObjRef, SlotRef, Word};

/// Capacity of the virtual value stack, in words.
pub const VSTACK_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum InterpreterError {
    Bytefile(BytefileError),
    CodeOob {
        requested: usize,
        code_size: usize,
    },
    InvalidOpcode(u8),
    Unsupported(&'static str),
    StackOverflow,
    IllegalPop,
    TypeMismatch(String),
    NotClosure(String),
    DivisionByZero {
        a: i32,
    },
    RemainderByZero {
        a: i32,
    },
    IndexOob {
        index: i32,
        length: usize,
    },
    NegativeIndex(i32),
    JumpOob {
        offset: usize,
        code_size: usize,
    },
    GlobalOob {
        index: usize,
        size: usize,
    },
    LocalOob {
        index: usize,
        count: usize,
    },
    ArgOob {
        index: usize,
        count: usize,
    },
    CaptureOob {
        index: usize,
        count: usize,
    },
    InvalidValueRel(u8),
    NegativeCount {
        what: &'static str,
        n: i32,
    },
    BadTagChar(char),
    CorruptFrame,
    InvalidObjectPointer,
    Io(String),
    Fail {
        line: i32,
        column: i32,
        obj: String,
    },
}

impl From<BytefileError> for InterpreterError {
    fn from(err: BytefileError) -> Self {
        InterpreterError::Bytefile(err)
    }
}

impl From<DecoderError> for InterpreterError {
    fn from(err: DecoderError) -> Self {
        match err {
            DecoderError::InvalidOpcode(byte) => InterpreterError::InvalidOpcode(byte),
        }
    }
}

impl From<std::io::Error> for InterpreterError {
    fn from(err: std::io::Error) -> Self {
        InterpreterError::Io(err.to_string())
    }
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpreterError::Bytefile(err) => write!(f, "{}", err),
            InterpreterError::CodeOob {
                requested,
                code_size,
            } => write!(
                f,
                "Requested value is out of bounds: ip={}, code size {}",
                requested, code_size
            ),
            InterpreterError::InvalidOpcode(opcode) => write!(f, "Invalid opcode: {:#x}", opcode),
            InterpreterError::Unsupported(name) => {
                write!(f, "{} bytecode is not supported", name)
            }
            InterpreterError::StackOverflow => write!(f, "Virtual stack limit exceeded"),
            InterpreterError::IllegalPop => write!(f, "Illegal pop"),
            InterpreterError::TypeMismatch(what) => write!(f, "Type mismatch: {}", what),
            InterpreterError::NotClosure(got) => {
                write!(f, "Expected a closure, got {}", got)
            }
            InterpreterError::DivisionByZero { a } => {
                write!(f, "Division by zero: a={}, b=0", a)
            }
            InterpreterError::RemainderByZero { a } => {
                write!(f, "Remainder by zero: a={}, b=0", a)
            }
            InterpreterError::IndexOob { index, length } => {
                write!(f, "Index {} out of bounds (length {})", index, length)
            }
            InterpreterError::NegativeIndex(index) => {
                write!(f, "Index cannot be negative: {}", index)
            }
            InterpreterError::JumpOob { offset, code_size } => write!(
                f,
                "Jump address {} points outside of code section (size {})",
                offset, code_size
            ),
            InterpreterError::GlobalOob { index, size } => {
                write!(f, "Global index {} out of bounds (size {})", index, size)
            }
            InterpreterError::LocalOob { index, count } => write!(
                f,
                "Local index {} out of bounds (current frame has {} locals)",
                index, count
            ),
            InterpreterError::ArgOob { index, count } => write!(
                f,
                "Argument index {} out of bounds (current call has {} args)",
                index, count
            ),
            InterpreterError::CaptureOob { index, count } => write!(
                f,
                "Capture index {} out of bounds (captured variables: {})",
                index, count
            ),
            InterpreterError::InvalidValueRel(kind) => {
                write!(f, "Invalid location type {}", kind)
            }
            InterpreterError::NegativeCount { what, n } => {
                write!(f, "Frame has negative number of {}: {}", what, n)
            }
            InterpreterError::BadTagChar(c) => {
                write!(f, "Tag hash: character not allowed: {:?}", c)
            }
            InterpreterError::CorruptFrame => write!(f, "Frame metadata corrupted"),
            InterpreterError::InvalidObjectPointer => write!(f, "Invalid object pointer"),
            InterpreterError::Io(err) => write!(f, "I/O error: {}", err),
            InterpreterError::Fail { line, column, obj } => {
                write!(
                    f,
                    "Failed matching at line {} column {}: {}",
                    line, column, obj
                )
            }
        }
    }
}

impl std::error::Error for InterpreterError {}

/// An interpreter error pinned to the code offset of the instruction
/// that raised it.
#[derive(Debug)]
pub struct Fault {
    pub offset: usize,
    pub kind: InterpreterError,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runtime error at offset {} ({:#x}): {}",
            self.offset, self.offset, self.kind
        )
    }
}

impl std::error::Error for Fault {}

pub struct Interpreter {
    /// The value stack; grows downward, `stack[top]` is the last push.
    stack: Vec<Word>,
    top: usize,
    frame_pointer: usize,
    current_frame_locals: usize,
    /// Index of the first global; the globals sit between the stack
    /// bottom and the live stack so the collector scans them as roots.
    globals_base: usize,
    /// Instruction pointer, an offset into the code section.
    ip: usize,
    bf: Bytefile,
    heap: Heap,
    io: Io,
    code_len: usize,
}

impl Interpreter {
    /// Build an interpreter over a parsed image: allocate the stack,
    /// reserve the globals window, lay down the boot frame and point
    /// `ip` at the `main` public symbol.
    pub fn new(bf: Bytefile, io: Io) -> Result<Self, InterpreterError> {
        let entry = bf.entry_point()?;
        let globals = bf.global_area_size as usize;

        // Boot frame: two arguments, return address, argument count,
        // plus the two words main's BEGIN will push.
        if globals + 6 > VSTACK_SIZE {
            return Err(InterpreterError::StackOverflow);
        }

        let code_len = bf.code_section.len();
        let globals_base = VSTACK_SIZE - globals;

        let mut interp = Interpreter {
            stack: vec![Word::Int(0); VSTACK_SIZE],
            top: globals_base,
            frame_pointer: globals_base,
            current_frame_locals: 0,
            globals_base,
            ip: entry,
            bf,
            heap: Heap::new(),
            io,
            code_len,
        };

        // Emulated call of main: its BEGIN finds a return address of
        // RETURN_HALT, so the final END stops the dispatch loop.
        interp.push(Word::Int(0))?; // argv placeholder
        interp.push(Word::Int(0))?; // argc placeholder
        interp.push(Word::Meta(RETURN_HALT))?;
        interp.push(Word::Meta(2))?;

        Ok(interp)
    }

    /// Main dispatch loop: fetch one opcode, classify, execute, until
    /// the outermost frame returns.
    pub fn run(&mut self) -> Result<(), Fault> {
        while self.ip != RETURN_HALT {
            let offset = self.ip;
            self.step().map_err(|kind| Fault { offset, kind })?;
        }

        Ok(())
    }

    fn step(&mut self) -> Result<(), InterpreterError> {
        let byte = self.next_byte()?;
        let family = decoder::classify(byte)?;

        if cfg!(feature = "verbose") {
            println!("[LOG] IP {} BYTE {:#04x} {:?}", self.ip - 1, byte, family);
        }

        match family {
            Family::Binop(op) => self.exec_binop(op),
            Family::Ld(rel) => self.exec_ld(rel),
            Family::Lda(rel) => self.exec_lda(rel),
            Family::St(rel) => self.exec_st(rel),
            Family::Patt(kind) => self.exec_patt(kind),
            Family::Plain(opcode) => match opcode {
                Opcode::Const => self.exec_const(),
                Opcode::String => self.exec_string(),
                Opcode::Sexp => self.exec_sexp(),
                Opcode::Sti => Err(InterpreterError::Unsupported("STI")),
                Opcode::Sta => self.exec_sta(),
                Opcode::Jmp => self.exec_jmp(),
                Opcode::End => self.exec_end(),
                Opcode::Ret => Err(InterpreterError::Unsupported("RET")),
                Opcode::Drop => self.pop().map(|_| ()),
                Opcode::Dup => self.exec_dup(),
                Opcode::Swap => self.exec_swap(),
                Opcode::Elem => self.exec_elem(),
                Opcode::CjmpZ => self.exec_cjmp(CompareJumpKind::ISZERO),
                Opcode::CjmpNz => self.exec_cjmp(CompareJumpKind::ISNONZERO),
                Opcode::Begin | Opcode::Cbegin => self.exec_begin(),
                Opcode::Closure => self.exec_closure(),
                Opcode::Callc => self.exec_callc(),
                Opcode::Call => self.exec_call(),
                Opcode::Tag => self.exec_tag(),
                Opcode::Array => self.exec_array_patt(),
                Opcode::Fail => self.exec_fail(),
                Opcode::Line => self.next_int().map(|_| ()),
                Opcode::CallRead => self.exec_call_read(),
                Opcode::CallWrite => self.exec_call_write(),
                Opcode::CallLength => self.exec_call_length(),
                Opcode::CallString => self.exec_call_string(),
                Opcode::CallArray => self.exec_call_array(),
            },
        }
    }

    // ---- fetch primitives -------------------------------------------------

    fn next_byte(&mut self) -> Result<u8, InterpreterError> {
        if self.ip >= self.code_len {
            return Err(InterpreterError::CodeOob {
                requested: self.ip,
                code_size: self.code_len,
            });
        }

        let byte = self.bf.code_section[self.ip];
        self.ip += 1;
        Ok(byte)
    }

    fn next_int(&mut self) -> Result<i32, InterpreterError> {
        if self.ip + 4 > self.code_len {
            return Err(InterpreterError::CodeOob {
                requested: self.ip + 4,
                code_size: self.code_len,
            });
        }

        let bytes = &self.bf.code_section[self.ip..self.ip + 4];
        self.ip += 4;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read a string-table offset operand and resolve it.
    fn next_string(&mut self) -> Result<Vec<u8>, InterpreterError> {
        let offset = self.next_int()? as u32 as usize;
        Ok(self.bf.string_at(offset)?.to_vec())
    }

    // ---- stack primitives -------------------------------------------------

    fn push(&mut self, word: Word) -> Result<(), InterpreterError> {
        if self.top == 0 {
            return Err(InterpreterError::StackOverflow);
        }

        self.top -= 1;
        self.stack[self.top] = word;
        Ok(())
    }

    fn pop(&mut self) -> Result<Word, InterpreterError> {
        if self.top >= self.frame_pointer {
            return Err(InterpreterError::IllegalPop);
        }

        let word = self.stack[self.top];
        self.top += 1;
        Ok(word)
    }

    fn pop_int(&mut self, what: &'static str) -> Result<i32, InterpreterError> {
        let word = self.pop()?;
        word.as_int().ok_or_else(|| {
            InterpreterError::TypeMismatch(format!(
                "{} expected integer, got {}",
                what,
                self.heap.type_name(&word)
            ))
        })
    }

    /// Swap the top `count` entries end-for-end, restoring declaration
    /// order of freshly pushed arguments.
    fn reverse_on_stack(&mut self, count: usize) -> Result<(), InterpreterError> {
        if self.top + count > self.frame_pointer {
            return Err(InterpreterError::IllegalPop);
        }

        self.stack[self.top..self.top + count].reverse();
        Ok(())
    }

    /// Copy the top `count` entries in declaration order (deepest first)
    /// without popping them; the caller drops them after the allocation
    /// they feed has happened, keeping them visible to the collector.
    fn gather_top(&mut self, count: usize) -> Result<Vec<Word>, InterpreterError> {
        if self.top + count > self.frame_pointer {
            return Err(InterpreterError::IllegalPop);
        }

        Ok((0..count)
            .map(|i| self.stack[self.top + count - 1 - i])
            .collect())
    }

    fn drop_top(&mut self, count: usize) {
        self.top += count;
    }

    // ---- location resolution ----------------------------------------------

    fn get_by_loc(&self, rel: ValueRel, index: usize) -> Result<SlotRef, InterpreterError> {
        match rel {
            ValueRel::Global => {
                let size = self.bf.global_area_size as usize;
                if index >= size {
                    return Err(InterpreterError::GlobalOob { index, size });
                }
                Ok(SlotRef::Stack(self.globals_base + index))
            }
            ValueRel::Local => {
                if index >= self.current_frame_locals {
                    return Err(InterpreterError::LocalOob {
                        index,
                        count: self.current_frame_locals,
                    });
                }
                Ok(SlotRef::Stack(frame::local_index(self.frame_pointer, index)))
            }
            ValueRel::Arg => {
                let count = FrameMetadata::args_in_frame(&self.stack, self.frame_pointer)
                    .ok_or(InterpreterError::CorruptFrame)?;
                if index >= count {
                    return Err(InterpreterError::ArgOob { index, count });
                }
                Ok(SlotRef::Stack(frame::arg_index(self.frame_pointer, index)))
            }
            ValueRel::Capture => {
                let n_args = FrameMetadata::args_in_frame(&self.stack, self.frame_pointer)
                    .ok_or(InterpreterError::CorruptFrame)?;
                let slot = frame::closure_index(self.frame_pointer, n_args);
                let word = self.stack[slot];

                let r = word
                    .as_obj()
                    .ok_or_else(|| InterpreterError::NotClosure(word.kind_name().to_string()))?;
                let obj = self
                    .heap
                    .get(r)
                    .ok_or(InterpreterError::InvalidObjectPointer)?;
                let Obj::Closure { captures, .. } = obj else {
                    return Err(InterpreterError::NotClosure(obj.tag().name().to_string()));
                };

                if index >= captures.len() {
                    return Err(InterpreterError::CaptureOob {
                        index,
                        count: captures.len(),
                    });
                }
                Ok(SlotRef::Capture(r, index))
            }
        }
    }

    fn read_slot(&self, slot: SlotRef) -> Result<Word, InterpreterError> {
        match slot {
            SlotRef::Stack(index) => Ok(self.stack[index]),
            SlotRef::Capture(r, index) => {
                match self
                    .heap
                    .get(r)
                    .ok_or(InterpreterError::InvalidObjectPointer)?
                {
                    Obj::Closure { captures, .. } => Ok(captures[index]),
                    obj => Err(InterpreterError::NotClosure(obj.tag().name().to_string())),
                }
            }
        }
    }

    fn write_slot(&mut self, slot: SlotRef, word: Word) -> Result<(), InterpreterError> {
        match slot {
            SlotRef::Stack(index) => {
                self.stack[index] = word;
                Ok(())
            }
            SlotRef::Capture(r, index) => {
                match self
                    .heap
                    .get_mut(r)
                    .ok_or(InterpreterError::InvalidObjectPointer)?
                {
                    Obj::Closure { captures, .. } => {
                        captures[index] = word;
                        Ok(())
                    }
                    obj => Err(InterpreterError::NotClosure(obj.tag().name().to_string())),
                }
            }
        }
    }

    fn jump(&mut self, offset: usize) -> Result<(), InterpreterError> {
        if offset >= self.code_len {
            return Err(InterpreterError::JumpOob {
                offset,
                code_size: self.code_len,
            });
        }

        self.ip = offset;
        Ok(())
    }

    fn aggregate(&self, word: &Word, instr: &'static str) -> Result<ObjRef, InterpreterError> {
        let mismatch = || {
            InterpreterError::TypeMismatch(format!(
                "{} expected string/array/sexp, got {}",
                instr,
                self.heap.type_name(word)
            ))
        };

        let r = word.as_obj().ok_or_else(mismatch)?;
        let obj = self
            .heap
            .get(r)
            .ok_or(InterpreterError::InvalidObjectPointer)?;
        if !obj.is_aggregate() {
            return Err(mismatch());
        }
        Ok(r)
    }

    // ---- handlers ---------------------------------------------------------

    fn exec_binop(&mut self, op: Op) -> Result<(), InterpreterError> {
        let b_val = self.pop()?;
        let a_val = self.pop()?;

        // For EQ, one of the operands may be boxed: integers are never
        // equal to values of other types. Everything else wants two
        // integers.
        if op == Op::EQ {
            let result = match (a_val.as_int(), b_val.as_int()) {
                (Some(a), Some(b)) => (a == b) as i32,
                (Some(_), None) | (None, Some(_)) => 0,
                (None, None) => {
                    return Err(InterpreterError::TypeMismatch(format!(
                        "BINOP == called with two non-integer arguments: {} and {}",
                        self.heap.type_name(&a_val),
                        self.heap.type_name(&b_val)
                    )));
                }
            };
            return self.push(Word::Int(result));
        }

        let (Some(a), Some(b)) = (a_val.as_int(), b_val.as_int()) else {
            return Err(InterpreterError::TypeMismatch(format!(
                "BINOP expected integers, got {} and {}",
                self.heap.type_name(&a_val),
                self.heap.type_name(&b_val)
            )));
        };

        let result = match op {
            Op::ADD => a.wrapping_add(b),
            Op::SUB => a.wrapping_sub(b),
            Op::MUL => a.wrapping_mul(b),
            Op::DIV => {
                if b == 0 {
                    return Err(InterpreterError::DivisionByZero { a });
                }
                a.wrapping_div(b)
            }
            Op::MOD => {
                if b == 0 {
                    return Err(InterpreterError::RemainderByZero { a });
                }
                a.wrapping_rem(b)
            }
            Op::LT => (a < b) as i32,
            Op::LEQ => (a <= b) as i32,
            Op::GT => (a > b) as i32,
            Op::GEQ => (a >= b) as i32,
            Op::EQ => unreachable!("handled above"),
            Op::NEQ => (a != b) as i32,
            Op::AND => (a != 0 && b != 0) as i32,
            Op::OR => (a != 0 || b != 0) as i32,
        };

        self.push(Word::Int(result))
    }

    fn exec_const(&mut self) -> Result<(), InterpreterError> {
        let value = self.next_int()?;
        self.push(Word::Int(value))
    }

    fn exec_string(&mut self) -> Result<(), InterpreterError> {
        let string = self.next_string()?;
        let r = self
            .heap
            .alloc(Obj::Str(string), &self.stack[self.top..]);
        self.push(Word::Ref(r))
    }

    fn exec_sexp(&mut self) -> Result<(), InterpreterError> {
        let name = self.next_string()?;
        let tag =
            runtime::tag_hash(&name).map_err(|c| InterpreterError::BadTagChar(c as char))?;
        let arity = self.next_int()? as u32 as usize;

        // Members stay on the stack until the allocation has consumed
        // them, so a collection triggered here still sees them.
        let fields = self.gather_top(arity)?;
        let r = self
            .heap
            .alloc(Obj::Sexp { tag, fields }, &self.stack[self.top..]);
        self.drop_top(arity);
        self.push(Word::Ref(r))
    }

    fn exec_sta(&mut self) -> Result<(), InterpreterError> {
        let value = self.pop()?;
        let index_val = self.pop()?;

        // The operation is overloaded; the second-to-top value is either
        // a location reference produced by LDA or an integer index.
        if let Word::Slot(slot) = index_val {
            self.write_slot(slot, value)?;
            return self.push(value);
        }

        let Some(index) = index_val.as_int() else {
            return Err(InterpreterError::TypeMismatch(format!(
                "STA expected an index or location reference, got {}",
                self.heap.type_name(&index_val)
            )));
        };

        let target = self.pop()?;
        let r = self.aggregate(&target, "STA")?;

        if index < 0 {
            return Err(InterpreterError::NegativeIndex(index));
        }
        let length = self
            .heap
            .get(r)
            .ok_or(InterpreterError::InvalidObjectPointer)?
            .len();
        if index as usize >= length {
            return Err(InterpreterError::IndexOob { index, length });
        }

        match self
            .heap
            .get_mut(r)
            .ok_or(InterpreterError::InvalidObjectPointer)?
        {
            Obj::Str(bytes) => {
                let Some(byte) = value.as_int() else {
                    return Err(InterpreterError::TypeMismatch(
                        "STA into a string expected an integer".to_string(),
                    ));
                };
                bytes[index as usize] = byte as u8;
            }
            Obj::Array(fields) | Obj::Sexp { fields, .. } => {
                fields[index as usize] = value;
            }
            Obj::Closure { .. } => unreachable!("aggregate() rejects closures"),
        }

        self.push(value)
    }

    fn exec_jmp(&mut self) -> Result<(), InterpreterError> {
        let offset = self.next_int()? as u32 as usize;
        self.jump(offset)
    }

    fn exec_cjmp(&mut self, kind: CompareJumpKind) -> Result<(), InterpreterError> {
        let offset = self.next_int()? as u32 as usize;
        let value = self.pop_int("Jump condition")?;

        let taken = match kind {
            CompareJumpKind::ISZERO => value == 0,
            CompareJumpKind::ISNONZERO => value != 0,
        };
        if taken {
            self.jump(offset)?;
        }
        Ok(())
    }

    fn exec_ld(&mut self, rel: ValueRel) -> Result<(), InterpreterError> {
        let index = self.next_int()? as u32 as usize;
        let slot = self.get_by_loc(rel, index)?;
        let value = self.read_slot(slot)?;
        self.push(value)
    }

    fn exec_lda(&mut self, rel: ValueRel) -> Result<(), InterpreterError> {
        let index = self.next_int()? as u32 as usize;
        let slot = self.get_by_loc(rel, index)?;
        self.push(Word::Slot(slot))
    }

    fn exec_st(&mut self, rel: ValueRel) -> Result<(), InterpreterError> {
        let index = self.next_int()? as u32 as usize;
        let slot = self.get_by_loc(rel, index)?;
        let value = self.pop()?;
        self.write_slot(slot, value)?;
        // ST is an expression: the stored value stays on the stack.
        self.push(value)
    }

    fn exec_elem(&mut self) -> Result<(), InterpreterError> {
        let index_val = self.pop()?;
        let obj_val = self.pop()?;

        let r = self.aggregate(&obj_val, "ELEM")?;
        let Some(index) = index_val.as_int() else {
            return Err(InterpreterError::TypeMismatch(format!(
                "ELEM index must be integer, got {}",
                self.heap.type_name(&index_val)
            )));
        };
        if index < 0 {
            return Err(InterpreterError::NegativeIndex(index));
        }

        let obj = self
            .heap
            .get(r)
            .ok_or(InterpreterError::InvalidObjectPointer)?;
        let length = obj.len();
        if index as usize >= length {
            return Err(InterpreterError::IndexOob { index, length });
        }

        let element = match obj {
            // String elements are signed character codes.
            Obj::Str(bytes) => Word::Int(bytes[index as usize] as i8 as i32),
            Obj::Array(fields) | Obj::Sexp { fields, .. } => fields[index as usize],
            Obj::Closure { .. } => unreachable!("aggregate() rejects closures"),
        };
        self.push(element)
    }

    fn exec_array_patt(&mut self) -> Result<(), InterpreterError> {
        let n = self.next_int()?;
        let word = self.pop()?;

        let matches = match word.as_obj().and_then(|r| self.heap.get(r)) {
            Some(Obj::Array(fields)) => fields.len() == n as usize,
            _ => false,
        };
        self.push(Word::Int(matches as i32))
    }

    fn exec_tag(&mut self) -> Result<(), InterpreterError> {
        let name = self.next_string()?;
        let n = self.next_int()?;
        let tag =
            runtime::tag_hash(&name).map_err(|c| InterpreterError::BadTagChar(c as char))?;
        let word = self.pop()?;

        let matches = match word.as_obj().and_then(|r| self.heap.get(r)) {
            Some(Obj::Sexp {
                tag: actual,
                fields,
            }) => *actual == tag && fields.len() == n as usize,
            _ => false,
        };
        self.push(Word::Int(matches as i32))
    }

    fn exec_patt(&mut self, kind: PattKind) -> Result<(), InterpreterError> {
        let element = self.pop()?;

        let matches = match kind {
            PattKind::BothAreStr => {
                let other = self.pop()?;
                match (
                    element.as_obj().and_then(|r| self.heap.get(r)),
                    other.as_obj().and_then(|r| self.heap.get(r)),
                ) {
                    (Some(Obj::Str(a)), Some(Obj::Str(b))) => a == b,
                    _ => false,
                }
            }
            PattKind::IsStr => self.has_tag(&element, Tag::String),
            PattKind::IsArray => self.has_tag(&element, Tag::Array),
            PattKind::IsSExp => self.has_tag(&element, Tag::Sexp),
            PattKind::IsRef => element.as_obj().is_some(),
            PattKind::IsVal => element.as_int().is_some(),
            PattKind::IsLambda => self.has_tag(&element, Tag::Closure),
        };
        self.push(Word::Int(matches as i32))
    }

    fn has_tag(&self, word: &Word, tag: Tag) -> bool {
        match word.as_obj().and_then(|r| self.heap.get(r)) {
            Some(obj) => obj.tag() == tag,
            None => false,
        }
    }

    fn exec_call(&mut self) -> Result<(), InterpreterError> {
        let offset = self.next_int()? as u32 as usize;
        let n_args = self.next_int()? as u32 as usize;

        self.reverse_on_stack(n_args)?;
        self.push(Word::Meta(self.ip))?;
        self.push(Word::Meta(n_args))?;
        self.jump(offset)
    }

    fn exec_callc(&mut self) -> Result<(), InterpreterError> {
        let n_args = self.next_int()? as u32 as usize;

        // The closure sits right under its n arguments.
        if self.frame_pointer - self.top < n_args + 1 {
            return Err(InterpreterError::IllegalPop);
        }
        let closure_val = self.stack[self.top + n_args];

        let entry = match closure_val.as_obj().and_then(|r| self.heap.get(r)) {
            Some(Obj::Closure { entry, .. }) => *entry,
            _ => {
                return Err(InterpreterError::NotClosure(
                    self.heap.type_name(&closure_val).to_string(),
                ));
            }
        };

        self.reverse_on_stack(n_args)?;
        self.push(Word::Meta(self.ip))?;
        // The closure itself counts as the implicit last argument.
        self.push(Word::Meta(n_args + 1))?;
        self.jump(entry)
    }

    fn exec_closure(&mut self) -> Result<(), InterpreterError> {
        let entry = self.next_int()? as u32 as usize;
        if entry >= self.code_len {
            return Err(InterpreterError::JumpOob {
                offset: entry,
                code_size: self.code_len,
            });
        }

        let n_captures = self.next_int()? as u32 as usize;
        // Each capture descriptor is a location byte plus an int32; a
        // count the remaining code cannot hold is a corrupt image.
        if n_captures.saturating_mul(5) > self.code_len - self.ip {
            return Err(InterpreterError::CodeOob {
                requested: self.ip.saturating_add(n_captures.saturating_mul(5)),
                code_size: self.code_len,
            });
        }

        let mut captures = Vec::with_capacity(n_captures);
        for _ in 0..n_captures {
            let byte = self.next_byte()?;
            let rel = ValueRel::try_from(decoder::low_bits(byte))
                .map_err(|_| InterpreterError::InvalidValueRel(decoder::low_bits(byte)))?;
            let index = self.next_int()? as u32 as usize;
            captures.push(self.read_slot(self.get_by_loc(rel, index)?)?);
        }

        // Captured values are snapshots of slots still inside the root
        // window, and the allocator marks the newborn's fields itself.
        let r = self
            .heap
            .alloc(Obj::Closure { entry, captures }, &self.stack[self.top..]);
        self.push(Word::Ref(r))
    }

    fn exec_begin(&mut self) -> Result<(), InterpreterError> {
        let n_args = self.next_int()?;
        let n_locals = self.next_int()?;

        if n_args < 0 {
            return Err(InterpreterError::NegativeCount {
                what: "arguments",
                n: n_args,
            });
        }
        if n_locals < 0 {
            return Err(InterpreterError::NegativeCount {
                what: "locals",
                n: n_locals,
            });
        }

        self.push(Word::Meta(self.frame_pointer))?;
        self.push(Word::Meta(self.current_frame_locals))?;
        self.frame_pointer = self.top + 1;
        self.current_frame_locals = n_locals as usize;

        for _ in 0..n_locals {
            self.push(Word::Int(0))?;
        }
        Ok(())
    }

    fn exec_end(&mut self) -> Result<(), InterpreterError> {
        let return_value = self.pop()?;

        let frame = FrameMetadata::get_from_stack(&self.stack, self.frame_pointer)
            .ok_or(InterpreterError::CorruptFrame)?;

        self.current_frame_locals = frame.ret_locals;
        // Unwind past locals, the saved slots, the call metadata and the
        // arguments, then hand the return value to the caller.
        self.top = self.frame_pointer + 3 + frame.n_args;
        self.frame_pointer = frame.ret_frame_pointer;

        self.push(return_value)?;
        self.ip = frame.ret_ip;
        Ok(())
    }

    fn exec_dup(&mut self) -> Result<(), InterpreterError> {
        let value = self.pop()?;
        self.push(value)?;
        self.push(value)
    }

    fn exec_swap(&mut self) -> Result<(), InterpreterError> {
        self.reverse_on_stack(2)
    }

    fn exec_fail(&mut self) -> Result<(), InterpreterError> {
        let line = self.next_int()?;
        let column = self.next_int()?;
        let scrutinee = self.pop()?;

        Err(InterpreterError::Fail {
            line,
            column,
            obj: runtime::stringify(&self.heap, &scrutinee),
        })
    }

    // ---- intrinsic calls --------------------------------------------------

    fn exec_call_read(&mut self) -> Result<(), InterpreterError> {
        let value = self.io.read_int()?;
        self.push(Word::Int(value))
    }

    fn exec_call_write(&mut self) -> Result<(), InterpreterError> {
        let value = self.pop_int("Lwrite")?;
        self.io.write_int(value)?;
        self.push(Word::Int(0))
    }

    fn exec_call_length(&mut self) -> Result<(), InterpreterError> {
        let word = self.pop()?;
        let r = self.aggregate(&word, "Llength")?;
        let length = self
            .heap
            .get(r)
            .ok_or(InterpreterError::InvalidObjectPointer)?
            .len();
        self.push(Word::Int(length as i32))
    }

    fn exec_call_string(&mut self) -> Result<(), InterpreterError> {
        let word = self.pop()?;
        let rendered = runtime::stringify(&self.heap, &word);
        let r = self
            .heap
            .alloc(Obj::Str(rendered.into_bytes()), &self.stack[self.top..]);
        self.push(Word::Ref(r))
    }

    fn exec_call_array(&mut self) -> Result<(), InterpreterError> {
        let n = self.next_int()? as u32 as usize;

        let fields = self.gather_top(n)?;
        let r = self
            .heap
            .alloc(Obj::Array(fields), &self.stack[self.top..]);
        self.drop_top(n);
        self.push(Word::Ref(r))
    }
}

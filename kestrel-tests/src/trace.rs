//! A recording assembler: captures applied operations symbolically so
//! tests can assert on the emitted sequence without caring about
//! machine encodings.

use std::cell::RefCell;

use kestrel_asm::{
    Assembler, BinaryOp, BinaryPlan, Client, CodeBuffer, Imm, NullaryOp,
    Operand, OperandPlan, OperandType, UnaryOp, UnaryPlan, ANY_TYPE,
};

const CONSTANT: u8 = OperandType::Constant.mask();
const REGISTER: u8 = OperandType::Register.mask();
const MEMORY: u8 = OperandType::Memory.mask();

/// A recorded operand. Deferred immediates collapse to `Deferred`;
/// which promise they carry is the compiler's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TOperand {
    Constant(i64),
    Deferred,
    Register(u8, Option<u8>),
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
    },
}

impl TOperand {
    fn of(op: &Operand) -> Self {
        match *op {
            Operand::Constant { value } | Operand::Address { address: value } => {
                match value {
                    Imm::Value(v) => TOperand::Constant(v),
                    Imm::Deferred(_) => TOperand::Deferred,
                }
            }
            Operand::Register { low, high } => TOperand::Register(low, high),
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => TOperand::Memory {
                base,
                offset,
                index,
                scale,
            },
        }
    }
}

/// One recorded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    Op0(NullaryOp),
    Op1(UnaryOp, u32, TOperand),
    Op2(BinaryOp, u32, TOperand, TOperand),
}

/// Register file mirroring the x86-64 backend's shape: sixteen
/// registers, base 5, stack 4, thread 3, results in 0 (and 2 for the
/// high half).
pub struct TraceAssembler {
    word: u32,
    argument_registers: Vec<u8>,
    insts: RefCell<Vec<Inst>>,
}

impl TraceAssembler {
    /// A word-sized assembler with register-carried arguments.
    pub fn new(word: u32, argument_registers: &[u8]) -> Self {
        Self {
            word,
            argument_registers: argument_registers.to_vec(),
            insts: RefCell::new(Vec::new()),
        }
    }

    /// Stack-argument convention, 8-byte words.
    pub fn stack_args() -> Self {
        Self::new(8, &[])
    }

    /// A 32-bit-word configuration; wide divides must thunk.
    pub fn narrow() -> Self {
        Self::new(4, &[])
    }

    pub fn insts(&self) -> Vec<Inst> {
        self.insts.borrow().clone()
    }

    fn record(&self, buf: &mut CodeBuffer, inst: Inst) {
        // One byte per instruction keeps code-promise offsets distinct.
        buf.emit_u8(0x90);
        self.insts.borrow_mut().push(inst);
    }
}

impl Assembler for TraceAssembler {
    fn word_size(&self) -> u32 {
        self.word
    }

    fn register_count(&self) -> u8 {
        16
    }

    fn base(&self) -> u8 {
        5
    }

    fn stack(&self) -> u8 {
        4
    }

    fn thread(&self) -> u8 {
        3
    }

    fn argument_register_count(&self) -> u8 {
        self.argument_registers.len() as u8
    }

    fn argument_register(&self, index: u8) -> u8 {
        self.argument_registers[index as usize]
    }

    fn return_low(&self) -> u8 {
        0
    }

    fn return_high(&self) -> u8 {
        2
    }

    fn plan1(&self, op: UnaryOp, _size: u32) -> UnaryPlan {
        let operand = match op {
            UnaryOp::Push => OperandPlan::types(CONSTANT | REGISTER | MEMORY),
            UnaryOp::Pop => OperandPlan::types(REGISTER | MEMORY),
            UnaryOp::Negate => OperandPlan::types(REGISTER),
            _ => OperandPlan::types(ANY_TYPE),
        };
        UnaryPlan {
            operand,
            thunk: false,
        }
    }

    fn plan2(&self, op: BinaryOp, _size: u32) -> BinaryPlan {
        match op {
            BinaryOp::Move | BinaryOp::MoveZ => BinaryPlan::inline(
                OperandPlan::types(ANY_TYPE),
                OperandPlan::types(REGISTER | MEMORY),
            ),
            BinaryOp::Move4To8 => BinaryPlan::inline(
                OperandPlan::types(REGISTER | MEMORY),
                OperandPlan::types(REGISTER),
            ),
            BinaryOp::Compare => BinaryPlan::inline(
                OperandPlan::types(CONSTANT | REGISTER),
                OperandPlan::types(REGISTER | MEMORY),
            ),
            BinaryOp::Divide | BinaryOp::Remainder => BinaryPlan::thunked(),
            _ => BinaryPlan::inline(
                OperandPlan::types(CONSTANT | REGISTER),
                OperandPlan::types(REGISTER),
            ),
        }
    }

    fn apply0(&self, buf: &mut CodeBuffer, op: NullaryOp) {
        self.record(buf, Inst::Op0(op));
    }

    fn apply1(
        &self,
        buf: &mut CodeBuffer,
        op: UnaryOp,
        size: u32,
        a: &Operand,
        _client: &mut dyn Client,
    ) {
        self.record(buf, Inst::Op1(op, size, TOperand::of(a)));
    }

    fn apply2(
        &self,
        buf: &mut CodeBuffer,
        op: BinaryOp,
        size: u32,
        a: &Operand,
        b: &Operand,
        _client: &mut dyn Client,
    ) {
        self.record(buf, Inst::Op2(op, size, TOperand::of(a), TOperand::of(b)));
    }
}

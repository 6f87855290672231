//! x86-64 implementation of the kestrel assembler interface.
//!
//! The backend is stateless: all emission goes through the caller's
//! [`CodeBuffer`]. Operand legality is reported through the plan
//! queries; divide and remainder are declined (`thunk`) and expected
//! to be lowered to helper calls by the compiler.

pub mod emitter;
pub mod regs;

use emitter::Mem;
use kestrel_asm::{
    Assembler, BinaryOp, BinaryPlan, Client, CodeBuffer, Imm, NullaryOp,
    Operand, OperandPlan, OperandType, UnaryOp, UnaryPlan, ANY_TYPE,
};
use regs::{
    ARGUMENT_REGS, BASE, REGISTER_COUNT, RETURN_HIGH, RETURN_LOW, SHIFT_COUNT,
    STACK, THREAD,
};

const CONSTANT: u8 = OperandType::Constant.mask();
const REGISTER: u8 = OperandType::Register.mask();
const MEMORY: u8 = OperandType::Memory.mask();

/// Mask passed when any allocatable register will do for a scratch.
const ANY_TEMPORARY: u32 = (1u32 << REGISTER_COUNT) - 1;

/// Register mask naming `reg` in both the low and high halves.
const fn both_halves(reg: u8) -> u64 {
    (1u64 << reg) | (1u64 << (reg + 32))
}

#[derive(Debug, Default)]
pub struct X64Assembler;

impl X64Assembler {
    pub fn new() -> Self {
        Self
    }
}

fn mem_of(op: &Operand) -> Mem {
    match *op {
        Operand::Memory {
            base,
            offset,
            index,
            scale,
        } => Mem {
            base,
            offset,
            index,
            scale,
        },
        _ => unreachable!(),
    }
}

fn imm_i32(value: Imm) -> i32 {
    match value {
        Imm::Value(v) => {
            assert!(
                v >= i32::MIN as i64 && v <= i32::MAX as i64,
                "immediate out of 32-bit range"
            );
            v as i32
        }
        Imm::Deferred(_) => {
            panic!("deferred immediate in an inline-only position")
        }
    }
}

/// Materialize a constant through a scratch register, then run `body`
/// with the scratch number and hand the register back.
fn with_scratch_constant(
    buf: &mut CodeBuffer,
    client: &mut dyn Client,
    value: Imm,
    body: impl FnOnce(&mut CodeBuffer, u8),
) {
    let tmp = client.acquire_temporary(buf, ANY_TEMPORARY);
    emitter::movabs(buf, tmp, value);
    body(buf, tmp);
    client.release_temporary(buf, tmp);
}

impl Assembler for X64Assembler {
    fn word_size(&self) -> u32 {
        8
    }

    fn register_count(&self) -> u8 {
        REGISTER_COUNT
    }

    fn base(&self) -> u8 {
        BASE as u8
    }

    fn stack(&self) -> u8 {
        STACK as u8
    }

    fn thread(&self) -> u8 {
        THREAD as u8
    }

    fn argument_register_count(&self) -> u8 {
        ARGUMENT_REGS.len() as u8
    }

    fn argument_register(&self, index: u8) -> u8 {
        ARGUMENT_REGS[index as usize] as u8
    }

    fn return_low(&self) -> u8 {
        RETURN_LOW as u8
    }

    fn return_high(&self) -> u8 {
        RETURN_HIGH as u8
    }

    fn plan1(&self, op: UnaryOp, _size: u32) -> UnaryPlan {
        let operand = match op {
            UnaryOp::Push => OperandPlan::types(CONSTANT | REGISTER | MEMORY),
            UnaryOp::Pop => OperandPlan::types(REGISTER | MEMORY),
            UnaryOp::Call | UnaryOp::AlignedCall | UnaryOp::Jump => {
                OperandPlan::types(CONSTANT | REGISTER | MEMORY)
            }
            UnaryOp::JumpIfLess
            | UnaryOp::JumpIfGreater
            | UnaryOp::JumpIfLessOrEqual
            | UnaryOp::JumpIfGreaterOrEqual
            | UnaryOp::JumpIfEqual
            | UnaryOp::JumpIfNotEqual => OperandPlan::types(CONSTANT),
            UnaryOp::Negate => OperandPlan::types(REGISTER),
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
            BinaryOp::Swap => BinaryPlan::inline(
                OperandPlan::types(REGISTER),
                OperandPlan::types(REGISTER),
            ),
            BinaryOp::Compare => BinaryPlan::inline(
                OperandPlan::types(CONSTANT | REGISTER),
                OperandPlan::types(REGISTER | MEMORY),
            ),
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::And
            | BinaryOp::Or
            | BinaryOp::Xor => BinaryPlan::inline(
                OperandPlan::types(CONSTANT | REGISTER),
                OperandPlan::types(REGISTER),
            ),
            BinaryOp::Multiply => BinaryPlan::inline(
                OperandPlan::types(CONSTANT | REGISTER),
                OperandPlan::types(REGISTER),
            ),
            // idiv's fixed rax/rdx diet is not worth inlining; the
            // compiler lowers these to helper calls.
            BinaryOp::Divide | BinaryOp::Remainder => BinaryPlan::thunked(),
            BinaryOp::ShiftLeft
            | BinaryOp::ShiftRight
            | BinaryOp::UnsignedShiftRight => BinaryPlan::inline(
                OperandPlan::new(
                    CONSTANT | REGISTER,
                    both_halves(SHIFT_COUNT as u8),
                ),
                OperandPlan::types(REGISTER),
            ),
        }
    }

    fn apply0(&self, buf: &mut CodeBuffer, op: NullaryOp) {
        match op {
            NullaryOp::Return => emitter::ret(buf),
        }
    }

    fn apply1(
        &self,
        buf: &mut CodeBuffer,
        op: UnaryOp,
        size: u32,
        a: &Operand,
        client: &mut dyn Client,
    ) {
        match (op, a) {
            (UnaryOp::Push, Operand::Constant { value }) => match *value {
                Imm::Value(v)
                    if v >= i32::MIN as i64 && v <= i32::MAX as i64 =>
                {
                    emitter::push_imm32(buf, v as i32)
                }
                other => with_scratch_constant(buf, client, other, |buf, tmp| {
                    emitter::push_reg(buf, tmp)
                }),
            },
            (UnaryOp::Push, Operand::Register { low, .. }) => {
                emitter::push_reg(buf, *low)
            }
            (UnaryOp::Push, m @ Operand::Memory { .. }) => {
                emitter::push_mem(buf, &mem_of(m))
            }

            (UnaryOp::Pop, Operand::Register { low, .. }) => {
                emitter::pop_reg(buf, *low)
            }
            (UnaryOp::Pop, m @ Operand::Memory { .. }) => {
                emitter::pop_mem(buf, &mem_of(m))
            }

            (UnaryOp::Call, Operand::Constant { value }) => {
                emitter::call_imm(buf, *value)
            }
            (UnaryOp::AlignedCall, Operand::Constant { value }) => {
                // Pad so the return address lands on a word boundary.
                while (buf.len() + 5) % 8 != 0 {
                    emitter::nop(buf);
                }
                emitter::call_imm(buf, *value)
            }
            (
                UnaryOp::Call | UnaryOp::AlignedCall,
                Operand::Register { low, .. },
            ) => emitter::call_reg(buf, *low),
            (
                UnaryOp::Call | UnaryOp::AlignedCall,
                m @ Operand::Memory { .. },
            ) => emitter::call_mem(buf, &mem_of(m)),

            (UnaryOp::Jump, Operand::Constant { value }) => {
                emitter::jmp_imm(buf, *value)
            }
            (UnaryOp::Jump, Operand::Register { low, .. }) => {
                emitter::jmp_reg(buf, *low)
            }
            (UnaryOp::Jump, m @ Operand::Memory { .. }) => {
                emitter::jmp_mem(buf, &mem_of(m))
            }

            (UnaryOp::JumpIfLess, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0xC, *value)
            }
            (UnaryOp::JumpIfGreaterOrEqual, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0xD, *value)
            }
            (UnaryOp::JumpIfLessOrEqual, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0xE, *value)
            }
            (UnaryOp::JumpIfGreater, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0xF, *value)
            }
            (UnaryOp::JumpIfEqual, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0x4, *value)
            }
            (UnaryOp::JumpIfNotEqual, Operand::Constant { value }) => {
                emitter::jcc_imm(buf, 0x5, *value)
            }

            (UnaryOp::Negate, Operand::Register { low, .. }) => {
                emitter::neg(buf, size, *low)
            }

            (op, a) => panic!("unsupported unary lowering {op:?} {a:?}"),
        }
    }

    fn apply2(
        &self,
        buf: &mut CodeBuffer,
        op: BinaryOp,
        size: u32,
        a: &Operand,
        b: &Operand,
        client: &mut dyn Client,
    ) {
        match (op, a, b) {
            // -- Moves --
            (
                BinaryOp::Move | BinaryOp::MoveZ,
                Operand::Constant { value },
                Operand::Register { low, .. },
            ) => match *value {
                Imm::Value(v) => emitter::mov_ri(buf, size, *low, v),
                deferred => emitter::movabs(buf, *low, deferred),
            },
            (
                BinaryOp::Move | BinaryOp::MoveZ,
                Operand::Constant { value },
                m @ Operand::Memory { .. },
            ) => {
                let mem = mem_of(m);
                match *value {
                    Imm::Value(v)
                        if v >= i32::MIN as i64 && v <= i32::MAX as i64 =>
                    {
                        emitter::mov_mi(buf, size, &mem, v as i32)
                    }
                    other => {
                        with_scratch_constant(buf, client, other, |buf, tmp| {
                            emitter::store(buf, size, tmp, &mem)
                        })
                    }
                }
            }
            (
                BinaryOp::Move | BinaryOp::MoveZ,
                Operand::Address { address },
                Operand::Register { low, .. },
            ) => emitter::movabs(buf, *low, *address),
            (
                BinaryOp::Move,
                Operand::Register { low: src, .. },
                Operand::Register { low: dst, .. },
            ) => {
                if src != dst || size < 4 {
                    emitter::mov_rr(buf, size, *dst, *src)
                }
            }
            (
                BinaryOp::MoveZ,
                Operand::Register { low: src, .. },
                Operand::Register { low: dst, .. },
            ) => emitter::movz_rr(buf, size, *dst, *src),
            (
                BinaryOp::Move | BinaryOp::MoveZ,
                Operand::Register { low, .. },
                m @ Operand::Memory { .. },
            ) => emitter::store(buf, size, *low, &mem_of(m)),
            (
                BinaryOp::Move,
                m @ Operand::Memory { .. },
                Operand::Register { low, .. },
            ) => emitter::load(buf, size, *low, &mem_of(m)),
            (
                BinaryOp::MoveZ,
                m @ Operand::Memory { .. },
                Operand::Register { low, .. },
            ) => emitter::loadz(buf, size, *low, &mem_of(m)),
            (
                BinaryOp::Move | BinaryOp::MoveZ,
                src @ Operand::Memory { .. },
                dst @ Operand::Memory { .. },
            ) => {
                let (src, dst) = (mem_of(src), mem_of(dst));
                let tmp = client.acquire_temporary(buf, ANY_TEMPORARY);
                if op == BinaryOp::MoveZ {
                    emitter::loadz(buf, size, tmp, &src);
                } else {
                    emitter::load(buf, size, tmp, &src);
                }
                emitter::store(buf, size, tmp, &dst);
                client.release_temporary(buf, tmp);
            }

            (
                BinaryOp::Move4To8,
                Operand::Register { low: src, .. },
                Operand::Register { low: dst, .. },
            ) => emitter::movsxd_rr(buf, *dst, *src),
            (
                BinaryOp::Move4To8,
                m @ Operand::Memory { .. },
                Operand::Register { low, .. },
            ) => emitter::movsxd_rm(buf, *low, &mem_of(m)),

            (
                BinaryOp::Swap,
                Operand::Register { low: a, .. },
                Operand::Register { low: b, .. },
            ) => emitter::xchg_rr(buf, size, *a, *b),

            // -- Compare: flags reflect b minus a --
            (
                BinaryOp::Compare,
                Operand::Constant { value },
                Operand::Register { low, .. },
            ) => emitter::alu_ri(buf, 7, size, imm_i32(*value), *low),
            (
                BinaryOp::Compare,
                Operand::Constant { value },
                m @ Operand::Memory { .. },
            ) => emitter::alu_mi(buf, 7, size, imm_i32(*value), &mem_of(m)),
            (
                BinaryOp::Compare,
                Operand::Register { low: a, .. },
                Operand::Register { low: b, .. },
            ) => emitter::alu_rr(buf, 0x39, size, *a, *b),
            (
                BinaryOp::Compare,
                Operand::Register { low, .. },
                m @ Operand::Memory { .. },
            ) => emitter::alu_mr(buf, 0x39, size, *low, &mem_of(m)),
            (
                BinaryOp::Compare,
                m @ Operand::Memory { .. },
                Operand::Register { low, .. },
            ) => emitter::cmp_rm(buf, size, *low, &mem_of(m)),

            // -- Two-address arithmetic: b = b op a --
            (
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::And
                | BinaryOp::Or | BinaryOp::Xor,
                Operand::Register { low: a, .. },
                Operand::Register { low: b, .. },
            ) => emitter::alu_rr(buf, alu_opcode(op), size, *a, *b),
            (
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::And
                | BinaryOp::Or | BinaryOp::Xor,
                Operand::Constant { value },
                Operand::Register { low, .. },
            ) => emitter::alu_ri(buf, alu_digit(op), size, imm_i32(*value), *low),
            (
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::And
                | BinaryOp::Or | BinaryOp::Xor,
                Operand::Register { low, .. },
                m @ Operand::Memory { .. },
            ) => emitter::alu_mr(buf, alu_opcode(op), size, *low, &mem_of(m)),
            (
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::And
                | BinaryOp::Or | BinaryOp::Xor,
                Operand::Constant { value },
                m @ Operand::Memory { .. },
            ) => {
                emitter::alu_mi(buf, alu_digit(op), size, imm_i32(*value), &mem_of(m))
            }

            (
                BinaryOp::Multiply,
                Operand::Register { low: a, .. },
                Operand::Register { low: b, .. },
            ) => emitter::imul_rr(buf, size, *a, *b),
            (
                BinaryOp::Multiply,
                Operand::Constant { value },
                Operand::Register { low, .. },
            ) => emitter::imul_rri(buf, size, imm_i32(*value), *low),

            (
                BinaryOp::ShiftLeft
                | BinaryOp::ShiftRight
                | BinaryOp::UnsignedShiftRight,
                Operand::Constant { value },
                Operand::Register { low, .. },
            ) => {
                emitter::shift_imm(buf, shift_digit(op), size, imm_i32(*value) as u8, *low)
            }
            (
                BinaryOp::ShiftLeft
                | BinaryOp::ShiftRight
                | BinaryOp::UnsignedShiftRight,
                Operand::Register { low: count, .. },
                Operand::Register { low, .. },
            ) => {
                assert_eq!(
                    *count, SHIFT_COUNT as u8,
                    "shift count must sit in rcx"
                );
                emitter::shift_cl(buf, shift_digit(op), size, *low)
            }

            (op, a, b) => {
                panic!("unsupported binary lowering {op:?} {a:?} {b:?}")
            }
        }
    }
}

fn alu_opcode(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 0x01,
        BinaryOp::Subtract => 0x29,
        BinaryOp::And => 0x21,
        BinaryOp::Or => 0x09,
        BinaryOp::Xor => 0x31,
        _ => unreachable!(),
    }
}

fn alu_digit(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Or => 1,
        BinaryOp::And => 4,
        BinaryOp::Subtract => 5,
        BinaryOp::Xor => 6,
        _ => unreachable!(),
    }
}

fn shift_digit(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::ShiftLeft => 4,
        BinaryOp::UnsignedShiftRight => 5,
        BinaryOp::ShiftRight => 7,
        _ => unreachable!(),
    }
}

//! x86-64 instruction encoders.
//!
//! Free functions emitting little-endian machine code into a
//! [`CodeBuffer`]. Late-bound branch and constant targets are recorded
//! as relocations and patched at write-out.

use kestrel_asm::{CodeBuffer, Imm, RelocKind};

/// A resolved memory operand: machine register numbers only.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: u8,
    pub offset: i32,
    pub index: Option<u8>,
    pub scale: u8,
}

// -- Prefixes and ModR/M --

fn rex_bits(w: bool, reg: u8, index: u8, rm: u8) -> u8 {
    let mut rex = 0x40u8;
    if w {
        rex |= 0x08;
    }
    if reg >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    rex
}

/// Emit a REX prefix if any extension bit is needed. `force` emits a
/// bare 0x40, required to address sil/dil/spl/bpl in byte operations.
fn emit_rex(buf: &mut CodeBuffer, w: bool, reg: u8, index: u8, rm: u8, force: bool) {
    let rex = rex_bits(w, reg, index, rm);
    if rex != 0x40 || force {
        buf.emit_u8(rex);
    }
}

fn emit_operand_prefix(buf: &mut CodeBuffer, size: u32) {
    if size == 2 {
        buf.emit_u8(0x66);
    }
}

fn emit_modrm_reg(buf: &mut CodeBuffer, reg: u8, rm: u8) {
    buf.emit_u8(0xC0 | ((reg & 7) << 3) | (rm & 7));
}

fn scale_bits(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("unsupported scale {scale}"),
    }
}

/// Emit ModR/M (+ SIB + displacement) for a memory operand with `reg`
/// in the reg field.
fn emit_modrm_mem(buf: &mut CodeBuffer, reg: u8, mem: &Mem) {
    let base_low = mem.base & 7;
    // rbp/r13 as base cannot use mod=00; rsp/r12 force a SIB byte.
    let need_disp = mem.offset != 0 || base_low == 5;
    let (modbits, disp8) = if !need_disp {
        (0x00u8, false)
    } else if mem.offset >= -128 && mem.offset <= 127 {
        (0x40u8, true)
    } else {
        (0x80u8, false)
    };

    match mem.index {
        Some(index) => {
            assert!(index & 7 != 4, "rsp cannot be an index register");
            buf.emit_u8(modbits | ((reg & 7) << 3) | 0x04);
            buf.emit_u8(
                (scale_bits(mem.scale) << 6) | ((index & 7) << 3) | base_low,
            );
        }
        None => {
            if base_low == 4 {
                // SIB with no index.
                buf.emit_u8(modbits | ((reg & 7) << 3) | 0x04);
                buf.emit_u8(0x24);
            } else {
                buf.emit_u8(modbits | ((reg & 7) << 3) | base_low);
            }
        }
    }

    if need_disp {
        if disp8 {
            buf.emit_u8(mem.offset as i8 as u8);
        } else {
            buf.emit_u32(mem.offset as u32);
        }
    }
}

fn mem_index(mem: &Mem) -> u8 {
    mem.index.unwrap_or(0)
}

// -- Push / pop --

pub fn push_reg(buf: &mut CodeBuffer, reg: u8) {
    emit_rex(buf, false, 0, 0, reg, false);
    buf.emit_u8(0x50 + (reg & 7));
}

pub fn pop_reg(buf: &mut CodeBuffer, reg: u8) {
    emit_rex(buf, false, 0, 0, reg, false);
    buf.emit_u8(0x58 + (reg & 7));
}

pub fn push_imm32(buf: &mut CodeBuffer, value: i32) {
    buf.emit_u8(0x68);
    buf.emit_u32(value as u32);
}

pub fn push_mem(buf: &mut CodeBuffer, mem: &Mem) {
    emit_rex(buf, false, 6, mem_index(mem), mem.base, false);
    buf.emit_u8(0xFF);
    emit_modrm_mem(buf, 6, mem);
}

pub fn pop_mem(buf: &mut CodeBuffer, mem: &Mem) {
    emit_rex(buf, false, 0, mem_index(mem), mem.base, false);
    buf.emit_u8(0x8F);
    emit_modrm_mem(buf, 0, mem);
}

// -- Moves --

/// `mov dst, src`, full register width for `size` 4/8; sign-extending
/// for sub-word sizes.
pub fn mov_rr(buf: &mut CodeBuffer, size: u32, dst: u8, src: u8) {
    match size {
        1 => {
            emit_rex(buf, true, dst, 0, src, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xBE);
            emit_modrm_reg(buf, dst, src);
        }
        2 => {
            emit_rex(buf, true, dst, 0, src, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xBF);
            emit_modrm_reg(buf, dst, src);
        }
        4 => {
            emit_rex(buf, false, dst, 0, src, false);
            buf.emit_u8(0x8B);
            emit_modrm_reg(buf, dst, src);
        }
        8 => {
            emit_rex(buf, true, dst, 0, src, false);
            buf.emit_u8(0x8B);
            emit_modrm_reg(buf, dst, src);
        }
        _ => panic!("unsupported move size {size}"),
    }
}

/// `mov dst, src` zero-extending for sub-word sizes.
pub fn movz_rr(buf: &mut CodeBuffer, size: u32, dst: u8, src: u8) {
    match size {
        1 => {
            emit_rex(buf, true, dst, 0, src, src >= 4);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xB6);
            emit_modrm_reg(buf, dst, src);
        }
        2 => {
            emit_rex(buf, true, dst, 0, src, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xB7);
            emit_modrm_reg(buf, dst, src);
        }
        // A 32-bit register write clears the upper half.
        4 => {
            emit_rex(buf, false, dst, 0, src, false);
            buf.emit_u8(0x8B);
            emit_modrm_reg(buf, dst, src);
        }
        8 => mov_rr(buf, 8, dst, src),
        _ => panic!("unsupported move size {size}"),
    }
}

/// `movsxd dst, src32`.
pub fn movsxd_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    emit_rex(buf, true, dst, 0, src, false);
    buf.emit_u8(0x63);
    emit_modrm_reg(buf, dst, src);
}

pub fn movsxd_rm(buf: &mut CodeBuffer, dst: u8, mem: &Mem) {
    emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
    buf.emit_u8(0x63);
    emit_modrm_mem(buf, dst, mem);
}

/// Sign-extending load of `size` bytes into a full register.
pub fn load(buf: &mut CodeBuffer, size: u32, dst: u8, mem: &Mem) {
    match size {
        1 => {
            emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xBE);
            emit_modrm_mem(buf, dst, mem);
        }
        2 => {
            emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xBF);
            emit_modrm_mem(buf, dst, mem);
        }
        4 => {
            emit_rex(buf, false, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x8B);
            emit_modrm_mem(buf, dst, mem);
        }
        8 => {
            emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x8B);
            emit_modrm_mem(buf, dst, mem);
        }
        _ => panic!("unsupported load size {size}"),
    }
}

/// Zero-extending load of `size` bytes into a full register.
pub fn loadz(buf: &mut CodeBuffer, size: u32, dst: u8, mem: &Mem) {
    match size {
        1 => {
            emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xB6);
            emit_modrm_mem(buf, dst, mem);
        }
        2 => {
            emit_rex(buf, true, dst, mem_index(mem), mem.base, false);
            buf.emit_u8(0x0F);
            buf.emit_u8(0xB7);
            emit_modrm_mem(buf, dst, mem);
        }
        4 | 8 => load(buf, size, dst, mem),
        _ => panic!("unsupported load size {size}"),
    }
}

/// Store the low `size` bytes of `src`.
pub fn store(buf: &mut CodeBuffer, size: u32, src: u8, mem: &Mem) {
    emit_operand_prefix(buf, size);
    match size {
        1 => {
            emit_rex(buf, false, src, mem_index(mem), mem.base, src >= 4);
            buf.emit_u8(0x88);
            emit_modrm_mem(buf, src, mem);
        }
        2 | 4 => {
            emit_rex(buf, false, src, mem_index(mem), mem.base, false);
            buf.emit_u8(0x89);
            emit_modrm_mem(buf, src, mem);
        }
        8 => {
            emit_rex(buf, true, src, mem_index(mem), mem.base, false);
            buf.emit_u8(0x89);
            emit_modrm_mem(buf, src, mem);
        }
        _ => panic!("unsupported store size {size}"),
    }
}

/// `mov reg, imm`. Chooses the shortest of xor, imm32 and imm64 forms.
pub fn mov_ri(buf: &mut CodeBuffer, size: u32, dst: u8, value: i64) {
    if value == 0 {
        // xor dst32, dst32 clears the full register.
        emit_rex(buf, false, dst, 0, dst, false);
        buf.emit_u8(0x31);
        emit_modrm_reg(buf, dst, dst);
    } else if size <= 4 || (value >= 0 && value <= u32::MAX as i64) {
        emit_rex(buf, false, 0, 0, dst, false);
        buf.emit_u8(0xB8 + (dst & 7));
        buf.emit_u32(value as u32);
    } else if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
        emit_rex(buf, true, 0, 0, dst, false);
        buf.emit_u8(0xC7);
        emit_modrm_reg(buf, 0, dst);
        buf.emit_u32(value as u32);
    } else {
        movabs(buf, dst, Imm::Value(value));
    }
}

/// `movabs reg, imm64`, deferring to a relocation when the value is a
/// promise.
pub fn movabs(buf: &mut CodeBuffer, dst: u8, value: Imm) {
    emit_rex(buf, true, 0, 0, dst, false);
    buf.emit_u8(0xB8 + (dst & 7));
    match value {
        Imm::Value(v) => buf.emit_u64(v as u64),
        Imm::Deferred(_) => {
            let offset = buf.len();
            buf.emit_u64(0);
            buf.add_reloc(offset, value, RelocKind::Abs64);
        }
    }
}

/// `mov [mem], imm32` (sign-extended to `size`).
pub fn mov_mi(buf: &mut CodeBuffer, size: u32, mem: &Mem, value: i32) {
    emit_operand_prefix(buf, size);
    match size {
        1 => {
            emit_rex(buf, false, 0, mem_index(mem), mem.base, false);
            buf.emit_u8(0xC6);
            emit_modrm_mem(buf, 0, mem);
            buf.emit_u8(value as u8);
        }
        2 => {
            emit_rex(buf, false, 0, mem_index(mem), mem.base, false);
            buf.emit_u8(0xC7);
            emit_modrm_mem(buf, 0, mem);
            buf.emit_u16(value as u16);
        }
        4 | 8 => {
            emit_rex(buf, size == 8, 0, mem_index(mem), mem.base, false);
            buf.emit_u8(0xC7);
            emit_modrm_mem(buf, 0, mem);
            buf.emit_u32(value as u32);
        }
        _ => panic!("unsupported store size {size}"),
    }
}

// -- ALU --

/// Two-register ALU form `op rm_dst, reg_src` (dst = dst op src).
/// `opcode` is the r/m,r form: add 0x01, sub 0x29, and 0x21, or 0x09,
/// xor 0x31, cmp 0x39.
pub fn alu_rr(buf: &mut CodeBuffer, opcode: u8, size: u32, src: u8, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, src, 0, dst, false);
    buf.emit_u8(opcode);
    emit_modrm_reg(buf, src, dst);
}

/// ALU with a memory destination: `op [mem], reg_src`.
pub fn alu_mr(buf: &mut CodeBuffer, opcode: u8, size: u32, src: u8, mem: &Mem) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, src, mem_index(mem), mem.base, false);
    buf.emit_u8(opcode);
    emit_modrm_mem(buf, src, mem);
}

/// `cmp reg, [mem]` (reg minus memory).
pub fn cmp_rm(buf: &mut CodeBuffer, size: u32, reg: u8, mem: &Mem) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, reg, mem_index(mem), mem.base, false);
    buf.emit_u8(0x3B);
    emit_modrm_mem(buf, reg, mem);
}

/// Immediate ALU form `op rm_dst, imm32`, `digit` selecting the
/// operation: add 0, or 1, and 4, sub 5, xor 6, cmp 7.
pub fn alu_ri(buf: &mut CodeBuffer, digit: u8, size: u32, value: i32, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, 0, 0, dst, false);
    if value >= -128 && value <= 127 {
        buf.emit_u8(0x83);
        emit_modrm_reg(buf, digit, dst);
        buf.emit_u8(value as u8);
    } else {
        buf.emit_u8(0x81);
        emit_modrm_reg(buf, digit, dst);
        buf.emit_u32(value as u32);
    }
}

/// Immediate ALU with a memory destination.
pub fn alu_mi(buf: &mut CodeBuffer, digit: u8, size: u32, value: i32, mem: &Mem) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, 0, mem_index(mem), mem.base, false);
    if value >= -128 && value <= 127 {
        buf.emit_u8(0x83);
        emit_modrm_mem(buf, digit, mem);
        buf.emit_u8(value as u8);
    } else {
        buf.emit_u8(0x81);
        emit_modrm_mem(buf, digit, mem);
        buf.emit_u32(value as u32);
    }
}

/// `imul dst, src`.
pub fn imul_rr(buf: &mut CodeBuffer, size: u32, src: u8, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, dst, 0, src, false);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xAF);
    emit_modrm_reg(buf, dst, src);
}

/// `imul dst, dst, imm32`.
pub fn imul_rri(buf: &mut CodeBuffer, size: u32, value: i32, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, dst, 0, dst, false);
    buf.emit_u8(0x69);
    emit_modrm_reg(buf, dst, dst);
    buf.emit_u32(value as u32);
}

/// Shift by cl; `digit`: shl 4, shr 5, sar 7.
pub fn shift_cl(buf: &mut CodeBuffer, digit: u8, size: u32, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, 0, 0, dst, false);
    buf.emit_u8(0xD3);
    emit_modrm_reg(buf, digit, dst);
}

/// Shift by immediate count.
pub fn shift_imm(buf: &mut CodeBuffer, digit: u8, size: u32, count: u8, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, 0, 0, dst, false);
    if count == 1 {
        buf.emit_u8(0xD1);
        emit_modrm_reg(buf, digit, dst);
    } else {
        buf.emit_u8(0xC1);
        emit_modrm_reg(buf, digit, dst);
        buf.emit_u8(count);
    }
}

/// `neg dst`.
pub fn neg(buf: &mut CodeBuffer, size: u32, dst: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, 0, 0, dst, false);
    buf.emit_u8(0xF7);
    emit_modrm_reg(buf, 3, dst);
}

/// `xchg a, b`.
pub fn xchg_rr(buf: &mut CodeBuffer, size: u32, a: u8, b: u8) {
    emit_operand_prefix(buf, size);
    emit_rex(buf, size == 8, a, 0, b, false);
    buf.emit_u8(0x87);
    emit_modrm_reg(buf, a, b);
}

// -- Control flow --

/// `call rel32` against a late-bound absolute target.
pub fn call_imm(buf: &mut CodeBuffer, target: Imm) {
    buf.emit_u8(0xE8);
    let offset = buf.len();
    buf.emit_u32(0);
    buf.add_reloc(offset, target, RelocKind::Rel32);
}

pub fn call_reg(buf: &mut CodeBuffer, reg: u8) {
    emit_rex(buf, false, 2, 0, reg, false);
    buf.emit_u8(0xFF);
    emit_modrm_reg(buf, 2, reg);
}

pub fn call_mem(buf: &mut CodeBuffer, mem: &Mem) {
    emit_rex(buf, false, 2, mem_index(mem), mem.base, false);
    buf.emit_u8(0xFF);
    emit_modrm_mem(buf, 2, mem);
}

/// `jmp rel32` against a late-bound absolute target.
pub fn jmp_imm(buf: &mut CodeBuffer, target: Imm) {
    buf.emit_u8(0xE9);
    let offset = buf.len();
    buf.emit_u32(0);
    buf.add_reloc(offset, target, RelocKind::Rel32);
}

pub fn jmp_reg(buf: &mut CodeBuffer, reg: u8) {
    emit_rex(buf, false, 4, 0, reg, false);
    buf.emit_u8(0xFF);
    emit_modrm_reg(buf, 4, reg);
}

pub fn jmp_mem(buf: &mut CodeBuffer, mem: &Mem) {
    emit_rex(buf, false, 4, mem_index(mem), mem.base, false);
    buf.emit_u8(0xFF);
    emit_modrm_mem(buf, 4, mem);
}

/// `jcc rel32`; `cc` is the x86 condition code nibble
/// (l 0xC, ge 0xD, le 0xE, g 0xF, e 0x4, ne 0x5).
pub fn jcc_imm(buf: &mut CodeBuffer, cc: u8, target: Imm) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x80 | cc);
    let offset = buf.len();
    buf.emit_u32(0);
    buf.add_reloc(offset, target, RelocKind::Rel32);
}

pub fn ret(buf: &mut CodeBuffer) {
    buf.emit_u8(0xC3);
}

pub fn nop(buf: &mut CodeBuffer) {
    buf.emit_u8(0x90);
}

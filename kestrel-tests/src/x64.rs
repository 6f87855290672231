//! x86-64 backend tests: byte-exact encodings, plan sanity, and real
//! execution of compiled functions.

use crate::compiler::TestClient;
use kestrel_asm::{
    Assembler, BinaryOp, Client, CodeBuffer, ExecBuffer, Imm,
};
use kestrel_x64::emitter::{self, Mem};
use kestrel_x64::regs::Reg;
use kestrel_x64::X64Assembler;
use kestrel_compiler::{CallFlags, Compiler};

struct NoClient;

impl Client for NoClient {
    fn acquire_temporary(&mut self, _buf: &mut CodeBuffer, _mask: u32) -> u8 {
        unreachable!("encoding under test needs no scratch register")
    }

    fn release_temporary(&mut self, _buf: &mut CodeBuffer, _number: u8) {
        unreachable!()
    }

    fn save(&mut self, _buf: &mut CodeBuffer, _number: u8) {
        unreachable!()
    }

    fn restore(&mut self, _buf: &mut CodeBuffer, _number: u8) {
        unreachable!()
    }
}

fn bytes(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    f(&mut buf);
    buf.as_slice().to_vec()
}

fn mem(base: Reg, offset: i32) -> Mem {
    Mem {
        base: base as u8,
        offset,
        index: None,
        scale: 1,
    }
}

// -- Encoding tests --

#[test]
fn push_pop_encodings() {
    assert_eq!(bytes(|b| emitter::push_reg(b, Reg::Rbp as u8)), [0x55]);
    assert_eq!(bytes(|b| emitter::push_reg(b, Reg::R8 as u8)), [0x41, 0x50]);
    assert_eq!(bytes(|b| emitter::pop_reg(b, Reg::Rbp as u8)), [0x5D]);
    assert_eq!(
        bytes(|b| emitter::push_imm32(b, 2)),
        [0x68, 2, 0, 0, 0]
    );
    assert_eq!(
        bytes(|b| emitter::push_mem(b, &mem(Reg::Rbp, -8))),
        [0xFF, 0x75, 0xF8]
    );
}

#[test]
fn mov_immediate_encodings() {
    // Zero collapses to xor.
    assert_eq!(
        bytes(|b| emitter::mov_ri(b, 8, Reg::Rax as u8, 0)),
        [0x31, 0xC0]
    );
    assert_eq!(
        bytes(|b| emitter::mov_ri(b, 4, Reg::Rax as u8, 42)),
        [0xB8, 42, 0, 0, 0]
    );
    assert_eq!(
        bytes(|b| emitter::mov_ri(b, 8, Reg::Rax as u8, -1)),
        [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
    );
    assert_eq!(
        bytes(|b| emitter::movabs(
            b,
            Reg::Rax as u8,
            Imm::Value(0x1122334455667788)
        )),
        [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn load_store_encodings() {
    assert_eq!(
        bytes(|b| emitter::load(b, 8, Reg::R15 as u8, &mem(Reg::Rbp, 16))),
        [0x4C, 0x8B, 0x7D, 0x10]
    );
    assert_eq!(
        bytes(|b| emitter::load(b, 4, Reg::R15 as u8, &mem(Reg::Rbp, 16))),
        [0x44, 0x8B, 0x7D, 0x10]
    );
    assert_eq!(
        bytes(|b| emitter::store(b, 4, Reg::Rax as u8, &mem(Reg::Rbp, -8))),
        [0x89, 0x45, 0xF8]
    );
    // rsp-based addressing needs a SIB byte.
    assert_eq!(
        bytes(|b| emitter::load(b, 8, Reg::Rax as u8, &mem(Reg::Rsp, 8))),
        [0x48, 0x8B, 0x44, 0x24, 0x08]
    );
    // r13 with no displacement still takes a disp8.
    assert_eq!(
        bytes(|b| emitter::load(b, 8, Reg::Rax as u8, &mem(Reg::R13, 0))),
        [0x49, 0x8B, 0x45, 0x00]
    );
    // Scaled index.
    assert_eq!(
        bytes(|b| emitter::load(
            b,
            8,
            Reg::Rax as u8,
            &Mem {
                base: Reg::Rbx as u8,
                offset: 0,
                index: Some(Reg::Rcx as u8),
                scale: 8,
            }
        )),
        [0x48, 0x8B, 0x04, 0xCB]
    );
}

#[test]
fn alu_encodings() {
    assert_eq!(
        bytes(|b| emitter::alu_rr(b, 0x01, 4, Reg::R14 as u8, Reg::R15 as u8)),
        [0x45, 0x01, 0xF7]
    );
    assert_eq!(
        bytes(|b| emitter::alu_ri(b, 0, 8, 16, Reg::Rsp as u8)),
        [0x48, 0x83, 0xC4, 0x10]
    );
    assert_eq!(
        bytes(|b| emitter::alu_ri(b, 5, 8, 200, Reg::Rsp as u8)),
        [0x48, 0x81, 0xEC, 200, 0, 0, 0]
    );
    assert_eq!(
        bytes(|b| emitter::imul_rr(b, 8, Reg::Rbx as u8, Reg::Rax as u8)),
        [0x48, 0x0F, 0xAF, 0xC3]
    );
    assert_eq!(
        bytes(|b| emitter::shift_imm(b, 4, 8, 3, Reg::Rax as u8)),
        [0x48, 0xC1, 0xE0, 0x03]
    );
    assert_eq!(
        bytes(|b| emitter::shift_cl(b, 7, 4, Reg::Rdx as u8)),
        [0xD3, 0xFA]
    );
    assert_eq!(
        bytes(|b| emitter::neg(b, 8, Reg::Rax as u8)),
        [0x48, 0xF7, 0xD8]
    );
    assert_eq!(
        bytes(|b| emitter::xchg_rr(b, 8, Reg::Rax as u8, Reg::Rbx as u8)),
        [0x48, 0x87, 0xC3]
    );
}

#[test]
fn control_flow_encodings() {
    assert_eq!(bytes(emitter::ret), [0xC3]);
    let jcc = bytes(|b| emitter::jcc_imm(b, 0x5, Imm::Value(0)));
    assert_eq!(&jcc[..2], &[0x0F, 0x85]);
    assert_eq!(jcc.len(), 6);
    let call = bytes(|b| emitter::call_imm(b, Imm::Value(0)));
    assert_eq!(call[0], 0xE8);
    assert_eq!(call.len(), 5);
    assert_eq!(
        bytes(|b| emitter::call_reg(b, Reg::Rax as u8)),
        [0xFF, 0xD0]
    );
    assert_eq!(
        bytes(|b| emitter::jmp_reg(b, Reg::Rax as u8)),
        [0xFF, 0xE0]
    );
}

#[test]
fn divide_declines_to_thunk() {
    let asm = X64Assembler::new();
    assert!(asm.plan2(BinaryOp::Divide, 4).thunk);
    assert!(asm.plan2(BinaryOp::Divide, 8).thunk);
    assert!(asm.plan2(BinaryOp::Remainder, 8).thunk);
    assert!(!asm.plan2(BinaryOp::Add, 8).thunk);
}

#[test]
fn register_file_description() {
    let asm = X64Assembler::new();
    assert_eq!(asm.word_size(), 8);
    assert_eq!(asm.register_count(), 16);
    assert_eq!(asm.base(), Reg::Rbp as u8);
    assert_eq!(asm.stack(), Reg::Rsp as u8);
    assert_eq!(asm.thread(), Reg::Rbx as u8);
    assert_eq!(asm.return_low(), Reg::Rax as u8);
    assert_eq!(asm.argument_register(0), Reg::Rdi as u8);
}

#[test]
fn aligned_call_lands_on_word_boundary() {
    let asm = X64Assembler::new();
    let mut buf = CodeBuffer::new();
    buf.emit_bytes(&[0x90; 3]);
    asm.apply1(
        &mut buf,
        kestrel_asm::UnaryOp::AlignedCall,
        8,
        &kestrel_asm::Operand::Constant {
            value: Imm::Value(0),
        },
        &mut NoClient,
    );
    assert_eq!(buf.len() % 8, 0, "return address must be word aligned");
}

// -- Whole-program emission --

#[test]
fn constant_return_bytes() {
    let mut c = Compiler::new(X64Assembler::new(), TestClient);
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let v = c.constant(42);
    c.return_(4, v);
    c.compile();

    assert_eq!(
        c.code().as_slice(),
        &[
            0x55, // push rbp
            0x48, 0x8B, 0xEC, // mov rbp, rsp
            0xB8, 42, 0, 0, 0, // mov eax, 42
            0x48, 0x8B, 0xE5, // mov rsp, rbp
            0x5D, // pop rbp
            0xC3, // ret
        ]
    );
}

// -- Execution tests --

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod exec {
    use super::*;

    fn run(c: &mut Compiler<X64Assembler, TestClient>) -> ExecBuffer {
        let length = c.compile();
        let total = kestrel_compiler::pad(length, 8) + c.pool_size();
        let mut exec = ExecBuffer::new(total.max(1)).unwrap();
        c.write_to(&mut exec.as_mut_slice()[..total]);
        exec.make_executable().unwrap();
        exec
    }

    /// Call generated code with two stack parameters. The compiled
    /// function follows the VM's own convention: parameters above the
    /// frame, callee-saved registers fair game, so every register the
    /// allocator can touch is declared clobbered here.
    unsafe fn invoke(code: *const u8, seventh: u64, eighth: u64) -> u64 {
        let out: u64;
        std::arch::asm!(
            "push {eighth}",
            "push {seventh}",
            "call {code}",
            "add rsp, 16",
            code = in(reg) code,
            seventh = in(reg) seventh,
            eighth = in(reg) eighth,
            out("rax") out,
            out("rcx") _, out("rdx") _, out("rsi") _, out("rdi") _,
            out("r8") _, out("r9") _, out("r10") _, out("r11") _,
            out("r12") _, out("r13") _, out("r14") _, out("r15") _,
        );
        out
    }

    #[test]
    fn constant_return_executes() {
        let mut c = Compiler::new(X64Assembler::new(), TestClient);
        c.init(1, 0, 0);
        c.start_logical_ip(0);
        let v = c.constant(42);
        c.return_(4, v);
        let exec = run(&mut c);

        assert_eq!(unsafe { invoke(exec.ptr(), 0, 0) }, 42);
    }

    #[test]
    fn parameter_add_executes() {
        let mut c = Compiler::new(X64Assembler::new(), TestClient);
        c.init(1, 2, 2);
        c.start_logical_ip(0);
        let a = c.load_local(4, 0);
        let b = c.load_local(4, 1);
        let r = c.add(4, a, b);
        c.return_(4, r);
        let exec = run(&mut c);

        // Local 1 sits at the seventh-argument slot, local 0 at the
        // eighth.
        assert_eq!(unsafe { invoke(exec.ptr(), 30, 12) }, 42);
        assert_eq!(unsafe { invoke(exec.ptr(), 1, 2) }, 3);
    }

    #[test]
    fn branch_selects_maximum() {
        let mut c = Compiler::new(X64Assembler::new(), TestClient);
        c.init(1, 2, 2);
        c.start_logical_ip(0);
        let label = c.label();
        let a = c.load_local(8, 0);
        let b = c.load_local(8, 1);
        c.cmp(8, a, b);
        c.jg(label);
        let a2 = c.load_local(8, 0);
        c.return_(8, a2);
        c.mark(label);
        let b2 = c.load_local(8, 1);
        c.return_(8, b2);
        let exec = run(&mut c);

        assert_eq!(unsafe { invoke(exec.ptr(), 9, 5) }, 9);
        assert_eq!(unsafe { invoke(exec.ptr(), 5, 9) }, 9);
        assert_eq!(unsafe { invoke(exec.ptr(), 7, 7) }, 7);
    }

    extern "C" fn add2(a: u64, b: u64) -> u64 {
        a.wrapping_add(b)
    }

    #[test]
    fn call_through_register_executes() {
        let mut c = Compiler::new(X64Assembler::new(), TestClient);
        c.init(1, 0, 0);
        c.start_logical_ip(0);
        let address = c.constant(add2 as usize as i64);
        let target = c.load(8, address);
        let a = c.constant(7);
        let b = c.constant(35);
        let r =
            c.call(target, CallFlags::NONE, None, 8, &[(8, a), (8, b)]);
        c.return_(8, r);
        let exec = run(&mut c);

        assert_eq!(unsafe { invoke(exec.ptr(), 0, 0) }, 42);
    }
}

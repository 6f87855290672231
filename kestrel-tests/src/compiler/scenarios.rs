//! End-to-end scenarios against the recording assembler: front-end
//! calls in, symbolic instruction sequences out.

use super::TestClient;
use crate::trace::{Inst, TOperand, TraceAssembler};
use kestrel_asm::{BinaryOp, NullaryOp, UnaryOp};
use kestrel_compiler::{CallFlags, Compiler};

fn compiler(asm: TraceAssembler) -> Compiler<TraceAssembler, TestClient> {
    Compiler::new(asm, TestClient)
}

fn reg(n: u8) -> TOperand {
    TOperand::Register(n, None)
}

fn mem(base: u8, offset: i32) -> TOperand {
    TOperand::Memory {
        base,
        offset,
        index: None,
        scale: 1,
    }
}

const PROLOGUE: [Inst; 2] = [
    Inst::Op1(UnaryOp::Push, 8, TOperand::Register(5, None)),
    Inst::Op2(
        BinaryOp::Move,
        8,
        TOperand::Register(4, None),
        TOperand::Register(5, None),
    ),
];

const EPILOGUE: [Inst; 3] = [
    Inst::Op2(
        BinaryOp::Move,
        8,
        TOperand::Register(5, None),
        TOperand::Register(4, None),
    ),
    Inst::Op1(UnaryOp::Pop, 8, TOperand::Register(5, None)),
    Inst::Op0(NullaryOp::Return),
];

#[test]
fn constant_return() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let v = c.constant(42);
    c.return_(4, v);
    c.compile();

    let mut expected = PROLOGUE.to_vec();
    expected.push(Inst::Op2(
        BinaryOp::Move,
        4,
        TOperand::Constant(42),
        reg(0),
    ));
    expected.extend_from_slice(&EPILOGUE);
    assert_eq!(c.assembler().insts(), expected);
}

#[test]
fn add_two_parameters() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 2, 2);
    c.start_logical_ip(0);
    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let r = c.add(4, a, b);
    c.return_(4, r);
    c.compile();

    let mut expected = PROLOGUE.to_vec();
    expected.extend_from_slice(&[
        // Operands resolve in reverse declaration order.
        Inst::Op2(BinaryOp::Move, 4, mem(5, 16), reg(15)),
        Inst::Op2(BinaryOp::Move, 4, mem(5, 24), reg(14)),
        Inst::Op2(BinaryOp::Add, 4, reg(14), reg(15)),
        Inst::Op2(BinaryOp::Move, 4, reg(15), reg(0)),
    ]);
    expected.extend_from_slice(&EPILOGUE);
    assert_eq!(c.assembler().insts(), expected);
}

#[test]
fn call_with_stacked_arguments() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let address = c.constant(0xBEEF);
    let one = c.constant(1);
    let two = c.constant(2);
    let r = c.call(address, CallFlags::NONE, None, 4, &[(4, one), (4, two)]);
    c.return_(4, r);
    c.compile();

    let mut expected = PROLOGUE.to_vec();
    expected.extend_from_slice(&[
        // Rightmost argument lands deepest.
        Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(2)),
        Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(1)),
        Inst::Op1(UnaryOp::Call, 8, TOperand::Constant(0xBEEF)),
        // Two argument words discarded after the call returns; the
        // result is already in the return register.
        Inst::Op2(BinaryOp::Add, 8, TOperand::Constant(16), reg(4)),
    ]);
    expected.extend_from_slice(&EPILOGUE);
    assert_eq!(c.assembler().insts(), expected);
}

#[test]
fn branch_materializes_live_stack() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 1);
    c.start_logical_ip(0);
    let v = c.constant(7);
    c.push(8, v);
    let zero = c.constant(0);
    let top = c.peek(8, 0);
    c.cmp(4, top, zero);
    let label = c.label();
    c.jne(label);
    c.mark(label);
    c.compile();

    let insts = c.assembler().insts();
    let push_at = insts
        .iter()
        .position(|i| {
            matches!(i, Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(7)))
        })
        .expect("live stack value must be pushed");
    let branch_at = insts
        .iter()
        .position(|i| {
            matches!(i, Inst::Op1(UnaryOp::JumpIfNotEqual, _, TOperand::Deferred))
        })
        .expect("conditional branch against the unplaced label");
    assert!(push_at < branch_at, "push must precede the branch");

    // After the mark, every stack slot lives solely at its push-site.
    let ctx = c.context();
    let mut s = ctx.stack;
    while let Some(entry) = s {
        let e = ctx.stack_entry(entry);
        let site = ctx.value(e.value).sites.expect("slot with no site");
        assert!(ctx.site(site).next.is_none(), "slot must be single-sited");
        assert!(matches!(
            ctx.site(site).kind,
            kestrel_compiler::SiteKind::Memory { .. }
        ));
        s = e.next;
    }
}

#[test]
fn bounds_check_constant_in_range() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 1, 1);
    c.start_logical_ip(0);
    let object = c.load_local(8, 0);
    let index = c.constant(3);
    c.check_bounds(object, 8, index, 0x1234);
    c.compile();

    let mut expected = PROLOGUE.to_vec();
    expected.extend_from_slice(&[
        Inst::Op2(BinaryOp::Move, 8, mem(5, 16), reg(15)),
        // No compare against zero: the constant is known non-negative.
        Inst::Op2(
            BinaryOp::Compare,
            8,
            TOperand::Constant(3),
            TOperand::Memory {
                base: 15,
                offset: 8,
                index: None,
                scale: 1,
            },
        ),
        Inst::Op1(UnaryOp::JumpIfGreater, 8, TOperand::Deferred),
        Inst::Op1(UnaryOp::Call, 8, TOperand::Constant(0x1234)),
    ]);
    assert_eq!(c.assembler().insts(), expected);
}

#[test]
fn bounds_check_dynamic_index_compares_zero() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 2, 2);
    c.start_logical_ip(0);
    let object = c.load_local(8, 0);
    let index = c.load_local(8, 1);
    c.check_bounds(object, 8, index, 0x1234);
    c.compile();

    let insts = c.assembler().insts();
    assert!(
        insts.iter().any(|i| matches!(
            i,
            Inst::Op2(BinaryOp::Compare, 4, TOperand::Constant(0), _)
        )),
        "dynamic index needs a negativity check"
    );
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::JumpIfLess, _, TOperand::Deferred))));
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::Call, _, TOperand::Constant(0x1234)))));
}

#[test]
fn wide_divide_lowers_to_thunk() {
    let mut c = compiler(TraceAssembler::narrow());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let a = c.constant(10);
    let b = c.constant(3);
    let _r = c.div(8, a, b);
    c.compile();

    let insts = c.assembler().insts();
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(3)))));
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(10)))));
    assert!(
        insts.iter().any(|i| matches!(
            i,
            Inst::Op1(
                UnaryOp::Call,
                _,
                TOperand::Constant(super::THUNK_ADDRESS)
            )
        )),
        "divide must call the helper routine"
    );
}

#[test]
fn store_local_writes_through_memory() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 1, 2);
    c.start_logical_ip(0);
    let v = c.load_local(8, 0);
    let one = c.constant(1);
    let r = c.add(8, one, v);
    c.store_local(8, r, 1);
    c.compile();

    let mut expected = PROLOGUE.to_vec();
    expected.extend_from_slice(&[
        // One non-parameter local word to reserve.
        Inst::Op2(
            BinaryOp::Subtract,
            8,
            TOperand::Constant(8),
            TOperand::Register(4, None),
        ),
        Inst::Op2(BinaryOp::Move, 8, mem(5, 16), reg(15)),
        Inst::Op2(BinaryOp::Add, 8, TOperand::Constant(1), reg(15)),
        Inst::Op2(BinaryOp::Move, 8, reg(15), mem(5, -8)),
    ]);
    assert_eq!(c.assembler().insts(), expected);
}

#[test]
fn pop_restores_value_to_register() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(2, 0, 1);
    c.start_logical_ip(0);
    let v = c.constant(9);
    c.push(8, v);
    // A branch forces the push to happen for real.
    let label = c.label();
    c.jmp(label);
    c.mark(label);
    c.start_logical_ip(1);
    let w = c.pop(8);
    c.return_(8, w);
    c.compile();

    let insts = c.assembler().insts();
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::Push, 8, TOperand::Constant(9)))));
    assert!(
        insts
            .iter()
            .any(|i| matches!(i, Inst::Op1(UnaryOp::Pop, 8, TOperand::Register(0, None)))),
        "popped value should land in its read's register"
    );
}

#[test]
fn no_return_call_skips_argument_cleanup() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let address = c.constant(0xBEEF);
    let one = c.constant(1);
    let _ = c.call(
        address,
        CallFlags::NO_RETURN,
        None,
        0,
        &[(4, one)],
    );
    c.compile();

    let insts = c.assembler().insts();
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::Call, _, _))));
    assert!(
        !insts.iter().any(|i| matches!(
            i,
            Inst::Op2(BinaryOp::Add, _, TOperand::Constant(_), TOperand::Register(4, None))
        )),
        "a no-return call must not adjust the stack pointer"
    );
}

#[test]
fn aligned_call_requests_aligned_variant() {
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let address = c.constant(0xBEEF);
    let _ = c.call(address, CallFlags::ALIGNED, None, 0, &[]);
    c.compile();

    assert!(c
        .assembler()
        .insts()
        .iter()
        .any(|i| matches!(i, Inst::Op1(UnaryOp::AlignedCall, _, _))));
}

#[test]
fn call_site_reports_return_address_to_trace_handler() {
    use kestrel_asm::PromiseId;
    use kestrel_compiler::TraceHandler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<PromiseId>>);

    impl TraceHandler for Recorder {
        fn handle_trace(&self, promise: PromiseId) {
            self.0.borrow_mut().push(promise);
        }
    }

    let recorder = Rc::new(Recorder::default());
    let mut c = compiler(TraceAssembler::stack_args());
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let address = c.constant(0xBEEF);
    let _ = c.call(address, CallFlags::NONE, Some(recorder.clone()), 0, &[]);
    let length = c.compile();
    let mut out = vec![0u8; length];
    c.write_to(&mut out);

    let promises = recorder.0.borrow();
    assert_eq!(promises.len(), 1);
    let return_address = c.promise_value(promises[0]);
    let base = out.as_ptr() as i64;

    let call_at = c
        .assembler()
        .insts()
        .iter()
        .position(|i| matches!(i, Inst::Op1(UnaryOp::Call, _, _)))
        .unwrap();
    // One buffer byte per recorded instruction, plus the prologue's
    // two, puts the return address right after the call.
    assert_eq!(return_address - base, call_at as i64 + 1);
}

#[test]
fn compile_is_deterministic() {
    let build = || {
        let mut c = compiler(TraceAssembler::stack_args());
        c.init(1, 2, 2);
        c.start_logical_ip(0);
        let a = c.load_local(4, 0);
        let b = c.load_local(4, 1);
        let r = c.add(4, a, b);
        c.return_(4, r);
        c.compile();
        c
    };
    let first = build();
    let second = build();
    assert_eq!(first.assembler().insts(), second.assembler().insts());
    assert_eq!(first.code().as_slice(), second.code().as_slice());
}

//! Structural invariants of the value/site/register model.

use super::TestClient;
use crate::trace::TraceAssembler;
use kestrel_compiler::site::memory_site;
use kestrel_compiler::{Compiler, Context, SiteKind};

fn compiler() -> Compiler<TraceAssembler, TestClient> {
    Compiler::new(TraceAssembler::stack_args(), TestClient)
}

/// Record a small program without compiling it.
fn recorded() -> Compiler<TraceAssembler, TestClient> {
    let mut c = compiler();
    c.init(1, 2, 2);
    c.start_logical_ip(0);
    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let r = c.add(4, a, b);
    let r2 = c.add(4, r, b);
    c.return_(4, r2);
    c
}

#[test]
fn reads_are_ordered_by_event_sequence() {
    let c = recorded();
    let ctx = c.context();

    for value in &ctx.values {
        let mut r = value.reads;
        let mut previous: Option<u32> = None;
        while let Some(id) = r {
            let read = ctx.read(id);
            let sequence = ctx.event(read.event).sequence;
            if let Some(p) = previous {
                assert!(
                    p < sequence,
                    "read sequence must strictly increase ({p} vs {sequence})"
                );
            }
            previous = Some(sequence);
            r = read.next;
        }
    }
}

#[test]
fn register_owner_lists_its_site() {
    let mut c = recorded();
    c.compile();
    let ctx = c.context();

    for (i, reg) in ctx.registers().iter().enumerate() {
        if let Some(v) = reg.value {
            let site = reg.site.unwrap_or_else(|| {
                panic!("register {i} owns a value but has no site")
            });
            assert!(
                ctx.find_site(v, site),
                "register {i}'s site must be listed by its owner"
            );
        }
    }
}

#[test]
fn memory_site_acquisition_tracks_refcounts() {
    let mut ctx = Context::new(8, 16, 5, 4, 3);
    let asm = TraceAssembler::stack_args();
    let mut buf = kestrel_asm::CodeBuffer::new();

    let site = memory_site(&mut ctx, 5, -16, Some(7), 1);
    let base = ctx.reg_by_number(5);
    let index = ctx.reg_by_number(7);
    assert_eq!(ctx.register(base).ref_count, 0);

    kestrel_compiler::site::site_acquire(
        &mut ctx, &asm, &mut buf, site, None, 8, None,
    );
    assert_eq!(ctx.register(base).ref_count, 1);
    assert_eq!(ctx.register(index).ref_count, 1);

    ctx.site_release(site);
    assert_eq!(ctx.register(base).ref_count, 0);
    assert_eq!(ctx.register(index).ref_count, 0);
}

#[test]
fn exhausted_values_hold_no_sites() {
    let mut c = compiler();
    c.init(1, 2, 2);
    c.start_logical_ip(0);
    let a = c.load_local(4, 0);
    let b = c.load_local(4, 1);
    let r = c.add(4, a, b);
    c.return_(4, r);
    c.compile();

    let ctx = c.context();
    for v in [a, b, r] {
        assert!(ctx.value(v).reads.is_none());
        assert!(
            ctx.value(v).sites.is_none(),
            "a fully read value must release all sites"
        );
    }
}

#[test]
fn reserved_registers_are_never_picked() {
    let ctx = Context::new(8, 16, 5, 4, 3);

    for number in [3u8, 4, 5] {
        let r = ctx.reg_by_number(number);
        assert!(ctx.register(r).reserved);
        assert_eq!(ctx.register_cost(r), 6);
    }

    let picked = ctx.pick_register(!0);
    assert!(!ctx.register(picked).reserved);
}

#[test]
fn junction_entry_slots_are_memory_backed() {
    let mut c = compiler();
    c.init(2, 0, 1);
    c.start_logical_ip(0);
    let v = c.constant(11);
    c.push(8, v);
    let label = c.label();
    c.jmp(label);
    c.mark(label);

    // Entering the join, every slot must live at its push-site alone.
    let ctx = c.context();
    let mut s = ctx.stack;
    assert!(s.is_some());
    while let Some(entry) = s {
        let e = ctx.stack_entry(entry);
        assert!(e.pushed);
        let site = ctx.value(e.value).sites.expect("slot with no site");
        assert!(ctx.site(site).next.is_none());
        assert!(matches!(ctx.site(site).kind, SiteKind::Memory { .. }));
        s = e.next;
    }
}

#[test]
fn promise_values_are_stable_after_placement() {
    let mut c = compiler();
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let v = c.constant(42);
    c.return_(4, v);
    let pool_entry = c.pool_append(99);
    let ip = c.machine_ip(0);

    let length = c.compile();
    let mut out =
        vec![0u8; kestrel_compiler::pad(length, 8) + c.pool_size()];
    c.write_to(&mut out);

    let base = out.as_ptr() as i64;
    assert!(c.promise_resolved(ip));
    let first = c.promise_value(ip);
    let second = c.promise_value(ip);
    assert_eq!(first, second);
    assert_eq!(
        first - base,
        c.context().logical_code[0].machine_offset as i64
    );

    let slot = c.promise_value(pool_entry);
    assert_eq!(
        slot - base,
        kestrel_compiler::pad(length, 8) as i64,
        "pool slot addresses start at the padded code length"
    );

    // The pool slot itself holds the appended literal.
    let offset = (slot - base) as usize;
    let mut word = [0u8; 8];
    word.copy_from_slice(&out[offset..offset + 8]);
    assert_eq!(i64::from_le_bytes(word), 99);
}

#[test]
fn write_to_is_idempotent() {
    let mut c = compiler();
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let v = c.constant(42);
    c.return_(4, v);
    let length = c.compile();

    let mut first = vec![0u8; length];
    c.write_to(&mut first);
    let mut second = vec![0u8; length];
    c.write_to(&mut second);
    assert_eq!(first, second);
}

#[test]
fn unresolved_promise_query_panics() {
    let mut c = compiler();
    c.init(1, 0, 0);
    c.start_logical_ip(0);
    let ip = c.machine_ip(0);
    assert!(!c.promise_resolved(ip));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        c.promise_value(ip)
    }));
    assert!(result.is_err(), "querying an unplaced promise must abort");
}

//! Events: recorded operations with a read-declaration phase and a
//! machine-code emission phase.

use std::rc::Rc;

use crate::context::{
    Context, EventId, LocalId, SiteId, StackId, ValueId,
};
use crate::promise::Promise;
use crate::site::{
    add_site, any_register_site, apply0_raw, apply1, apply1_raw, apply2,
    apply2_raw, constant_site, fixed_register_site, free_register_site,
    memory_site, register_or_constant_site, register_site, resolved_site,
    restrict_type_mask, target_or_null_read, target_or_register,
    push_placeholder_site, virtual_site,
};
use crate::stack::{
    clean_stack, ignore_words, pop_now, push_now_prefix, push_value,
    reset_locals, reset_stack,
};
use crate::{CallFlags, CompilerClient, TraceHandler};
use kestrel_asm::{
    Assembler, BinaryOp, CodeBuffer, NullaryOp, Operand, OperandType,
    UnaryOp, ANY_REG, ANY_TYPE,
};
use log::trace;

/// The operation a recorded event performs when compiled.
#[derive(Clone)]
pub enum EventKind {
    Move {
        op: BinaryOp,
        size: u32,
        src: ValueId,
        dst: ValueId,
        dst_type_mask: u8,
        dst_register_mask: u64,
    },
    Compare {
        size: u32,
        first: ValueId,
        second: ValueId,
    },
    Combine {
        op: BinaryOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        result: ValueId,
    },
    Translate {
        op: UnaryOp,
        size: u32,
        value: ValueId,
        result: ValueId,
    },
    Memory {
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    },
    Call {
        address: ValueId,
        flags: CallFlags,
        trace: Option<Rc<dyn TraceHandler>>,
        result: ValueId,
        result_size: u32,
        argument_footprint: u32,
    },
    Return {
        size: u32,
        value: Option<ValueId>,
    },
    Branch {
        op: UnaryOp,
        address: ValueId,
    },
    Push {
        entry: StackId,
        active: bool,
    },
    Pop {
        count: u32,
        ignore: bool,
    },
    StackSync,
    Local {
        size: u32,
        local: LocalId,
    },
    ClobberLocal {
        size: u32,
        local: LocalId,
    },
    BoundsCheck {
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    },
}

impl std::fmt::Debug for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Move { .. } => "Move",
            EventKind::Compare { .. } => "Compare",
            EventKind::Combine { .. } => "Combine",
            EventKind::Translate { .. } => "Translate",
            EventKind::Memory { .. } => "Memory",
            EventKind::Call { .. } => "Call",
            EventKind::Return { .. } => "Return",
            EventKind::Branch { .. } => "Branch",
            EventKind::Push { .. } => "Push",
            EventKind::Pop { .. } => "Pop",
            EventKind::StackSync => "StackSync",
            EventKind::Local { .. } => "Local",
            EventKind::ClobberLocal { .. } => "ClobberLocal",
            EventKind::BoundsCheck { .. } => "BoundsCheck",
        };
        f.write_str(name)
    }
}

/// One node in the per-logical-ip event list.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub next: Option<EventId>,
    /// Virtual-stack snapshot at creation.
    pub stack: Option<StackId>,
    pub locals: Option<LocalId>,
    /// Code promises taking this event's end offset.
    pub promises: Option<kestrel_asm::PromiseId>,
    pub reads: Option<crate::context::ReadId>,
    pub read_count: u32,
    pub sequence: u32,
    pub stack_reset: bool,
}

impl Event {
    pub fn push_active(&self) -> bool {
        matches!(self.kind, EventKind::Push { active: true, .. })
    }

    /// Whether a move feeding this event can be elided: an active push
    /// consumes its source site directly.
    pub fn skip_move(&self, size: u32, word: u32) -> bool {
        match self.kind {
            EventKind::Push { active, .. } => active && size >= word,
            _ => false,
        }
    }
}

/// Create an event at the current logical ip, linked after its
/// predecessors and stamped with the next sequence number.
fn new_event(c: &mut Context, kind: EventKind) -> EventId {
    let ip = c
        .logical_ip
        .expect("event recorded outside a logical instruction");
    let sequence = c.next_sequence;
    c.next_sequence += 1;

    let id = c.add_event(Event {
        kind,
        next: None,
        stack: c.stack,
        locals: c.locals,
        promises: None,
        reads: None,
        read_count: 0,
        sequence,
        stack_reset: c.stack_reset,
    });

    let last = c.logical_code[ip as usize].last_event;
    match last {
        Some(last) => {
            c.logical_code[ip as usize].last_event = Some(id);
            c.event_mut(last).next = Some(id);
        }
        None => {
            let li = &mut c.logical_code[ip as usize];
            li.first_event = Some(id);
            li.last_event = Some(id);
        }
    }

    if c.stack_reset {
        c.stack_reset = false;
    }

    id
}

/// An unlinked event with an explicit sequence and snapshots; junction
/// syncs splice these in after recording ends.
fn new_event_raw(
    c: &mut Context,
    kind: EventKind,
    sequence: u32,
    stack: Option<StackId>,
    locals: Option<LocalId>,
) -> EventId {
    c.add_event(Event {
        kind,
        next: None,
        stack,
        locals,
        promises: None,
        reads: None,
        read_count: 0,
        sequence,
        stack_reset: false,
    })
}

fn activate_push(c: &mut Context, event: EventId) {
    if let EventKind::Push { active, .. } = &mut c.event_mut(event).kind {
        *active = true;
    } else {
        panic!("activating a non-push event");
    }
}

// -- Recording --

pub fn append_push(c: &mut Context, entry: StackId) {
    trace!("append push {entry:?}");
    assert!(c.stack_entry(entry).push_event.is_none());

    let id = new_event(
        c,
        EventKind::Push {
            entry,
            active: false,
        },
    );
    c.stack_entry_mut(entry).push_event = Some(id);

    let value = c.stack_entry(entry).value;
    let size = c.stack_entry(entry).size * c.word_size;
    let placeholder = push_placeholder_site(c, id);
    c.add_read(value, size, Some(placeholder));
}

pub fn append_pop(c: &mut Context, count: u32, ignore: bool) {
    trace!("append pop {count}");
    new_event(c, EventKind::Pop { count, ignore });
}

pub fn append_move<A: Assembler>(
    c: &mut Context,
    asm: &A,
    op: BinaryOp,
    size: u32,
    src: ValueId,
    dst: ValueId,
) {
    trace!("append move {op:?}");
    let plan = asm.plan2(op, size);
    assert!(!plan.thunk, "unwired thunk lowering for {op:?}");

    new_event(
        c,
        EventKind::Move {
            op,
            size,
            src,
            dst,
            dst_type_mask: plan.dst.type_mask,
            dst_register_mask: plan.dst.register_mask,
        },
    );

    let src_target = virtual_site(
        c,
        Some(dst),
        plan.src.type_mask,
        plan.src.register_mask,
    );
    c.add_read(src, size, Some(src_target));
}

pub fn append_compare<A: Assembler>(
    c: &mut Context,
    asm: &A,
    size: u32,
    first: ValueId,
    second: ValueId,
) {
    trace!("append compare");
    let plan = asm.plan2(BinaryOp::Compare, size);
    assert!(!plan.thunk, "unwired thunk lowering for compare");

    new_event(
        c,
        EventKind::Compare {
            size,
            first,
            second,
        },
    );

    let first_target =
        virtual_site(c, None, plan.src.type_mask, plan.src.register_mask);
    c.add_read(first, size, Some(first_target));
    let second_target =
        virtual_site(c, None, plan.dst.type_mask, plan.dst.register_mask);
    c.add_read(second, size, Some(second_target));
}

pub fn append_combine<A: Assembler>(
    c: &mut Context,
    asm: &A,
    client: &dyn CompilerClient,
    op: BinaryOp,
    size: u32,
    first: ValueId,
    second: ValueId,
    result: ValueId,
) {
    let plan = asm.plan2(op, size);

    if plan.thunk {
        // Out-of-line lowering: both operands go to the stack and a
        // helper routine produces the result.
        let old_stack = c.stack;

        push_value(c, size, second);
        push_value(c, size, first);

        let argument_stack = c.stack;
        c.stack = old_stack;

        let thunk = client.get_thunk(op, size);
        let thunk_site = resolved_site(c, thunk);
        let address = c.new_value(Some(thunk_site), None);
        append_call(
            c,
            asm,
            address,
            CallFlags::NONE,
            None,
            result,
            size,
            argument_stack,
            2,
        );
        return;
    }

    trace!("append combine {op:?}");

    // Shift counts are a machine-word concern, not a value-size one.
    let first_size = match op {
        BinaryOp::ShiftLeft
        | BinaryOp::ShiftRight
        | BinaryOp::UnsignedShiftRight => 4,
        _ => size,
    };

    new_event(
        c,
        EventKind::Combine {
            op,
            size,
            first,
            second,
            result,
        },
    );

    let memory = OperandType::Memory.mask();
    let first_target =
        virtual_site(c, None, plan.src.type_mask, plan.src.register_mask);
    restrict_type_mask(c, first_target, !memory);
    c.add_read(first, first_size, Some(first_target));

    let second_target = virtual_site(
        c,
        Some(result),
        plan.dst.type_mask,
        plan.dst.register_mask,
    );
    restrict_type_mask(c, second_target, !memory);
    c.add_read(second, size, Some(second_target));
}

pub fn append_translate<A: Assembler>(
    c: &mut Context,
    asm: &A,
    op: UnaryOp,
    size: u32,
    value: ValueId,
    result: ValueId,
) {
    trace!("append translate {op:?}");
    let plan = asm.plan1(op, size);
    assert!(!plan.thunk, "unwired thunk lowering for {op:?}");

    new_event(
        c,
        EventKind::Translate {
            op,
            size,
            value,
            result,
        },
    );

    let target = virtual_site(
        c,
        Some(result),
        plan.operand.type_mask,
        plan.operand.register_mask,
    );
    restrict_type_mask(c, target, !OperandType::Memory.mask());
    c.add_read(value, size, Some(target));
}

pub fn append_memory(
    c: &mut Context,
    base: ValueId,
    displacement: i32,
    index: Option<ValueId>,
    scale: u8,
    result: ValueId,
) {
    trace!("append memory");
    let word = c.word_size;

    new_event(
        c,
        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        },
    );

    let base_target = any_register_site(c);
    c.add_read(base, word, Some(base_target));
    if let Some(index) = index {
        let index_target = any_register_site(c);
        c.add_read(index, word, Some(index_target));
    }
}

#[allow(clippy::too_many_arguments)]
pub fn append_call<A: Assembler>(
    c: &mut Context,
    asm: &A,
    address: ValueId,
    flags: CallFlags,
    trace_handler: Option<Rc<dyn TraceHandler>>,
    result: ValueId,
    result_size: u32,
    argument_stack: Option<StackId>,
    argument_count: u32,
) {
    trace!("append call");
    let word = c.word_size;
    let argument_register_count = asm.argument_register_count() as u32;

    let id = new_event(
        c,
        EventKind::Call {
            address,
            flags,
            trace: trace_handler,
            result,
            result_size,
            argument_footprint: 0,
        },
    );

    // Leading argument words ride in registers; the rest must be
    // pushed for real.
    let mut mask: u32 = !0;
    let mut argument_footprint = 0;
    let mut s = argument_stack;
    let mut index = 0u32;
    for _ in 0..argument_count {
        let entry = s.expect("argument stack shorter than argument count");
        let value = c.stack_entry(entry).value;
        let size = c.stack_entry(entry).size;

        let target = if index < argument_register_count {
            let r = asm.argument_register(index as u8);
            mask &= !(1u32 << r);
            Some(fixed_register_site(c, r, None))
        } else {
            let push_event = c
                .stack_entry(entry)
                .push_event
                .expect("stacked argument with no push event");
            activate_push(c, push_event);
            argument_footprint += size;
            None
        };
        c.add_read(value, size * word, target);

        index += size;
        s = c.stack_entry(entry).next;
    }

    if let EventKind::Call {
        argument_footprint: f,
        ..
    } = &mut c.event_mut(id).kind
    {
        *f = argument_footprint;
    }

    let call_mask = ((mask as u64) << 32) | mask as u64;
    let address_target = virtual_site(c, None, ANY_TYPE, call_mask);
    c.add_read(address, word, Some(address_target));

    // Everything live on the stack must stay clear of the argument
    // registers and be materialized across the call.
    let mut s = c.event(id).stack;
    while let Some(entry) = s {
        if let Some(push_event) = c.stack_entry(entry).push_event {
            activate_push(c, push_event);
        }
        let value = c.stack_entry(entry).value;
        let size = c.stack_entry(entry).size;
        let target = virtual_site(c, None, ANY_TYPE, call_mask);
        c.add_read(value, size * word, Some(target));
        s = c.stack_entry(entry).next;
    }

    reset_locals(c);
}

pub fn append_return<A: Assembler>(
    c: &mut Context,
    asm: &A,
    size: u32,
    value: Option<ValueId>,
) {
    trace!("append return");
    let word = c.word_size;

    new_event(c, EventKind::Return { size, value });

    if let Some(v) = value {
        let high = if size > word {
            Some(asm.return_high())
        } else {
            None
        };
        let low = asm.return_low();
        let target = fixed_register_site(c, low, high);
        c.add_read(v, size, Some(target));
    }
}

pub fn append_branch(c: &mut Context, op: UnaryOp, address: ValueId) {
    append_stack_sync(c);

    trace!("append branch {op:?}");
    let word = c.word_size;
    new_event(c, EventKind::Branch { op, address });
    c.add_read(address, word, None);

    reset_stack(c);
}

pub fn append_stack_sync(c: &mut Context) {
    trace!("append stack sync");
    let word = c.word_size;
    let id = new_event(c, EventKind::StackSync);

    let mut s = c.event(id).stack;
    while let Some(entry) = s {
        if let Some(push_event) = c.stack_entry(entry).push_event {
            activate_push(c, push_event);
        }
        let value = c.stack_entry(entry).value;
        let size = c.stack_entry(entry).size;
        c.add_read(value, size * word, None);
        s = c.stack_entry(entry).next;
    }
}

/// The sync spliced after a junction predecessor's last event; reads
/// insert at the predecessor's sequence so they land between that
/// path's uses and any recorded later.
pub fn append_stack_sync_junction(
    c: &mut Context,
    sequence: u32,
    stack: Option<StackId>,
    locals: Option<LocalId>,
) -> EventId {
    let word = c.word_size;
    let id = new_event_raw(c, EventKind::StackSync, sequence, stack, locals);

    let mut s = stack;
    while let Some(entry) = s {
        if let Some(push_event) = c.stack_entry(entry).push_event {
            activate_push(c, push_event);
        }
        let value = c.stack_entry(entry).value;
        let size = c.stack_entry(entry).size;
        c.insert_read(id, Some(sequence), value, size * word, None);
        s = c.stack_entry(entry).next;
    }

    id
}

pub fn append_local(c: &mut Context, size: u32, local: LocalId) {
    trace!("append local");
    new_event(c, EventKind::Local { size, local });

    if let Some(old) = c.local(local).old {
        let value = c.local(old).value;
        c.add_read(value, size, None);
    }
}

pub fn append_clobber_local(c: &mut Context, size: u32, local: LocalId) {
    trace!("append clobber local");
    new_event(c, EventKind::ClobberLocal { size, local });
}

pub fn append_bounds_check(
    c: &mut Context,
    object: ValueId,
    length_offset: u32,
    index: ValueId,
    handler: i64,
) {
    trace!("append bounds check");
    let word = c.word_size;

    new_event(
        c,
        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        },
    );

    let object_target = any_register_site(c);
    c.add_read(object, word, Some(object_target));
    let index_target = register_or_constant_site(c);
    c.add_read(index, word, Some(index_target));
}

// -- Compilation --

/// Preserve `v` somewhere else before `s` is consumed destructively.
fn preserve<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    size: u32,
    v: ValueId,
    s: SiteId,
    read: crate::context::ReadId,
) {
    assert!(c.value(v).sites == Some(s));
    let r = match target_or_null_read(c, read) {
        None => free_register_site(c, ANY_REG),
        Some(t) if t == s => free_register_site(c, ANY_REG),
        Some(t) => t,
    };
    add_site(c, asm, buf, stack, size, v, r);
    apply2(c, asm, buf, BinaryOp::Move, size, s, r);
}

/// Pre-copy a single-sited value with remaining reads before its site
/// is destroyed by a two-address operation.
fn maybe_preserve<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    size: u32,
    v: ValueId,
    s: SiteId,
) {
    let Some(read) = c.value(v).reads else { return };
    let Some(next_read) = c.read(read).next else { return };
    let sites = c.value(v).sites.expect("live value with no sites");
    if c.site(sites).next.is_none() {
        preserve(c, asm, buf, stack, size, v, s, next_read);
    }
}

pub fn compile_event<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
) {
    let kind = c.event(e).kind.clone();
    trace!("compile {kind:?}");
    match kind {
        EventKind::Move {
            op,
            size,
            src,
            dst,
            dst_type_mask,
            dst_register_mask,
        } => compile_move(
            c,
            asm,
            buf,
            e,
            op,
            size,
            src,
            dst,
            dst_type_mask,
            dst_register_mask,
        ),
        EventKind::Compare {
            size,
            first,
            second,
        } => compile_compare(c, asm, buf, size, first, second),
        EventKind::Combine {
            op,
            size,
            first,
            second,
            result,
        } => compile_combine(c, asm, buf, e, op, size, first, second, result),
        EventKind::Translate {
            op,
            size,
            value,
            result,
        } => compile_translate(c, asm, buf, e, op, size, value, result),
        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        } => compile_memory(c, asm, buf, base, displacement, index, scale, result),
        EventKind::Call {
            address,
            flags,
            trace,
            result,
            result_size,
            argument_footprint,
        } => compile_call(
            c,
            asm,
            buf,
            e,
            address,
            flags,
            trace,
            result,
            result_size,
            argument_footprint,
        ),
        EventKind::Return { size: _, value } => {
            compile_return(c, asm, buf, value)
        }
        EventKind::Branch { op, address } => {
            compile_branch(c, asm, buf, op, address)
        }
        EventKind::Push { entry, active } => {
            compile_push(c, asm, buf, entry, active)
        }
        EventKind::Pop { count, ignore } => {
            let stack = c.event(e).stack;
            pop_now(c, asm, buf, stack, count, ignore);
        }
        EventKind::StackSync => {
            let stack = c.event(e).stack;
            let locals = c.event(e).locals;
            let reads = c.event(e).reads;
            clean_stack(c, asm, buf, stack, locals, reads);
        }
        EventKind::Local { size, local } => {
            compile_local(c, asm, buf, size, local)
        }
        EventKind::ClobberLocal { size, local } => {
            compile_clobber_local(c, asm, buf, e, size, local)
        }
        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        } => compile_bounds_check(
            c,
            asm,
            buf,
            object,
            length_offset,
            index,
            handler,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_move<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
    op: BinaryOp,
    size: u32,
    src: ValueId,
    dst: ValueId,
    dst_type_mask: u8,
    dst_register_mask: u64,
) {
    let word = asm.word_size();
    let source = c.value(src).source.expect("move source unresolved");

    let src_read = c.value(src).reads.expect("move with no pending read");
    let is_load = c.read(src_read).next.is_none();
    let is_store = c.value(dst).reads.is_none();

    // A move straight into an active push is the push's problem.
    let skip = op == BinaryOp::Move
        && match c.value(dst).reads {
            Some(r) => {
                let dst_event = c.read(r).event;
                c.event(e).next == Some(dst_event)
                    && c.event(dst_event).skip_move(size, word)
            }
            None => false,
        };

    let (target, cost) = if skip {
        (source, 0)
    } else {
        let target = target_or_register(c, dst);
        let cost = c.copy_cost(source, Some(target));
        if cost == 0 && (is_load || is_store) {
            (source, 0)
        } else {
            (target, cost)
        }
    };

    assert!(is_load || is_store || target != source);

    if target == source {
        c.remove_site(src, target);
    }

    let stack = c.event(e).stack;
    if !is_store {
        add_site(c, asm, buf, stack, size, dst, target);
    }

    if cost != 0 || op != BinaryOp::Move {
        if c.site_matches(target, dst_type_mask, dst_register_mask) {
            apply2(c, asm, buf, op, size, source, target);
        } else {
            assert!(
                dst_type_mask & OperandType::Register.mask() != 0,
                "unsatisfiable move destination"
            );
            let tmp = free_register_site(c, dst_register_mask);
            add_site(c, asm, buf, stack, size, dst, tmp);
            apply2(c, asm, buf, op, size, source, tmp);
            if is_store {
                c.remove_site(dst, tmp);
                apply2(c, asm, buf, BinaryOp::Move, size, tmp, target);
            } else {
                c.remove_site(dst, target);
            }
        }
    }

    if is_store {
        c.remove_site(dst, target);
    }

    c.next_read(src);
}

fn compile_compare<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    size: u32,
    first: ValueId,
    second: ValueId,
) {
    let a = c.value(first).source.expect("compare operand unresolved");
    let b = c.value(second).source.expect("compare operand unresolved");
    apply2(c, asm, buf, BinaryOp::Compare, size, a, b);

    c.next_read(first);
    c.next_read(second);
}

#[allow(clippy::too_many_arguments)]
fn compile_combine<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
    op: BinaryOp,
    size: u32,
    first: ValueId,
    second: ValueId,
    result: ValueId,
) {
    let stack = c.event(e).stack;
    let second_source =
        c.value(second).source.expect("combine operand unresolved");
    maybe_preserve(c, asm, buf, stack, size, second, second_source);

    let first_source =
        c.value(first).source.expect("combine operand unresolved");
    apply2(c, asm, buf, op, size, first_source, second_source);

    c.next_read(first);
    c.next_read(second);

    // The destination register now holds the result.
    c.remove_site(second, second_source);
    if c.value(result).reads.is_some() {
        add_site(c, asm, buf, None, 0, result, second_source);
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_translate<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
    op: UnaryOp,
    size: u32,
    value: ValueId,
    result: ValueId,
) {
    let stack = c.event(e).stack;
    let source = c.value(value).source.expect("translate operand unresolved");
    maybe_preserve(c, asm, buf, stack, size, value, source);

    apply1(c, asm, buf, op, size, source);

    c.next_read(value);

    c.remove_site(value, source);
    if c.value(result).reads.is_some() {
        add_site(c, asm, buf, None, 0, result, source);
    }
}

fn compile_memory<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    base: ValueId,
    displacement: i32,
    index: Option<ValueId>,
    scale: u8,
    result: ValueId,
) {
    let word = asm.word_size();

    let base_source = c.value(base).source.expect("memory base unresolved");
    let base_number = match c.site_operand(base_source) {
        Operand::Register { low, .. } => low,
        _ => panic!("memory base must resolve to a register"),
    };

    let index_number = index.map(|i| {
        let s = c.value(i).source.expect("memory index unresolved");
        match c.site_operand(s) {
            Operand::Register { low, .. } => low,
            _ => panic!("memory index must resolve to a register"),
        }
    });

    c.next_read(base);
    if let Some(i) = index {
        // An index register carries a 32-bit quantity; widen it.
        if word == 8 {
            let s = c.value(i).source.unwrap();
            apply2(c, asm, buf, BinaryOp::MoveZ, 4, s, s);
        }
        c.next_read(i);
    }

    let site = memory_site(c, base_number, displacement, index_number, scale);
    c.value_mut(result).target = Some(site);
    add_site(c, asm, buf, None, 0, result, site);
}

#[allow(clippy::too_many_arguments)]
fn compile_call<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
    address: ValueId,
    flags: CallFlags,
    trace_handler: Option<Rc<dyn TraceHandler>>,
    result: ValueId,
    result_size: u32,
    argument_footprint: u32,
) {
    let word = asm.word_size();
    let stack = c.event(e).stack;

    push_now_prefix(c, asm, buf, stack);

    let op = if flags.contains(CallFlags::ALIGNED) {
        UnaryOp::AlignedCall
    } else {
        UnaryOp::Call
    };
    let address_source =
        c.value(address).source.expect("call address unresolved");
    apply1(c, asm, buf, op, word, address_source);

    if let Some(handler) = trace_handler {
        let promise = c.code_promise_at(buf.len());
        handler.handle_trace(promise);
    }

    let locals = c.event(e).locals;
    let reads = c.event(e).reads;
    clean_stack(c, asm, buf, stack, locals, reads);

    if result_size > 0 && c.value(result).reads.is_some() {
        let high = if result_size > word {
            Some(asm.return_high())
        } else {
            None
        };
        let low = asm.return_low();
        let site = register_site(c, low, high);
        add_site(c, asm, buf, None, result_size, result, site);
    }

    if argument_footprint > 0 && !flags.contains(CallFlags::NO_RETURN) {
        ignore_words(c, asm, buf, argument_footprint);
    }
}

fn compile_return<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    value: Option<ValueId>,
) {
    let word = asm.word_size();

    if let Some(v) = value {
        c.next_read(v);
    }

    let base = Operand::Register {
        low: c.base_register,
        high: None,
    };
    let stack = Operand::Register {
        low: c.stack_register,
        high: None,
    };
    apply2_raw(c, asm, buf, BinaryOp::Move, word, &base, &stack);
    apply1_raw(c, asm, buf, UnaryOp::Pop, word, &base);
    apply0_raw(c, asm, buf, NullaryOp::Return);
}

fn compile_branch<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: UnaryOp,
    address: ValueId,
) {
    let word = asm.word_size();
    let source = c.value(address).source.expect("branch target unresolved");
    apply1(c, asm, buf, op, word, source);

    c.next_read(address);
}

fn compile_push<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    entry: StackId,
    active: bool,
) {
    if active {
        push_now_prefix(c, asm, buf, Some(entry));
    }

    let value = c.stack_entry(entry).value;
    c.next_read(value);
}

fn compile_local<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    size: u32,
    local: LocalId,
) {
    // A dying shadowed binding may donate its sites to the new one.
    let mut donated: Option<SiteId> = None;
    if let Some(old) = c.local(local).old {
        let v = c.local(old).value;
        let read = c.value(v).reads.expect("shadowed local with no read");
        if c.local(old).reuse && c.read(read).next.is_none() {
            donated = c.value(v).sites;
        }
        c.next_read(v);
    }

    let v = c.local(local).value;
    if c.value(v).reads.is_some() {
        let mut s = donated;
        while let Some(id) = s {
            let next = c.site(id).next;
            if c.site_type(id) != OperandType::Memory {
                add_site(c, asm, buf, None, size, v, id);
            }
            s = next;
        }

        let site = c.local(local).site;
        add_site(c, asm, buf, None, size, v, site);
    }
}

fn compile_clobber_local<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    e: EventId,
    size: u32,
    local: LocalId,
) {
    let stack = c.event(e).stack;
    let mut l = Some(local);
    while let Some(id) = l {
        let v = c.local(id).value;
        let s = c.local(id).site;
        if let (Some(read), Some(head)) = (c.value(v).reads, c.value(v).sites)
        {
            if head == s && c.site(head).next.is_none() {
                preserve(c, asm, buf, stack, size, v, s, read);
            }
        }
        c.remove_site(v, s);
        l = c.local(id).old;
    }
}

fn compile_bounds_check<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    object: ValueId,
    length_offset: u32,
    index: ValueId,
    handler: i64,
) {
    let word = asm.word_size();

    // A constant index is vetted at compile time; negative means the
    // front-end handed us garbage.
    let mut constant: Option<i64> = None;
    let mut s = c.value(index).sites;
    while let Some(id) = s {
        if let crate::site::SiteKind::Constant { value } = &c.site(id).kind {
            let p = value.expect("unmarked label as bounds-check index");
            match c.promise(p) {
                Promise::Resolved { value } => constant = Some(*value),
                _ => panic!("bounds-check constant must be a literal"),
            }
            break;
        }
        s = c.site(id).next;
    }

    let next_promise = c.code_promise_unset();
    let mut out_of_bounds_promise = None;

    let index_source =
        c.value(index).source.expect("bounds-check index unresolved");

    match constant {
        Some(value) => {
            assert!(value >= 0, "constant index out of bounds");
        }
        None => {
            let out = c.code_promise_unset();
            out_of_bounds_promise = Some(out);

            let zero = resolved_site(c, 0);
            apply2(c, asm, buf, BinaryOp::Compare, 4, zero, index_source);

            let out_site = constant_site(c, out);
            apply1(c, asm, buf, UnaryOp::JumpIfLess, word, out_site);
        }
    }

    let object_source =
        c.value(object).source.expect("bounds-check object unresolved");
    let base = match c.site_operand(object_source) {
        Operand::Register { low, .. } => low,
        _ => panic!("bounds-check object must resolve to a register"),
    };

    let length =
        memory_site(c, base, length_offset as i32, None, 1);
    crate::site::site_acquire(c, asm, buf, length, None, 0, None);

    apply2(c, asm, buf, BinaryOp::Compare, word, index_source, length);

    c.site_release(length);

    let next_site = constant_site(c, next_promise);
    apply1(c, asm, buf, UnaryOp::JumpIfGreater, word, next_site);

    if let Some(out) = out_of_bounds_promise {
        c.set_promise_offset(out, buf.len());
    }

    let handler_site = resolved_site(c, handler);
    apply1(c, asm, buf, UnaryOp::Call, word, handler_site);

    c.set_promise_offset(next_promise, buf.len());

    c.next_read(object);
    c.next_read(index);
}

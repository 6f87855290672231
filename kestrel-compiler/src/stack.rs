//! The virtual stack: deferred pushes, materialization, and the sync
//! discipline that keeps join points honest.

use crate::context::{Context, LocalId, ReadId, StackEntry, StackId, ValueId};
use crate::site::{
    add_site, apply1, apply2_raw, target_or_register,
};
use kestrel_asm::{Assembler, BinaryOp, CodeBuffer, Imm, Operand, UnaryOp};
use log::trace;
use smallvec::SmallVec;

pub fn ceiling(value: u32, unit: u32) -> u32 {
    (value + unit - 1) / unit
}

/// Record a push of `v` onto the virtual stack. No machine push is
/// emitted until something forces materialization.
pub fn push_value(c: &mut Context, size: u32, v: ValueId) {
    let words = ceiling(size, c.word_size);
    assert!(words > 0);
    let entry = new_entry(c, v, words);
    crate::event::append_push(c, entry);
}

/// Allocate a stack entry above the current top.
pub fn new_entry(c: &mut Context, v: ValueId, words: u32) -> StackId {
    let next = c.stack;
    let index = match next {
        Some(n) => c.stack_entry(n).index + c.stack_entry(n).size,
        None => 0,
    };
    let id = c.add_stack_entry(StackEntry {
        value: v,
        size: words,
        index,
        next,
        push_event: None,
        push_site: None,
        pushed: false,
    });
    c.stack = Some(id);
    id
}

/// Bump the stack pointer past `count` words of dead stack content.
pub fn ignore_words<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    count: u32,
) {
    if count > 0 {
        let word = asm.word_size();
        let stack_register = c.stack_register;
        apply2_raw(
            c,
            asm,
            buf,
            BinaryOp::Add,
            word,
            &Operand::Constant {
                value: Imm::Value((count * word) as i64),
            },
            &Operand::Register {
                low: stack_register,
                high: None,
            },
        );
    }
}

/// Emit the deferred pushes for `count` entries starting at `start`,
/// deepest first. Each value loses its memory sites and gains a fresh
/// push-site; siteless values just reserve stack space.
pub fn push_now<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    start: StackId,
    count: u32,
) {
    let mut segment: SmallVec<[StackId; 8]> = SmallVec::new();
    let mut s = Some(start);
    for _ in 0..count {
        let id = s.expect("push segment shorter than count");
        segment.push(id);
        s = c.stack_entry(id).next;
    }

    let word = asm.word_size();
    for &id in segment.iter().rev() {
        assert!(!c.stack_entry(id).pushed);

        let v = c.stack_entry(id).value;
        let size = c.stack_entry(id).size;
        let index = c.stack_entry(id).index;

        if c.value(v).sites.is_some() {
            let (source, _) = c.pick(c.value(v).sites, None);
            let source = source.unwrap();

            c.remove_memory_site(v);

            let push_site = c.push_site_for_index(index);
            c.stack_entry_mut(id).push_site = Some(push_site);
            add_site(c, asm, buf, None, size * word, v, push_site);

            apply1(c, asm, buf, UnaryOp::Push, size * word, source);
        } else {
            let stack_register = c.stack_register;
            apply2_raw(
                c,
                asm,
                buf,
                BinaryOp::Subtract,
                word,
                &Operand::Constant {
                    value: Imm::Value((size * word) as i64),
                },
                &Operand::Register {
                    low: stack_register,
                    high: None,
                },
            );
        }

        trace!("pushed {id:?} value {v:?}");
        c.stack_entry_mut(id).pushed = true;
    }
}

/// Push the whole unpushed prefix starting at `start`.
pub fn push_now_prefix<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    start: Option<StackId>,
) {
    let mut count = 0;
    let mut s = start;
    while let Some(id) = s {
        if c.stack_entry(id).pushed {
            break;
        }
        count += 1;
        s = c.stack_entry(id).next;
    }
    if count > 0 {
        push_now(c, asm, buf, start.unwrap(), count);
    }
}

/// Unwind `count` words off the machine stack. Live values pop into
/// their preferred targets; dead stretches collapse into one
/// stack-pointer adjustment.
pub fn pop_now<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    count: u32,
    ignore: bool,
) {
    let word = asm.word_size();
    let mut s = stack;
    let mut ignored = 0u32;
    let mut remaining = count as i64;
    while remaining > 0 {
        let Some(id) = s else { break };
        let size = c.stack_entry(id).size;

        if c.stack_entry(id).pushed {
            let v = c.stack_entry(id).value;
            let push_site = c.stack_entry(id).push_site.unwrap();
            c.remove_site(v, push_site);
            c.stack_entry_mut(id).push_site = None;
            c.stack_entry_mut(id).pushed = false;

            if c.value(v).reads.is_some() && !ignore {
                ignore_words(c, asm, buf, ignored);
                ignored = 0;

                let target = target_or_register(c, v);
                trace!("pop {id:?} value {v:?} into {target:?}");
                add_site(c, asm, buf, stack, size * word, v, target);
                apply1(c, asm, buf, UnaryOp::Pop, size * word, target);
            } else {
                trace!("ignore {id:?} value {v:?}");
                ignored += size;
            }
        } else {
            trace!("{id:?} not pushed");
        }

        remaining -= size as i64;
        s = c.stack_entry(id).next;
    }

    ignore_words(c, asm, buf, ignored);
}

/// Release every operand site, restore stack values to their
/// push-sites, and retire the event's reads. Locals lose their reuse
/// privilege; anything live across this point must reload.
pub fn clean_stack<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    locals: Option<LocalId>,
    reads: Option<ReadId>,
) {
    let word = asm.word_size();

    let mut l = locals;
    while let Some(id) = l {
        c.local_mut(id).reuse = false;
        l = c.local(id).next;
    }

    let mut s = stack;
    while let Some(id) = s {
        let v = c.stack_entry(id).value;
        c.clear_sites(v);
        s = c.stack_entry(id).next;
    }

    let mut s = stack;
    while let Some(id) = s {
        if let Some(push_site) = c.stack_entry(id).push_site {
            let v = c.stack_entry(id).value;
            let size = c.stack_entry(id).size;
            add_site(c, asm, buf, None, size * word, v, push_site);
        }
        s = c.stack_entry(id).next;
    }

    let mut r = reads;
    while let Some(id) = r {
        let v = c.read(id).value;
        c.next_read(v);
        r = c.read(id).event_next;
    }
}

/// Replace every stack entry's value with a fresh one homed solely at
/// its push-site. Run after terminators so every join path sees the
/// stack in memory.
pub fn reset_stack(c: &mut Context) {
    let mut old: SmallVec<[StackId; 8]> = SmallVec::new();
    let mut s = c.stack;
    while let Some(id) = s {
        old.push(id);
        s = c.stack_entry(id).next;
    }

    let mut prev: Option<StackId> = None;
    for &old_id in &old {
        let size = c.stack_entry(old_id).size;
        let index = c.stack_entry(old_id).index;

        let v = c.new_value(None, None);
        let site = c.push_site_for_index(index);
        c.value_mut(v).sites = Some(site);

        let id = c.add_stack_entry(StackEntry {
            value: v,
            size,
            index,
            next: None,
            push_event: None,
            push_site: Some(site),
            pushed: true,
        });

        match prev {
            None => c.stack = Some(id),
            Some(p) => c.stack_entry_mut(p).next = Some(id),
        }
        prev = Some(id);
    }

    reset_locals(c);

    c.stack_reset = true;
}

/// Forget every local binding.
pub fn reset_locals(c: &mut Context) {
    let mut l = c.locals;
    while let Some(id) = l {
        let index = c.local(id).index;
        c.local_table[index as usize] = None;
        l = c.local(id).next;
    }
    c.locals = None;
}

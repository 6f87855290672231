//! The compile driver: source resolution, per-event emission, and
//! junction repair.

use crate::context::{Context, ReadId, SiteId, StackId};
use crate::event::{append_stack_sync_junction, compile_event};
use crate::site::{add_site, apply1_raw, apply2, apply2_raw, read_target};
use kestrel_asm::{Assembler, BinaryOp, CodeBuffer, Imm, Operand, UnaryOp};
use log::trace;
use smallvec::SmallVec;

/// Choose the site a read consumes, inserting a move when nothing
/// already satisfies the read's target.
pub fn read_source<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    r: ReadId,
) -> Option<SiteId> {
    let v = c.read(r).value;
    c.value(v).sites?;

    let target = match c.read(r).target {
        Some(t) => read_target(c, t, r),
        None => None,
    };

    let (site, cost) = c.pick(c.value(v).sites, target);

    match target {
        Some(t) if cost != 0 => {
            let size = c.read(r).size;
            add_site(c, asm, buf, stack, size, v, t);
            apply2(c, asm, buf, BinaryOp::Move, size, site.unwrap(), t);
            Some(t)
        }
        _ => site,
    }
}

/// Walk every logical instruction's events in order: emit the
/// prologue, resolve each event's reads (freezing the chosen sources
/// so one operand cannot evict another), run the event, and record
/// code-promise offsets.
pub fn compile<A: Assembler>(c: &mut Context, asm: &A, buf: &mut CodeBuffer) {
    let word = asm.word_size();

    let base = Operand::Register {
        low: c.base_register,
        high: None,
    };
    let stack_pointer = Operand::Register {
        low: c.stack_register,
        high: None,
    };
    apply1_raw(c, asm, buf, UnaryOp::Push, word, &base);
    apply2_raw(c, asm, buf, BinaryOp::Move, word, &stack_pointer, &base);

    let stack_offset = c.stack_offset();
    if stack_offset > 0 {
        apply2_raw(
            c,
            asm,
            buf,
            BinaryOp::Subtract,
            word,
            &Operand::Constant {
                value: Imm::Value((stack_offset * word) as i64),
            },
            &stack_pointer,
        );
    }

    for ip in 0..c.logical_code.len() {
        let Some(first) = c.logical_code[ip].first_event else {
            continue;
        };
        c.logical_code[ip].machine_offset = buf.len();
        trace!("compile ip {ip}");

        let mut e = Some(first);
        while let Some(id) = e {
            // A reset stack enters the event with each slot homed at
            // its push-site; re-acquire those holds.
            if c.event(id).stack_reset {
                let mut s = c.event(id).stack;
                while let Some(entry) = s {
                    let v = c.stack_entry(entry).value;
                    let size = c.stack_entry(entry).size;
                    if let Some(site) = c.value(v).sites {
                        assert!(c.site(site).next.is_none());
                        crate::site::site_acquire(
                            c,
                            asm,
                            buf,
                            site,
                            None,
                            size * word,
                            Some(v),
                        );
                    }
                    s = c.stack_entry(entry).next;
                }
            }

            let mut frozen: SmallVec<[SiteId; 8]> = SmallVec::new();
            let mut r = c.event(id).reads;
            while let Some(read) = r {
                let stack = c.event(id).stack;
                let source = read_source(c, asm, buf, stack, read);
                let v = c.read(read).value;
                c.value_mut(v).source = source;
                if let Some(s) = source {
                    c.site_freeze(s);
                    frozen.push(s);
                }
                r = c.read(read).event_next;
            }

            compile_event(c, asm, buf, id);

            while let Some(s) = frozen.pop() {
                c.site_thaw(s);
            }

            let mut p = c.event(id).promises;
            while let Some(promise) = p {
                c.set_promise_offset(promise, buf.len());
                p = match c.promise(promise) {
                    crate::promise::Promise::Code { next, .. } => *next,
                    _ => None,
                };
            }

            e = c.event(id).next;
        }
    }

    c.code_length = buf.len();
}

/// After recording, give every junction predecessor a trailing stack
/// sync built from its own snapshots, so each entry path delivers the
/// stack in memory.
pub fn update_junctions(c: &mut Context) {
    for i in 0..c.junctions.len() {
        let ip = c.junctions[i];
        let pred_ip = c.logical_code[ip as usize]
            .immediate_predecessor
            .expect("junction without a predecessor");
        let pred = &c.logical_code[pred_ip as usize];
        let last = pred.last_event.expect("junction predecessor is empty");
        let sequence = c.event(last).sequence;
        let stack = pred.stack;
        let locals = pred.locals;

        let sync = append_stack_sync_junction(c, sequence, stack, locals);
        c.event_mut(last).next = Some(sync);
        c.logical_code[pred_ip as usize].last_event = Some(sync);
    }
}

/// Note that control can flow from the current logical ip into `ip`.
pub fn visit(c: &mut Context, ip: u32) {
    assert!((ip as usize) < c.logical_code.len());

    if c.logical_ip.is_some() && !c.stack_reset {
        assert!(
            c.logical_code[ip as usize].immediate_predecessor.is_none(),
            "logical ip {ip} already has a predecessor"
        );
        c.logical_code[ip as usize].immediate_predecessor = c.logical_ip;
    }
}

/// Snapshot the current stack and locals into the current logical
/// instruction, once.
pub fn save_stack(c: &mut Context) {
    if let Some(ip) = c.logical_ip {
        if !c.logical_code[ip as usize].stack_saved {
            let stack = c.stack;
            let locals = c.locals;
            let li = &mut c.logical_code[ip as usize];
            li.stack_saved = true;
            li.stack = stack;
            li.locals = locals;
        }
    }
}

//! On-demand register allocation: acquire, steal, replace, swap.

use crate::context::{Context, RegId, SiteId, StackId, ValueId};
use crate::site::SiteKind;
use crate::stack::push_now;
use kestrel_asm::{
    Assembler, BinaryOp, Client, CodeBuffer, Operand, UnaryOp,
};
use log::trace;

/// Exchange two registers' contents and machine numbers. Sites keep
/// their `RegId` handles and observe the new numbers on sync.
pub fn swap<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    a: RegId,
    b: RegId,
) {
    assert!(a != b);
    let an = c.register(a).number;
    let bn = c.register(b).number;
    let word = asm.word_size();
    {
        let mut client = RegClient { c: &mut *c, asm };
        asm.apply2(
            buf,
            BinaryOp::Swap,
            word,
            &Operand::Register {
                low: an,
                high: None,
            },
            &Operand::Register {
                low: bn,
                high: None,
            },
            &mut client,
        );
    }
    c.swap_register_numbers(a, b);
}

/// Move `r`'s occupant to a different register and swap, freeing `r`'s
/// machine number for the caller. Used when the picked register is
/// pinned by memory-site refcounts, or to honor a frozen site's mask.
pub fn replace<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    r: RegId,
) -> RegId {
    let mask = if c.register(r).freeze_count > 0 {
        let site = c.register(r).site.expect("frozen register with no site");
        match c.site(site).kind {
            SiteKind::Register { mask, .. } => (mask & 0xffff_ffff) as u32,
            _ => unreachable!(),
        }
    } else {
        !0u32
    };

    let size = c.register(r).size;
    let value = c.register(r).value;
    let site = c.register(r).site;

    c.freeze_register(r);
    let s = acquire(
        c,
        asm,
        buf,
        mask,
        stack,
        size,
        value.expect("replacing an unowned register"),
        site.expect("replacing a register with no site"),
    );
    c.thaw_register(r);

    trace!(
        "replace {} with {}",
        c.register(r).number,
        c.register(s).number
    );

    swap(c, asm, buf, r, s);

    s
}

/// Evict `r`'s occupant without moving it: drop this register site if
/// the value lives elsewhere, or materialize its deferred push so the
/// push-site becomes the surviving home. Fails if the value has no
/// other site and is not on the pending stack.
fn try_steal<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    r: RegId,
    stack: Option<StackId>,
) -> bool {
    assert!(c.register(r).ref_count == 0);

    let v = c.register(r).value.expect("stealing an unowned register");
    let sites_head = c.value(v).sites.expect("owned register, siteless value");

    trace!(
        "try steal {} from {v:?}",
        c.register(r).number
    );

    if c.site(sites_head).next.is_none() {
        // Sole site: look for the value on the unpushed stack prefix.
        let mut start: Option<StackId> = None;
        let mut count = 0;
        let mut s = stack;
        while let Some(id) = s {
            if c.stack_entry(id).pushed {
                break;
            }
            if c.stack_entry(id).value == v {
                start = Some(id);
            }
            if start.is_some() {
                count += 1;
            }
            s = c.stack_entry(id).next;
        }

        match start {
            Some(start) => push_now(c, asm, buf, start, count),
            None => {
                trace!(
                    "unable to steal {} from {v:?}",
                    c.register(r).number
                );
                return false;
            }
        }
    }

    let site = c.register(r).site.unwrap();
    c.remove_site(v, site);

    true
}

/// Claim a register in `mask` for `value`, evicting as needed, and
/// record the new ownership.
pub fn acquire<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    mask: u32,
    stack: Option<StackId>,
    new_size: u32,
    new_value: ValueId,
    new_site: SiteId,
) -> RegId {
    let mut r = c.pick_register(mask);

    if c.register(r).reserved {
        return r;
    }

    trace!(
        "acquire {} for {new_value:?}, freeze {} ref {}",
        c.register(r).number,
        c.register(r).freeze_count,
        c.register(r).ref_count
    );

    if c.register(r).ref_count > 0 {
        r = replace(c, asm, buf, stack, r);
    } else {
        let old_value = c.register(r).value;
        if let Some(old) = old_value {
            let old_site = c.register(r).site.unwrap();
            if old != new_value && c.find_site(old, old_site) {
                if !try_steal(c, asm, buf, r, stack) {
                    r = replace(c, asm, buf, stack, r);
                }
            }
        }
    }

    let reg = c.register_mut(r);
    reg.size = new_size;
    reg.value = Some(new_value);
    reg.site = Some(new_site);

    r
}

/// Ensure `site` occupies a register satisfying `mask`, reusing
/// `current` when it already does, else acquiring a new register and
/// moving the value across.
#[allow(clippy::too_many_arguments)]
pub fn validate<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    mask: u32,
    stack: Option<StackId>,
    size: u32,
    value: ValueId,
    site: SiteId,
    current: Option<RegId>,
) -> RegId {
    if let Some(cur) = current {
        if mask & (1u32 << c.register(cur).number) != 0 {
            let reg = c.register(cur);
            if reg.reserved || reg.value == Some(value) {
                return cur;
            }
            if reg.value.is_none() {
                let reg = c.register_mut(cur);
                reg.size = size;
                reg.value = Some(value);
                reg.site = Some(site);
                return cur;
            }
            panic!(
                "register {} already owned during validate",
                c.register(cur).number
            );
        }
    }

    let r = acquire(c, asm, buf, mask, stack, size, value, site);

    if let Some(cur) = current {
        if cur != r {
            c.release_register(cur);
            let word = asm.word_size();
            let src = Operand::Register {
                low: c.register(cur).number,
                high: None,
            };
            let dst = Operand::Register {
                low: c.register(r).number,
                high: None,
            };
            let mut client = RegClient { c, asm };
            asm.apply2(buf, BinaryOp::Move, word, &src, &dst, &mut client);
        }
    }

    r
}

/// The allocator-side implementation of the assembler's scratch
/// protocol: temporaries are carved out by pushing the current
/// occupant and restored on release.
pub struct RegClient<'a, A: Assembler> {
    pub c: &'a mut Context,
    pub asm: &'a A,
}

impl<A: Assembler> Client for RegClient<'_, A> {
    fn acquire_temporary(&mut self, buf: &mut CodeBuffer, mask: u32) -> u8 {
        let r = self.c.pick_register(mask);
        let number = self.c.register(r).number;
        self.save(buf, number);
        self.c.increment(number);
        number
    }

    fn release_temporary(&mut self, buf: &mut CodeBuffer, number: u8) {
        let r = self.c.reg_by_number(number);
        self.c.decrement(r);
        self.restore(buf, number);
    }

    fn save(&mut self, buf: &mut CodeBuffer, number: u8) {
        let r = self.c.reg_by_number(number);
        let reg = self.c.register(r);
        if reg.ref_count > 0 || reg.value.is_some() {
            let asm = self.asm;
            let word = asm.word_size();
            asm.apply1(
                buf,
                UnaryOp::Push,
                word,
                &Operand::Register {
                    low: number,
                    high: None,
                },
                self,
            );
            self.c.register_mut(r).pushed = true;
        }
    }

    fn restore(&mut self, buf: &mut CodeBuffer, number: u8) {
        let r = self.c.reg_by_number(number);
        if self.c.register(r).pushed {
            let asm = self.asm;
            let word = asm.word_size();
            asm.apply1(
                buf,
                UnaryOp::Pop,
                word,
                &Operand::Register {
                    low: number,
                    high: None,
                },
                self,
            );
            self.c.register_mut(r).pushed = false;
        }
    }
}

//! Sites: the places a value can live, and the cost model that picks
//! between them.

use crate::context::{Context, ReadId, RegId, SiteId, StackId, ValueId};
use crate::promise::Promise;
use crate::regalloc::{self, RegClient};
use kestrel_asm::{
    Assembler, CodeBuffer, Imm, Operand, OperandType, PromiseId, ANY_REG,
};
use log::trace;

/// Where a value lives, or a record-phase placeholder describing where
/// it will be allowed to live.
#[derive(Debug, Clone)]
pub enum SiteKind {
    /// A late-bound integer. `None` until a label is marked.
    Constant { value: Option<PromiseId> },
    /// A late-bound absolute address.
    Address { address: PromiseId },
    /// One or two machine registers, constrained by `mask` (high 32
    /// bits constrain the high register). `low`/`high` bind on
    /// acquisition.
    Register {
        mask: u64,
        low: Option<RegId>,
        high: Option<RegId>,
    },
    /// A memory operand. `base_reg`/`index_reg` are refcount handles
    /// taken on acquisition; operand numbers re-sync from them so a
    /// register swap cannot go stale.
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
        base_reg: Option<RegId>,
        index_reg: Option<RegId>,
    },
    /// Record-phase constraint: resolves to a concrete site when the
    /// consuming event compiles. Never emitted.
    Virtual {
        value: Option<ValueId>,
        type_mask: u8,
        register_mask: u64,
    },
    /// Record-phase placeholder standing for a deferred push.
    Push { event: crate::context::EventId },
}

#[derive(Debug, Clone)]
pub struct Site {
    pub kind: SiteKind,
    pub next: Option<SiteId>,
}

// -- Constructors --

pub fn constant_site(c: &mut Context, promise: PromiseId) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Constant {
            value: Some(promise),
        },
        next: None,
    })
}

pub fn resolved_site(c: &mut Context, value: i64) -> SiteId {
    let p = c.resolved(value);
    constant_site(c, p)
}

/// A constant site with no promise yet; labels start this way and are
/// filled in by `mark`.
pub fn unresolved_constant_site(c: &mut Context) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Constant { value: None },
        next: None,
    })
}

pub fn address_site(c: &mut Context, address: PromiseId) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Address { address },
        next: None,
    })
}

/// A register site bound to specific machine numbers, any mask.
pub fn register_site(c: &mut Context, low: u8, high: Option<u8>) -> SiteId {
    assert!(low < c.register_count());
    let low_reg = c.reg_by_number(low);
    let high_reg = high.map(|h| {
        assert!(h < c.register_count());
        c.reg_by_number(h)
    });
    c.alloc_site(Site {
        kind: SiteKind::Register {
            mask: ANY_REG,
            low: Some(low_reg),
            high: high_reg,
        },
        next: None,
    })
}

/// An unbound register site constrained to `mask`.
pub fn free_register_site(c: &mut Context, mask: u64) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Register {
            mask,
            low: None,
            high: None,
        },
        next: None,
    })
}

/// An unbound register site pinned to exact machine numbers.
pub fn fixed_register_site(c: &mut Context, low: u8, high: Option<u8>) -> SiteId {
    let mask = match high {
        None => (ANY_REG << 32) | (1u64 << low),
        Some(h) => (1u64 << (h + 32)) | (1u64 << low),
    };
    free_register_site(c, mask)
}

pub fn memory_site(
    c: &mut Context,
    base: u8,
    offset: i32,
    index: Option<u8>,
    scale: u8,
) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Memory {
            base,
            offset,
            index,
            scale,
            base_reg: None,
            index_reg: None,
        },
        next: None,
    })
}

pub fn virtual_site(
    c: &mut Context,
    value: Option<ValueId>,
    type_mask: u8,
    register_mask: u64,
) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Virtual {
            value,
            type_mask,
            register_mask,
        },
        next: None,
    })
}

pub fn any_register_site(c: &mut Context) -> SiteId {
    virtual_site(c, None, OperandType::Register.mask(), ANY_REG)
}

pub fn register_or_constant_site(c: &mut Context) -> SiteId {
    virtual_site(
        c,
        None,
        OperandType::Register.mask() | OperandType::Constant.mask(),
        ANY_REG,
    )
}

pub fn push_placeholder_site(
    c: &mut Context,
    event: crate::context::EventId,
) -> SiteId {
    c.alloc_site(Site {
        kind: SiteKind::Push { event },
        next: None,
    })
}

// -- Pure capabilities --

impl Context {
    pub fn site_type(&self, s: SiteId) -> OperandType {
        match &self.site(s).kind {
            SiteKind::Constant { .. } => OperandType::Constant,
            SiteKind::Address { .. } => OperandType::Address,
            SiteKind::Register { .. } => OperandType::Register,
            SiteKind::Memory { .. } => OperandType::Memory,
            SiteKind::Virtual { .. } | SiteKind::Push { .. } => {
                panic!("placeholder site has no operand type")
            }
        }
    }

    /// Current machine numbers of a memory site: acquired sites track
    /// their registers through swaps, raw sites report as built.
    fn memory_numbers(&self, s: SiteId) -> (u8, i32, Option<u8>, u8) {
        match &self.site(s).kind {
            SiteKind::Memory {
                base,
                offset,
                index,
                scale,
                base_reg,
                index_reg,
            } => {
                let b = base_reg
                    .map(|r| self.register(r).number)
                    .unwrap_or(*base);
                let i = match (index_reg, index) {
                    (Some(r), _) => Some(self.register(*r).number),
                    (None, i) => *i,
                };
                (b, *offset, i, *scale)
            }
            _ => unreachable!(),
        }
    }

    fn register_numbers(&self, s: SiteId) -> (u8, Option<u8>) {
        match &self.site(s).kind {
            SiteKind::Register { low, high, .. } => {
                let low = low.expect("register site not acquired");
                (
                    self.register(low).number,
                    high.map(|h| self.register(h).number),
                )
            }
            _ => unreachable!(),
        }
    }

    /// Estimated cost of copying from `s` into `target`; 0 when the
    /// value is already where it needs to be. Advisory only.
    pub fn copy_cost(&self, s: SiteId, target: Option<SiteId>) -> u32 {
        if target == Some(s) {
            return 0;
        }
        match &self.site(s).kind {
            SiteKind::Constant { .. } => 1,
            SiteKind::Address { .. } => 3,
            SiteKind::Register { .. } => {
                let (low, high) = self.register_numbers(s);
                if let Some(t) = target {
                    if let SiteKind::Register { mask, .. } = &self.site(t).kind
                    {
                        let low_ok = mask & (1u64 << low) != 0;
                        let high_ok = match high {
                            None => true,
                            Some(h) => mask & (1u64 << (h + 32)) != 0,
                        };
                        if low_ok && high_ok {
                            return 0;
                        }
                    }
                }
                2
            }
            SiteKind::Memory { .. } => {
                if let Some(t) = target {
                    if let SiteKind::Memory { .. } = &self.site(t).kind {
                        if self.memory_numbers(s) == self.memory_numbers(t) {
                            return 0;
                        }
                    }
                }
                4
            }
            SiteKind::Virtual { .. } | SiteKind::Push { .. } => {
                panic!("placeholder site has no copy cost")
            }
        }
    }

    /// Whether `s` satisfies a (type, register) constraint pair.
    pub fn site_matches(
        &self,
        s: SiteId,
        type_mask: u8,
        register_mask: u64,
    ) -> bool {
        let t = self.site_type(s);
        if t.mask() & type_mask == 0 {
            return false;
        }
        if t != OperandType::Register {
            return true;
        }
        match &self.site(s).kind {
            SiteKind::Register { low: None, .. } => false,
            _ => {
                let (low, high) = self.register_numbers(s);
                register_mask & (1u64 << low) != 0
                    && match high {
                        None => true,
                        Some(h) => register_mask & (1u64 << (h + 32)) != 0,
                    }
            }
        }
    }

    /// The concrete operand for an acquired site.
    pub fn site_operand(&self, s: SiteId) -> Operand {
        match &self.site(s).kind {
            SiteKind::Constant { value } => Operand::Constant {
                value: self.imm_of(
                    value.expect("constant site used before its label"),
                ),
            },
            SiteKind::Address { address } => Operand::Address {
                address: self.imm_of(*address),
            },
            SiteKind::Register { .. } => {
                let (low, high) = self.register_numbers(s);
                Operand::Register { low, high }
            }
            SiteKind::Memory { .. } => {
                let (base, offset, index, scale) = self.memory_numbers(s);
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                }
            }
            SiteKind::Virtual { .. } | SiteKind::Push { .. } => {
                panic!("placeholder site emitted")
            }
        }
    }

    fn imm_of(&self, p: PromiseId) -> Imm {
        match self.promise(p) {
            Promise::Resolved { value } => Imm::Value(*value),
            _ => Imm::Deferred(p),
        }
    }

    /// Drop a site's hold on its backing resources.
    pub fn site_release(&mut self, s: SiteId) {
        match self.site(s).kind.clone() {
            SiteKind::Register { low, high, .. } => {
                let low = low.expect("releasing unacquired register site");
                self.release_register(low);
                if let Some(h) = high {
                    self.release_register(h);
                }
            }
            SiteKind::Memory {
                base_reg,
                index_reg,
                ..
            } => {
                if let Some(b) = base_reg {
                    self.decrement(b);
                }
                if let Some(i) = index_reg {
                    self.decrement(i);
                }
            }
            _ => {}
        }
    }

    pub fn site_freeze(&mut self, s: SiteId) {
        if let SiteKind::Register { low, high, .. } = self.site(s).kind {
            let low = low.expect("freezing unacquired register site");
            self.freeze_register(low);
            if let Some(h) = high {
                self.freeze_register(h);
            }
        }
    }

    pub fn site_thaw(&mut self, s: SiteId) {
        if let SiteKind::Register { low, high, .. } = self.site(s).kind {
            let low = low.expect("thawing unacquired register site");
            self.thaw_register(low);
            if let Some(h) = high {
                self.thaw_register(h);
            }
        }
    }

    /// The best site among `sites` for reaching `target`, with its
    /// cost. Ties go to the earlier list entry.
    pub fn pick(
        &self,
        sites: Option<SiteId>,
        target: Option<SiteId>,
    ) -> (Option<SiteId>, u32) {
        let mut best = None;
        let mut best_cost = u32::MAX;
        let mut s = sites;
        while let Some(id) = s {
            let cost = self.copy_cost(id, target);
            if cost < best_cost {
                best = Some(id);
                best_cost = cost;
            }
            s = self.site(id).next;
        }
        (best, best_cost)
    }
}

// -- Target resolution --

/// Resolve a read's target hint to a concrete site, or `None` when the
/// read imposes no placement.
pub fn read_target(c: &mut Context, s: SiteId, read: ReadId) -> Option<SiteId> {
    match c.site(s).kind.clone() {
        SiteKind::Virtual {
            value,
            type_mask,
            register_mask,
        } => {
            if let Some(v) = value {
                if let Some(t) = target_or_null_value(c, v) {
                    if c.site_matches(t, type_mask, register_mask) {
                        return Some(t);
                    }
                }
            }

            let read_value = c.read(read).value;
            let mut site = None;
            let mut cost = u32::MAX;
            let mut cur = c.value(read_value).sites;
            while let Some(id) = cur {
                if c.site_matches(id, type_mask, register_mask) {
                    let v = c.copy_cost(id, None);
                    if v < cost {
                        site = Some(id);
                        cost = v;
                    }
                }
                cur = c.site(id).next;
            }

            if site.is_some() {
                site
            } else {
                assert!(
                    type_mask & OperandType::Register.mask() != 0,
                    "unsatisfiable read constraint"
                );
                Some(free_register_site(c, register_mask))
            }
        }
        SiteKind::Push { event } => {
            let next = c.read(read).next;
            match next {
                Some(n) if !c.event(event).push_active() => {
                    target_or_null_read(c, n)
                }
                _ => None,
            }
        }
        _ => Some(s),
    }
}

/// A read's preferred destination: the value's target if any, else the
/// read's own hint.
pub fn target_or_null_read(c: &mut Context, r: ReadId) -> Option<SiteId> {
    let v = c.read(r).value;
    if let Some(t) = c.value(v).target {
        return Some(t);
    }
    match c.read(r).target {
        Some(t) => read_target(c, t, r),
        None => None,
    }
}

/// A value's preferred destination, consulting its next read.
pub fn target_or_null_value(c: &mut Context, v: ValueId) -> Option<SiteId> {
    if let Some(t) = c.value(v).target {
        return Some(t);
    }
    if let Some(r) = c.value(v).reads {
        if c.read(r).target.is_some() {
            let t = c.read(r).target.unwrap();
            return read_target(c, t, r);
        }
    }
    None
}

/// A value's preferred destination, or a fresh register site.
pub fn target_or_register(c: &mut Context, v: ValueId) -> SiteId {
    match target_or_null_value(c, v) {
        Some(t) => t,
        None => free_register_site(c, ANY_REG),
    }
}

// -- Acquisition --

/// Claim a site's backing resources for `v`, evicting or spilling
/// current residents as needed. Register acquisition may emit code.
pub fn site_acquire<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    s: SiteId,
    stack: Option<StackId>,
    size: u32,
    v: Option<ValueId>,
) {
    match c.site(s).kind.clone() {
        SiteKind::Register { mask, low, high } => {
            let value = v.expect("register site needs an owner");
            let word = asm.word_size();
            let lo = regalloc::validate(
                c,
                asm,
                buf,
                (mask & 0xffff_ffff) as u32,
                stack,
                size,
                value,
                s,
                low,
            );
            if let SiteKind::Register { low, .. } = &mut c.site_mut(s).kind {
                *low = Some(lo);
            }
            if size > word {
                c.freeze_register(lo);
                let hi = regalloc::validate(
                    c,
                    asm,
                    buf,
                    (mask >> 32) as u32,
                    stack,
                    size,
                    value,
                    s,
                    high,
                );
                c.thaw_register(lo);
                if let SiteKind::Register { high, .. } =
                    &mut c.site_mut(s).kind
                {
                    *high = Some(hi);
                }
            }
        }
        SiteKind::Memory { base, index, .. } => {
            let base_reg = c.increment(base);
            let index_reg = index.map(|i| c.increment(i));
            if let SiteKind::Memory {
                base_reg: b,
                index_reg: i,
                ..
            } = &mut c.site_mut(s).kind
            {
                *b = Some(base_reg);
                *i = index_reg;
            }
        }
        _ => {}
    }
}

/// Add `s` to `v`'s site list, acquiring its resources, unless the
/// value already lists it.
pub fn add_site<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    stack: Option<StackId>,
    size: u32,
    v: ValueId,
    s: SiteId,
) {
    if !c.find_site(v, s) {
        trace!("add site {s:?} to {v:?}");
        site_acquire(c, asm, buf, s, stack, size, Some(v));
        let head = c.value(v).sites;
        c.site_mut(s).next = head;
        c.value_mut(v).sites = Some(s);
    }
}

// -- Site-based emission --

pub fn apply1<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: kestrel_asm::UnaryOp,
    size: u32,
    a: SiteId,
) {
    let operand = c.site_operand(a);
    let mut client = RegClient { c, asm };
    asm.apply1(buf, op, size, &operand, &mut client);
}

pub fn apply2<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: kestrel_asm::BinaryOp,
    size: u32,
    a: SiteId,
    b: SiteId,
) {
    let a_operand = c.site_operand(a);
    let b_operand = c.site_operand(b);
    let mut client = RegClient { c, asm };
    asm.apply2(buf, op, size, &a_operand, &b_operand, &mut client);
}

/// Emission with raw operands, for the prologue and stack-pointer
/// arithmetic that bypasses the site machinery.
pub fn apply0_raw<A: Assembler>(
    _c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: kestrel_asm::NullaryOp,
) {
    asm.apply0(buf, op);
}

pub fn apply1_raw<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: kestrel_asm::UnaryOp,
    size: u32,
    a: &Operand,
) {
    let mut client = RegClient { c, asm };
    asm.apply1(buf, op, size, a, &mut client);
}

pub fn apply2_raw<A: Assembler>(
    c: &mut Context,
    asm: &A,
    buf: &mut CodeBuffer,
    op: kestrel_asm::BinaryOp,
    size: u32,
    a: &Operand,
    b: &Operand,
) {
    let mut client = RegClient { c, asm };
    asm.apply2(buf, op, size, a, b, &mut client);
}

/// Constrain a virtual site's type mask in place.
pub fn restrict_type_mask(c: &mut Context, s: SiteId, allowed: u8) {
    if let SiteKind::Virtual { type_mask, .. } = &mut c.site_mut(s).kind {
        *type_mask &= allowed;
    }
}

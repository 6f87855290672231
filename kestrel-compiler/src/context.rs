//! Compilation context: arenas for every compiler object and the pure
//! bookkeeping that runs over them.
//!
//! Objects are addressed by `u32` newtype ids into per-kind vectors
//! and linked through `Option<...Id>` fields, so values, sites, and
//! registers can reference each other freely; everything is dropped
//! together when the context goes away.

use crate::event::Event;
use crate::promise::Promise;
use crate::site::{Site, SiteKind};
use kestrel_asm::{OperandType, PromiseId};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

/// Stable identity of a register slot. Machine numbers move between
/// slots when the allocator swaps two registers; sites hold `RegId`s
/// and re-read the current number when forming operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegId(pub u32);

/// A virtual result: produced once, consumed by an ordered list of
/// reads, resident in zero or more sites at any moment.
#[derive(Debug, Clone)]
pub struct Value {
    /// Head of the pending read list; the next use.
    pub reads: Option<ReadId>,
    pub last_read: Option<ReadId>,
    /// Head of the current site list.
    pub sites: Option<SiteId>,
    /// Source site chosen for the currently compiling event.
    pub source: Option<SiteId>,
    /// Preferred destination site.
    pub target: Option<SiteId>,
}

/// One future use of a value by an event.
#[derive(Debug, Clone)]
pub struct Read {
    pub size: u32,
    pub value: ValueId,
    pub target: Option<SiteId>,
    /// Next read of the same value, in event-sequence order.
    pub next: Option<ReadId>,
    pub event: EventId,
    /// Next read belonging to the same event.
    pub event_next: Option<ReadId>,
}

/// One machine register.
#[derive(Debug, Clone)]
pub struct Register {
    pub number: u8,
    pub value: Option<ValueId>,
    pub site: Option<SiteId>,
    pub size: u32,
    /// Memory sites naming this register as base or index.
    pub ref_count: u32,
    /// Guards against stealing during one event's source resolution.
    pub freeze_count: u32,
    pub reserved: bool,
    /// Saved on the machine stack by the assembler client.
    pub pushed: bool,
}

impl Register {
    fn new(number: u8) -> Self {
        Self {
            number,
            value: None,
            site: None,
            size: 0,
            ref_count: 0,
            freeze_count: 0,
            reserved: false,
            pushed: false,
        }
    }
}

/// One virtual stack slot, top-first.
#[derive(Debug, Clone)]
pub struct StackEntry {
    pub value: ValueId,
    /// Size in words.
    pub size: u32,
    /// Distance from the bottom of the stack, in words.
    pub index: u32,
    pub next: Option<StackId>,
    pub push_event: Option<EventId>,
    pub push_site: Option<SiteId>,
    /// Whether the machine stack pointer has actually moved.
    pub pushed: bool,
}

/// A local-variable binding. A store shadows the previous binding;
/// `old` chains shadowed bindings until a clobber releases them.
#[derive(Debug, Clone)]
pub struct LocalSlot {
    /// Size in words.
    pub size: u32,
    pub index: u32,
    pub reuse: bool,
    pub value: ValueId,
    pub site: SiteId,
    pub old: Option<LocalId>,
    pub next: Option<LocalId>,
}

/// Per-front-end-instruction state.
#[derive(Debug, Clone, Default)]
pub struct LogicalInstruction {
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub immediate_predecessor: Option<u32>,
    pub stack: Option<StackId>,
    pub locals: Option<LocalId>,
    pub machine_offset: usize,
    pub stack_saved: bool,
}

/// All state for one compilation.
pub struct Context {
    pub word_size: u32,

    pub values: Vec<Value>,
    pub sites: Vec<Site>,
    pub reads: Vec<Read>,
    pub events: Vec<Event>,
    pub stack_entries: Vec<StackEntry>,
    pub local_slots: Vec<LocalSlot>,
    pub promises: Vec<Promise>,

    registers: Vec<Register>,
    by_number: Vec<RegId>,

    pub logical_code: Vec<LogicalInstruction>,
    pub logical_ip: Option<u32>,
    /// Current virtual stack top.
    pub stack: Option<StackId>,
    saved_states: Vec<Option<StackId>>,

    /// Parameter area size in words.
    pub parameter_footprint: u32,
    /// Local area size in words (parameters included).
    pub local_footprint: u32,

    /// Constant-pool entries, in key order.
    pub pool: Vec<PromiseId>,
    pub next_sequence: u32,
    /// Logical ips with more than one predecessor.
    pub junctions: Vec<u32>,
    /// Base address of the placed machine code.
    pub machine_code: Option<i64>,
    /// Final emitted code length, recorded by the compile driver.
    pub code_length: usize,

    pub locals: Option<LocalId>,
    pub local_table: Vec<Option<LocalId>>,
    pub stack_reset: bool,

    pub base_register: u8,
    pub stack_register: u8,
    pub thread_register: u8,
}

impl Context {
    pub fn new(
        word_size: u32,
        register_count: u8,
        base: u8,
        stack: u8,
        thread: u8,
    ) -> Self {
        let mut registers: Vec<Register> =
            (0..register_count).map(Register::new).collect();
        registers[base as usize].reserved = true;
        registers[stack as usize].reserved = true;
        registers[thread as usize].reserved = true;

        Self {
            word_size,
            values: Vec::new(),
            sites: Vec::new(),
            reads: Vec::new(),
            events: Vec::new(),
            stack_entries: Vec::new(),
            local_slots: Vec::new(),
            promises: Vec::new(),
            by_number: (0..register_count as u32).map(RegId).collect(),
            registers,
            logical_code: Vec::new(),
            logical_ip: None,
            stack: None,
            saved_states: Vec::new(),
            parameter_footprint: 0,
            local_footprint: 0,
            pool: Vec::new(),
            next_sequence: 0,
            junctions: Vec::new(),
            machine_code: None,
            code_length: 0,
            locals: None,
            local_table: Vec::new(),
            stack_reset: false,
            base_register: base,
            stack_register: stack,
            thread_register: thread,
        }
    }

    // -- Arena accessors --

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.0 as usize]
    }

    pub fn site_mut(&mut self, id: SiteId) -> &mut Site {
        &mut self.sites[id.0 as usize]
    }

    pub fn read(&self, id: ReadId) -> &Read {
        &self.reads[id.0 as usize]
    }

    pub fn read_mut(&mut self, id: ReadId) -> &mut Read {
        &mut self.reads[id.0 as usize]
    }

    pub fn event(&self, id: EventId) -> &Event {
        &self.events[id.0 as usize]
    }

    pub fn event_mut(&mut self, id: EventId) -> &mut Event {
        &mut self.events[id.0 as usize]
    }

    pub fn stack_entry(&self, id: StackId) -> &StackEntry {
        &self.stack_entries[id.0 as usize]
    }

    pub fn stack_entry_mut(&mut self, id: StackId) -> &mut StackEntry {
        &mut self.stack_entries[id.0 as usize]
    }

    pub fn local(&self, id: LocalId) -> &LocalSlot {
        &self.local_slots[id.0 as usize]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut LocalSlot {
        &mut self.local_slots[id.0 as usize]
    }

    pub fn promise(&self, id: PromiseId) -> &Promise {
        &self.promises[id.0 as usize]
    }

    pub fn promise_mut(&mut self, id: PromiseId) -> &mut Promise {
        &mut self.promises[id.0 as usize]
    }

    pub fn register(&self, id: RegId) -> &Register {
        &self.registers[id.0 as usize]
    }

    pub fn register_mut(&mut self, id: RegId) -> &mut Register {
        &mut self.registers[id.0 as usize]
    }

    pub fn register_count(&self) -> u8 {
        self.registers.len() as u8
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// The register currently carrying machine number `number`.
    pub fn reg_by_number(&self, number: u8) -> RegId {
        self.by_number[number as usize]
    }

    pub fn add_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    /// A fresh value, optionally seeded with a site and a preferred
    /// target. The seed site is installed without acquisition.
    pub fn new_value(
        &mut self,
        site: Option<SiteId>,
        target: Option<SiteId>,
    ) -> ValueId {
        self.add_value(Value {
            reads: None,
            last_read: None,
            sites: site,
            source: None,
            target,
        })
    }

    pub fn alloc_site(&mut self, site: Site) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(site);
        id
    }

    pub fn add_event(&mut self, event: Event) -> EventId {
        let id = EventId(self.events.len() as u32);
        self.events.push(event);
        id
    }

    pub fn add_stack_entry(&mut self, entry: StackEntry) -> StackId {
        let id = StackId(self.stack_entries.len() as u32);
        self.stack_entries.push(entry);
        id
    }

    pub fn add_local_slot(&mut self, slot: LocalSlot) -> LocalId {
        let id = LocalId(self.local_slots.len() as u32);
        self.local_slots.push(slot);
        id
    }

    pub fn add_promise(&mut self, promise: Promise) -> PromiseId {
        let id = PromiseId(self.promises.len() as u32);
        self.promises.push(promise);
        id
    }

    // -- Frame layout --

    /// Words of frame space below the saved base pointer.
    pub fn stack_offset(&self) -> u32 {
        self.local_footprint - self.parameter_footprint
    }

    /// Byte offset from the base register for local slot `index`.
    /// Parameters sit above the saved base pointer and return address;
    /// other locals below.
    pub fn local_offset(&self, index: u32) -> i32 {
        let word = self.word_size as i32;
        let parameter_footprint = self.parameter_footprint as i32 * word;
        let v = index as i32 * word;
        if v < parameter_footprint {
            (parameter_footprint - v - word) + (word * 2)
        } else {
            -(v + word - parameter_footprint)
        }
    }

    // -- Site lists --

    pub fn find_site(&self, v: ValueId, site: SiteId) -> bool {
        let mut s = self.value(v).sites;
        while let Some(id) = s {
            if id == site {
                return true;
            }
            s = self.site(id).next;
        }
        false
    }

    /// Unlink and release `site` from `v`'s list, if present.
    pub fn remove_site(&mut self, v: ValueId, site: SiteId) {
        let mut prev: Option<SiteId> = None;
        let mut cur = self.value(v).sites;
        while let Some(id) = cur {
            if id == site {
                trace!("remove site {site:?} from {v:?}");
                self.site_release(id);
                let next = self.site(id).next;
                match prev {
                    None => self.value_mut(v).sites = next,
                    Some(p) => self.site_mut(p).next = next,
                }
                break;
            }
            prev = cur;
            cur = self.site(id).next;
        }
    }

    /// Unlink and release the first memory site in `v`'s list.
    pub fn remove_memory_site(&mut self, v: ValueId) {
        let mut prev: Option<SiteId> = None;
        let mut cur = self.value(v).sites;
        while let Some(id) = cur {
            if self.site_type(id) == OperandType::Memory {
                self.site_release(id);
                let next = self.site(id).next;
                match prev {
                    None => self.value_mut(v).sites = next,
                    Some(p) => self.site_mut(p).next = next,
                }
                break;
            }
            prev = cur;
            cur = self.site(id).next;
        }
    }

    /// Release every site of `v`.
    pub fn clear_sites(&mut self, v: ValueId) {
        let mut s = self.value(v).sites;
        while let Some(id) = s {
            self.site_release(id);
            s = self.site(id).next;
        }
        self.value_mut(v).sites = None;
    }

    /// Advance `v`'s read cursor; once the reads are exhausted the
    /// value is dead and all its sites are released.
    pub fn next_read(&mut self, v: ValueId) {
        let head = self.value(v).reads.expect("next_read past final read");
        let next = self.read(head).next;
        self.value_mut(v).reads = next;
        if next.is_none() {
            self.clear_sites(v);
        }
    }

    // -- Read recording --

    /// Append a read to `event` and splice it into the value's read
    /// list: in sequence order when `sequence` is given, else at the
    /// tail.
    pub fn insert_read(
        &mut self,
        event: EventId,
        sequence: Option<u32>,
        v: ValueId,
        size: u32,
        target: Option<SiteId>,
    ) {
        let id = ReadId(self.reads.len() as u32);
        let event_head = self.event(event).reads;
        self.reads.push(Read {
            size,
            value: v,
            target,
            next: None,
            event,
            event_next: event_head,
        });
        let e = self.event_mut(event);
        e.reads = Some(id);
        e.read_count += 1;

        let mut linked = false;
        if let Some(seq) = sequence {
            let mut prev: Option<ReadId> = None;
            let mut cur = self.value(v).reads;
            while let Some(c) = cur {
                let ev = self.read(c).event;
                if self.event(ev).sequence > seq {
                    self.read_mut(id).next = Some(c);
                    match prev {
                        None => self.value_mut(v).reads = Some(id),
                        Some(p) => self.read_mut(p).next = Some(id),
                    }
                    linked = true;
                    break;
                }
                prev = cur;
                cur = self.read(c).next;
            }
        }

        if !linked {
            match self.value(v).last_read {
                Some(last) => self.read_mut(last).next = Some(id),
                None => self.value_mut(v).reads = Some(id),
            }
            self.value_mut(v).last_read = Some(id);
        }
    }

    /// Declare that the current logical ip's latest event reads `v`.
    pub fn add_read(&mut self, v: ValueId, size: u32, target: Option<SiteId>) {
        let ip = self.logical_ip.expect("read outside a logical instruction");
        let event = self.logical_code[ip as usize]
            .last_event
            .expect("read with no event");
        self.insert_read(event, None, v, size, target);
    }

    // -- Register file --

    pub fn freeze_register(&mut self, r: RegId) {
        let reg = self.register_mut(r);
        reg.freeze_count += 1;
        trace!("freeze {} to {}", reg.number, reg.freeze_count);
    }

    pub fn thaw_register(&mut self, r: RegId) {
        let reg = self.register_mut(r);
        assert!(reg.freeze_count > 0);
        reg.freeze_count -= 1;
        trace!("thaw {} to {}", reg.number, reg.freeze_count);
    }

    /// Bump the refcount of the register carrying `number`.
    pub fn increment(&mut self, number: u8) -> RegId {
        let r = self.reg_by_number(number);
        let reg = self.register_mut(r);
        reg.ref_count += 1;
        trace!("increment {} to {}", reg.number, reg.ref_count);
        r
    }

    pub fn decrement(&mut self, r: RegId) {
        let reg = self.register_mut(r);
        assert!(reg.ref_count > 0);
        reg.ref_count -= 1;
        trace!("decrement {} to {}", reg.number, reg.ref_count);
    }

    /// Whether the register's owner still lists it as a site.
    pub fn register_used(&self, r: RegId) -> bool {
        let reg = self.register(r);
        match (reg.value, reg.site) {
            (Some(v), Some(s)) => self.find_site(v, s),
            _ => false,
        }
    }

    pub fn register_used_exclusively(&self, r: RegId) -> bool {
        if !self.register_used(r) {
            return false;
        }
        let v = self.register(r).value.unwrap();
        let head = self.value(v).sites.unwrap();
        self.site(head).next.is_none()
    }

    /// Eviction cost: 6 bars reserved and frozen registers outright.
    pub fn register_cost(&self, r: RegId) -> u32 {
        let reg = self.register(r);
        if reg.reserved || reg.freeze_count > 0 {
            return 6;
        }
        let mut cost = 0;
        if self.register_used(r) {
            cost += 1;
            if self.register_used_exclusively(r) {
                cost += 2;
            }
        }
        if reg.ref_count > 0 {
            cost += 2;
        }
        cost
    }

    /// Cheapest register in `mask`, scanning high to low. A single-bit
    /// mask short-circuits to that register regardless of cost.
    pub fn pick_register(&self, mask: u32) -> RegId {
        let mut best: Option<RegId> = None;
        let mut cost = 5;
        for number in (0..self.register_count()).rev() {
            if mask & (1u32 << number) == 0 {
                continue;
            }
            let r = self.reg_by_number(number);
            if (1u32 << number) == mask {
                return r;
            }
            let c = self.register_cost(r);
            if c < cost {
                best = Some(r);
                cost = c;
            }
        }
        best.expect("no allocatable register in mask")
    }

    pub fn release_register(&mut self, r: RegId) {
        let reg = self.register_mut(r);
        trace!("release {}", reg.number);
        reg.size = 0;
        reg.value = None;
        reg.site = None;
    }

    /// Exchange the machine numbers of two register slots. The caller
    /// has already emitted the machine-level swap.
    pub fn swap_register_numbers(&mut self, a: RegId, b: RegId) {
        assert!(a != b);
        let an = self.register(a).number;
        let bn = self.register(b).number;
        assert!(an != bn);
        self.by_number[an as usize] = b;
        self.by_number[bn as usize] = a;
        self.register_mut(a).number = bn;
        self.register_mut(b).number = an;
    }

    // -- States --

    pub fn push_state(&mut self) {
        self.saved_states.push(self.stack);
    }

    pub fn pop_state(&mut self) {
        self.stack = self
            .saved_states
            .pop()
            .expect("pop_state without matching push_state");
    }

    // -- Site constructors live in site.rs; the odd helper sits here --

    /// Memory site addressing virtual-stack slot `index` relative to
    /// the frame base.
    pub fn push_site_for_index(&mut self, index: u32) -> SiteId {
        let offset = -(((self.stack_offset() + index + 1) * self.word_size)
            as i32);
        let base = self.base_register;
        self.alloc_site(Site {
            kind: SiteKind::Memory {
                base,
                offset,
                index: None,
                scale: 1,
                base_reg: None,
                index_reg: None,
            },
            next: None,
        })
    }
}

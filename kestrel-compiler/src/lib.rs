//! The kestrel JIT code-generation backend.
//!
//! A front-end walks its program twice conceptually: once calling the
//! [`Compiler`] facade to record values, reads, and events against a
//! virtual stack and local array, and once implicitly when
//! [`Compiler::compile`] replays the recorded events, assigning
//! machine locations on demand and emitting instructions through an
//! [`Assembler`].
//!
//! ```no_run
//! use kestrel_compiler::{Compiler, CompilerClient};
//! use kestrel_asm::BinaryOp;
//! use kestrel_x64::X64Assembler;
//!
//! struct NoThunks;
//! impl CompilerClient for NoThunks {
//!     fn get_thunk(&self, _op: BinaryOp, _size: u32) -> i64 {
//!         unimplemented!()
//!     }
//! }
//!
//! let mut c = Compiler::new(X64Assembler::new(), NoThunks);
//! c.init(1, 0, 0);
//! c.start_logical_ip(0);
//! let v = c.constant(42);
//! c.return_(4, v);
//! let length = c.compile();
//! let mut code = vec![0u8; length + c.pool_size()];
//! c.write_to(&mut code);
//! ```

pub mod compile;
pub mod context;
pub mod event;
pub mod promise;
pub mod regalloc;
pub mod site;
pub mod stack;

pub use context::{
    Context, EventId, LocalId, LocalSlot, LogicalInstruction, Read, ReadId,
    RegId, Register, SiteId, StackEntry, StackId, Value, ValueId,
};
pub use event::{Event, EventKind};
pub use promise::{pad, Promise};
pub use site::{Site, SiteKind};

use kestrel_asm::{
    Assembler, BinaryOp, CodeBuffer, PromiseId, PromiseResolver, UnaryOp,
};
use site::{
    address_site, constant_site, memory_site, register_site,
    unresolved_constant_site,
};
use stack::ceiling;

/// Call-site behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFlags(u32);

impl CallFlags {
    pub const NONE: CallFlags = CallFlags(0);
    /// Pad the call so its return address lands on a word boundary.
    pub const ALIGNED: CallFlags = CallFlags(1);
    /// The callee never returns; skip the argument cleanup.
    pub const NO_RETURN: CallFlags = CallFlags(2);

    pub const fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: CallFlags) -> CallFlags {
        CallFlags(self.0 | other.0)
    }
}

/// Maps operations the assembler declines to inline onto helper
/// routine addresses.
pub trait CompilerClient {
    fn get_thunk(&self, op: BinaryOp, size: u32) -> i64;
}

/// Receives a code promise for each call site's return address, so the
/// runtime can attribute stack frames.
pub trait TraceHandler {
    fn handle_trace(&self, promise: PromiseId);
}

/// A call argument: size in bytes and the value to pass.
pub type Argument = (u32, ValueId);

/// The public compiler facade.
pub struct Compiler<A: Assembler, C: CompilerClient> {
    ctx: Context,
    asm: A,
    buf: CodeBuffer,
    client: C,
}

impl<A: Assembler, C: CompilerClient> Compiler<A, C> {
    pub fn new(asm: A, client: C) -> Self {
        let ctx = Context::new(
            asm.word_size(),
            asm.register_count(),
            asm.base(),
            asm.stack(),
            asm.thread(),
        );
        Self {
            ctx,
            asm,
            buf: CodeBuffer::new(),
            client,
        }
    }

    /// Declare the program shape: number of logical instructions,
    /// parameter words, and local words (parameters included).
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
    ) {
        self.ctx.logical_code =
            vec![LogicalInstruction::default(); logical_code_length as usize];
        self.ctx.parameter_footprint = parameter_footprint;
        self.ctx.local_footprint = local_footprint;
        self.ctx.local_table = vec![None; local_footprint as usize];
    }

    // -- Control-flow bookkeeping --

    /// Record that the current instruction can fall through or jump
    /// into `ip`; a second visitor makes `ip` a junction.
    pub fn visit_logical_ip(&mut self, ip: u32) {
        compile::visit(&mut self.ctx, ip);

        self.ctx.stack_reset = false;

        if self.ctx.logical_code[ip as usize]
            .immediate_predecessor
            .is_some()
        {
            self.ctx.junctions.push(ip);
        }
    }

    /// Begin recording events for `ip`.
    pub fn start_logical_ip(&mut self, ip: u32) {
        compile::visit(&mut self.ctx, ip);
        compile::save_stack(&mut self.ctx);
        self.ctx.logical_ip = Some(ip);
    }

    pub fn push_state(&mut self) {
        self.ctx.push_state();
    }

    pub fn pop_state(&mut self) {
        self.ctx.pop_state();
    }

    pub fn save_stack(&mut self) {
        compile::save_stack(&mut self.ctx);
    }

    pub fn reset_stack(&mut self) {
        stack::reset_stack(&mut self.ctx);
    }

    // -- Promises --

    /// The machine address of logical instruction `ip`.
    pub fn machine_ip(&mut self, ip: u32) -> PromiseId {
        self.ctx.ip_promise(ip)
    }

    /// Append a literal to the constant pool; the returned promise
    /// resolves to the pool slot's address.
    pub fn pool_append(&mut self, value: i64) -> PromiseId {
        let p = self.ctx.resolved(value);
        self.pool_append_promise(p)
    }

    pub fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        let key = self.ctx.pool.len() as u32;
        self.ctx.pool.push(value);
        self.ctx.add_promise(Promise::Pool { key })
    }

    // -- Operand creation --

    pub fn constant(&mut self, value: i64) -> ValueId {
        let p = self.ctx.resolved(value);
        self.promise_constant(p)
    }

    pub fn promise_constant(&mut self, value: PromiseId) -> ValueId {
        let site = constant_site(&mut self.ctx, value);
        self.ctx.new_value(Some(site), None)
    }

    pub fn address(&mut self, address: PromiseId) -> ValueId {
        let site = address_site(&mut self.ctx, address);
        self.ctx.new_value(Some(site), None)
    }

    /// A value that will live at `[base + displacement + index *
    /// scale]` once its registers resolve.
    pub fn memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
    ) -> ValueId {
        let result = self.ctx.new_value(None, None);
        event::append_memory(
            &mut self.ctx,
            base,
            displacement,
            index,
            scale,
            result,
        );
        result
    }

    pub fn stack(&mut self) -> ValueId {
        let number = self.ctx.stack_register;
        let site = register_site(&mut self.ctx, number, None);
        self.ctx.new_value(Some(site), Some(site))
    }

    pub fn base(&mut self) -> ValueId {
        let number = self.ctx.base_register;
        let site = register_site(&mut self.ctx, number, None);
        self.ctx.new_value(Some(site), Some(site))
    }

    pub fn thread(&mut self) -> ValueId {
        let number = self.ctx.thread_register;
        let site = register_site(&mut self.ctx, number, None);
        self.ctx.new_value(Some(site), Some(site))
    }

    pub fn is_constant(&self, v: ValueId) -> bool {
        let mut s = self.ctx.value(v).sites;
        while let Some(id) = s {
            if matches!(self.ctx.site(id).kind, SiteKind::Constant { .. }) {
                return true;
            }
            s = self.ctx.site(id).next;
        }
        false
    }

    pub fn constant_value(&self, v: ValueId) -> i64 {
        let mut s = self.ctx.value(v).sites;
        while let Some(id) = s {
            if let SiteKind::Constant { value } = &self.ctx.site(id).kind {
                let p = value.expect("constant site used before its label");
                return self.ctx.promise_value(p);
            }
            s = self.ctx.site(id).next;
        }
        panic!("value has no constant site");
    }

    /// A branch target to be placed later with [`Compiler::mark`].
    pub fn label(&mut self) -> ValueId {
        let site = unresolved_constant_site(&mut self.ctx);
        self.ctx.new_value(Some(site), None)
    }

    /// Place a label at the current position. Forces the stack into
    /// memory, since the label is a junction entry.
    pub fn mark(&mut self, label: ValueId) {
        event::append_stack_sync(&mut self.ctx);
        stack::reset_stack(&mut self.ctx);

        let ip = self.ctx.logical_ip.expect("mark outside an instruction");
        let last = self.ctx.logical_code[ip as usize]
            .last_event
            .expect("mark with no event");
        let promise = self.ctx.code_promise_for_event(last);

        let mut s = self.ctx.value(label).sites;
        while let Some(id) = s {
            if matches!(self.ctx.site(id).kind, SiteKind::Constant { .. }) {
                if let SiteKind::Constant { value } =
                    &mut self.ctx.site_mut(id).kind
                {
                    *value = Some(promise);
                }
                return;
            }
            s = self.ctx.site(id).next;
        }
        panic!("mark target has no constant site");
    }

    // -- Virtual stack --

    pub fn push(&mut self, size: u32, value: ValueId) {
        stack::push_value(&mut self.ctx, size, value);
    }

    /// Push a slot with a fresh, uninitialized value.
    pub fn push_uninitialized(&mut self, size: u32) {
        let words = ceiling(size, self.ctx.word_size);
        assert!(words > 0);
        let v = self.ctx.new_value(None, None);
        stack::new_entry(&mut self.ctx, v, words);
    }

    pub fn pop(&mut self, size: u32) -> ValueId {
        let s = self.ctx.stack.expect("pop from an empty stack");
        let entry = self.ctx.stack_entry(s).clone();
        assert!(ceiling(size, self.ctx.word_size) == entry.size);

        event::append_pop(&mut self.ctx, entry.size, false);

        self.ctx.stack = entry.next;
        entry.value
    }

    /// Note `count` words already pushed by code outside this
    /// compilation (e.g. a callee's return protocol).
    pub fn pushed(&mut self, count: u32) {
        for _ in 0..count {
            let v = self.ctx.new_value(None, None);
            let id = stack::new_entry(&mut self.ctx, v, 1);
            self.ctx.stack_entry_mut(id).pushed = true;
        }
    }

    /// Discard the top `count` words without reading them.
    pub fn popped(&mut self, count: u32) {
        event::append_pop(&mut self.ctx, count, true);

        let mut remaining = count as i64;
        while remaining > 0 {
            let s = self.ctx.stack.expect("popped past the stack bottom");
            let entry = self.ctx.stack_entry(s).clone();
            self.ctx.stack = entry.next;
            remaining -= entry.size as i64;
        }
    }

    /// The value `index` words below the top of the stack.
    pub fn peek(&self, size: u32, index: u32) -> ValueId {
        let mut s = self.ctx.stack;
        let mut i = index as i64;
        while i > 0 {
            let entry = self.ctx.stack_entry(s.expect("peek past bottom"));
            i -= entry.size as i64;
            s = entry.next;
        }
        let entry = self.ctx.stack_entry(s.expect("peek past bottom"));
        assert!(entry.size == ceiling(size, self.ctx.word_size));
        entry.value
    }

    // -- Moves --

    pub fn store(&mut self, size: u32, src: ValueId, dst: ValueId) {
        event::append_move(
            &mut self.ctx,
            &self.asm,
            BinaryOp::Move,
            size,
            src,
            dst,
        );
    }

    pub fn load(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value(None, None);
        event::append_move(
            &mut self.ctx,
            &self.asm,
            BinaryOp::Move,
            size,
            src,
            dst,
        );
        dst
    }

    pub fn loadz(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value(None, None);
        event::append_move(
            &mut self.ctx,
            &self.asm,
            BinaryOp::MoveZ,
            size,
            src,
            dst,
        );
        dst
    }

    pub fn load4_to_8(&mut self, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value(None, None);
        event::append_move(
            &mut self.ctx,
            &self.asm,
            BinaryOp::Move4To8,
            8,
            src,
            dst,
        );
        dst
    }

    // -- Compare and branch --

    pub fn cmp(&mut self, size: u32, a: ValueId, b: ValueId) {
        event::append_compare(&mut self.ctx, &self.asm, size, a, b);
    }

    pub fn jl(&mut self, address: ValueId) {
        event::append_branch(&mut self.ctx, UnaryOp::JumpIfLess, address);
    }

    pub fn jg(&mut self, address: ValueId) {
        event::append_branch(&mut self.ctx, UnaryOp::JumpIfGreater, address);
    }

    pub fn jle(&mut self, address: ValueId) {
        event::append_branch(
            &mut self.ctx,
            UnaryOp::JumpIfLessOrEqual,
            address,
        );
    }

    pub fn jge(&mut self, address: ValueId) {
        event::append_branch(
            &mut self.ctx,
            UnaryOp::JumpIfGreaterOrEqual,
            address,
        );
    }

    pub fn je(&mut self, address: ValueId) {
        event::append_branch(&mut self.ctx, UnaryOp::JumpIfEqual, address);
    }

    pub fn jne(&mut self, address: ValueId) {
        event::append_branch(&mut self.ctx, UnaryOp::JumpIfNotEqual, address);
    }

    pub fn jmp(&mut self, address: ValueId) {
        event::append_branch(&mut self.ctx, UnaryOp::Jump, address);
    }

    // -- Arithmetic --

    fn combine(
        &mut self,
        op: BinaryOp,
        size: u32,
        a: ValueId,
        b: ValueId,
    ) -> ValueId {
        let result = self.ctx.new_value(None, None);
        event::append_combine(
            &mut self.ctx,
            &self.asm,
            &self.client,
            op,
            size,
            a,
            b,
            result,
        );
        result
    }

    pub fn add(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Add, size, a, b)
    }

    pub fn sub(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Subtract, size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Multiply, size, a, b)
    }

    pub fn div(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Divide, size, a, b)
    }

    pub fn rem(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Remainder, size, a, b)
    }

    pub fn shl(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::ShiftLeft, size, a, b)
    }

    pub fn shr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::ShiftRight, size, a, b)
    }

    pub fn ushr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::UnsignedShiftRight, size, a, b)
    }

    pub fn and_(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::And, size, a, b)
    }

    pub fn or_(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Or, size, a, b)
    }

    pub fn xor_(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(BinaryOp::Xor, size, a, b)
    }

    pub fn neg(&mut self, size: u32, a: ValueId) -> ValueId {
        let result = self.ctx.new_value(None, None);
        event::append_translate(
            &mut self.ctx,
            &self.asm,
            UnaryOp::Negate,
            size,
            a,
            result,
        );
        result
    }

    // -- Calls and returns --

    /// Record a call. Arguments are delivered right-to-left: leading
    /// words in argument registers, the rest on the machine stack.
    pub fn call(
        &mut self,
        address: ValueId,
        flags: CallFlags,
        trace: Option<std::rc::Rc<dyn TraceHandler>>,
        result_size: u32,
        arguments: &[Argument],
    ) -> ValueId {
        // The caller's live stack must survive the call in memory.
        let mut s = self.ctx.stack;
        while let Some(entry) = s {
            if self.ctx.stack_entry(entry).push_event.is_none() {
                event::append_push(&mut self.ctx, entry);
            }
            let push_event =
                self.ctx.stack_entry(entry).push_event.unwrap();
            if let EventKind::Push { active, .. } =
                &mut self.ctx.event_mut(push_event).kind
            {
                *active = true;
            }
            s = self.ctx.stack_entry(entry).next;
        }

        let old_stack = self.ctx.stack;

        for &(size, value) in arguments.iter().rev() {
            stack::push_value(&mut self.ctx, size, value);
        }

        let argument_stack = self.ctx.stack;
        self.ctx.stack = old_stack;

        let result = self.ctx.new_value(None, None);
        event::append_call(
            &mut self.ctx,
            &self.asm,
            address,
            flags,
            trace,
            result,
            result_size,
            argument_stack,
            arguments.len() as u32,
        );

        result
    }

    pub fn return_(&mut self, size: u32, value: ValueId) {
        event::append_return(&mut self.ctx, &self.asm, size, Some(value));
    }

    // -- Locals --

    fn add_local(&mut self, size: u32, index: u32, value: ValueId) {
        let word = self.ctx.word_size;
        let words = ceiling(size, word);
        let offset = self.ctx.local_offset(index);
        let base = self.ctx.base_register;
        let site = memory_site(&mut self.ctx, base, offset, None, 1);

        let old = self.ctx.local_table[index as usize];
        let next = self.ctx.locals;
        let id = self.ctx.add_local_slot(LocalSlot {
            size: words,
            index,
            reuse: true,
            value,
            site,
            old,
            next,
        });
        self.ctx.local_table[index as usize] = Some(id);
        self.ctx.locals = Some(id);

        event::append_local(&mut self.ctx, words * word, id);
    }

    pub fn store_local(&mut self, size: u32, src: ValueId, index: u32) {
        assert!(index < self.ctx.local_footprint);

        if let Some(local) = self.ctx.local_table[index as usize] {
            event::append_clobber_local(&mut self.ctx, size, local);
            self.ctx.local_table[index as usize] = None;
        }

        let base = self.base();
        let offset = self.ctx.local_offset(index);
        let dst = self.memory(base, offset, None, 1);
        self.store(size, src, dst);
    }

    pub fn load_local(&mut self, size: u32, index: u32) -> ValueId {
        assert!(index < self.ctx.local_footprint);

        let v = self.ctx.new_value(None, None);
        self.add_local(size, index, v);
        v
    }

    pub fn check_bounds(
        &mut self,
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    ) {
        event::append_bounds_check(
            &mut self.ctx,
            object,
            length_offset,
            index,
            handler,
        );
    }

    // -- Finalization --

    /// Compile every recorded event; returns the emitted code length.
    pub fn compile(&mut self) -> usize {
        compile::update_junctions(&mut self.ctx);
        compile::compile(&mut self.ctx, &self.asm, &mut self.buf);
        self.buf.len()
    }

    /// Bytes of constant pool to reserve after the code.
    pub fn pool_size(&self) -> usize {
        self.ctx.pool.len() * self.ctx.word_size as usize
    }

    /// Copy code and constant pool into `dst` and fix up every
    /// relocation against its final address.
    pub fn write_to(&mut self, dst: &mut [u8]) {
        self.ctx.machine_code = Some(dst.as_ptr() as i64);
        self.buf.write_to(dst, &self.ctx);

        let word = self.ctx.word_size as usize;
        let pool_base = pad(self.buf.len(), self.ctx.word_size);
        for (i, p) in self.ctx.pool.clone().iter().enumerate() {
            let value = self.ctx.promise_value(*p);
            let offset = pool_base + i * word;
            dst[offset..offset + word]
                .copy_from_slice(&value.to_le_bytes()[..word]);
        }
    }

    pub fn dispose(self) {}

    // -- Introspection --

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn assembler(&self) -> &A {
        &self.asm
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn promise_resolved(&self, p: PromiseId) -> bool {
        PromiseResolver::promise_resolved(&self.ctx, p)
    }

    pub fn promise_value(&self, p: PromiseId) -> i64 {
        PromiseResolver::promise_value(&self.ctx, p)
    }
}

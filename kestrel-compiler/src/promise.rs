//! Deferred integers, resolvable once machine code has been placed.

use crate::context::Context;
use kestrel_asm::{PromiseId, PromiseResolver};

/// A late-bound integer. All variants except `Resolved` depend on the
/// final address of the machine-code buffer.
#[derive(Debug, Clone)]
pub enum Promise {
    /// A literal, known at record time.
    Resolved { value: i64 },
    /// Address of constant-pool slot `key`, laid out after the code.
    Pool { key: u32 },
    /// Address of a code offset, filled in during compilation.
    /// Promises attached to an event chain through `next` and take the
    /// buffer length once the event has emitted.
    Code {
        offset: Option<usize>,
        next: Option<PromiseId>,
    },
    /// Address of a logical instruction's first machine instruction.
    Ip { logical_ip: u32 },
}

/// Round `length` up to a word boundary; the constant pool starts on
/// one.
pub fn pad(length: usize, word_size: u32) -> usize {
    let w = word_size as usize;
    (length + w - 1) & !(w - 1)
}

impl Context {
    pub fn resolved(&mut self, value: i64) -> PromiseId {
        self.add_promise(Promise::Resolved { value })
    }

    pub fn code_promise_at(&mut self, offset: usize) -> PromiseId {
        self.add_promise(Promise::Code {
            offset: Some(offset),
            next: None,
        })
    }

    /// A code promise with no offset yet; the caller patches it.
    pub fn code_promise_unset(&mut self) -> PromiseId {
        self.add_promise(Promise::Code {
            offset: None,
            next: None,
        })
    }

    /// A code promise chained onto `event`, taking the buffer length
    /// after the event compiles.
    pub fn code_promise_for_event(
        &mut self,
        event: crate::context::EventId,
    ) -> PromiseId {
        let head = self.event(event).promises;
        let id = self.add_promise(Promise::Code {
            offset: None,
            next: head,
        });
        self.event_mut(event).promises = Some(id);
        id
    }

    pub fn ip_promise(&mut self, logical_ip: u32) -> PromiseId {
        self.add_promise(Promise::Ip { logical_ip })
    }

    pub fn set_promise_offset(&mut self, id: PromiseId, offset: usize) {
        match self.promise_mut(id) {
            Promise::Code { offset: o, .. } => *o = Some(offset),
            _ => panic!("offset on a non-code promise"),
        }
    }
}

impl PromiseResolver for Context {
    fn promise_resolved(&self, promise: PromiseId) -> bool {
        match self.promise(promise) {
            Promise::Resolved { .. } => true,
            Promise::Pool { .. } | Promise::Ip { .. } => {
                self.machine_code.is_some()
            }
            Promise::Code { offset, .. } => {
                self.machine_code.is_some() && offset.is_some()
            }
        }
    }

    fn promise_value(&self, promise: PromiseId) -> i64 {
        assert!(
            self.promise_resolved(promise),
            "promise queried before machine code placement"
        );
        match self.promise(promise) {
            Promise::Resolved { value } => *value,
            Promise::Pool { key } => {
                self.machine_code.unwrap()
                    + pad(self.code_length, self.word_size) as i64
                    + (*key as i64) * self.word_size as i64
            }
            Promise::Code { offset, .. } => {
                self.machine_code.unwrap() + offset.unwrap() as i64
            }
            Promise::Ip { logical_ip } => {
                self.machine_code.unwrap()
                    + self.logical_code[*logical_ip as usize].machine_offset
                        as i64
            }
        }
    }
}

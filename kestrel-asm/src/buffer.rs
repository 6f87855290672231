use std::io;
use std::ptr;

use crate::operand::Imm;
use crate::PromiseResolver;

/// Relocation flavors recorded during emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the patched field.
    Rel32,
    /// Absolute 64-bit value.
    Abs64,
}

/// A patch site recorded while emitting: `offset` names the field to
/// rewrite once the final placement of the code is known.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub offset: usize,
    pub target: Imm,
    pub kind: RelocKind,
}

/// Append-only instruction buffer.
///
/// Backends emit little-endian bytes and record relocations for
/// late-bound targets; [`CodeBuffer::write_to`] copies the bytes to
/// their final home and applies every patch against the resolved
/// promise values.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(1024),
            relocs: Vec::new(),
        }
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.bytes.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Record a patch site. For `Rel32` the `offset` names the start of
    /// the 4-byte displacement field; for `Abs64` the 8-byte field.
    pub fn add_reloc(&mut self, offset: usize, target: Imm, kind: RelocKind) {
        self.relocs.push(Reloc {
            offset,
            target,
            kind,
        });
    }

    /// Copy the emitted code into `dst` and apply all relocations.
    ///
    /// `dst` is the final resting place of the code; relative patches
    /// are computed against its address. Panics if `dst` is too small
    /// or a relative displacement does not fit in 32 bits.
    pub fn write_to(&self, dst: &mut [u8], resolver: &dyn PromiseResolver) {
        assert!(dst.len() >= self.bytes.len(), "destination too small");
        dst[..self.bytes.len()].copy_from_slice(&self.bytes);

        let base = dst.as_ptr() as i64;
        for reloc in &self.relocs {
            let value = match reloc.target {
                Imm::Value(v) => v,
                Imm::Deferred(p) => resolver.promise_value(p),
            };
            match reloc.kind {
                RelocKind::Rel32 => {
                    let disp = value - (base + reloc.offset as i64 + 4);
                    assert!(
                        disp >= i32::MIN as i64 && disp <= i32::MAX as i64,
                        "relative displacement out of range"
                    );
                    dst[reloc.offset..reloc.offset + 4]
                        .copy_from_slice(&(disp as i32).to_le_bytes());
                }
                RelocKind::Abs64 => {
                    dst[reloc.offset..reloc.offset + 8]
                        .copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

/// Executable memory region for finalized code.
///
/// Backed by an anonymous mapping and following W^X discipline: the
/// region is writable while code is copied in, then flipped to
/// read-execute before running.
pub struct ExecBuffer {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: ExecBuffer owns its mapping exclusively.
unsafe impl Send for ExecBuffer {}

impl ExecBuffer {
    /// Map a new writable region of at least `size` bytes (rounded up
    /// to the page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Writable view of the whole region. Only valid while the region
    /// has not been made executable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping spans `size` bytes and is writable.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Flip the region to read-execute.
    pub fn make_executable(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Flip the region back to read-write.
    pub fn make_writable(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

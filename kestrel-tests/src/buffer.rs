//! Code buffer and executable region tests.

use kestrel_asm::{
    CodeBuffer, ExecBuffer, Imm, PromiseId, PromiseResolver, RelocKind,
};

struct FixedResolver(i64);

impl PromiseResolver for FixedResolver {
    fn promise_resolved(&self, _promise: PromiseId) -> bool {
        true
    }

    fn promise_value(&self, _promise: PromiseId) -> i64 {
        self.0
    }
}

#[test]
fn emits_little_endian() {
    let mut buf = CodeBuffer::new();
    buf.emit_u8(0xAA);
    buf.emit_u16(0x1122);
    buf.emit_u32(0x33445566);
    buf.emit_u64(0x0102030405060708);
    assert_eq!(buf.len(), 15);
    assert_eq!(
        buf.as_slice(),
        &[
            0xAA, 0x22, 0x11, 0x66, 0x55, 0x44, 0x33, 0x08, 0x07, 0x06,
            0x05, 0x04, 0x03, 0x02, 0x01
        ]
    );
}

#[test]
fn rel32_reloc_targets_absolute_address() {
    let mut buf = CodeBuffer::new();
    buf.emit_u8(0xE9);
    let field = buf.len();
    buf.emit_u32(0);
    buf.add_reloc(field, Imm::Deferred(PromiseId(0)), RelocKind::Rel32);

    let mut dst = vec![0u8; buf.len()];
    let target = dst.as_ptr() as i64 + 100;
    buf.write_to(&mut dst, &FixedResolver(target));

    let mut disp = [0u8; 4];
    disp.copy_from_slice(&dst[field..field + 4]);
    let disp = i32::from_le_bytes(disp) as i64;
    let landing = dst.as_ptr() as i64 + field as i64 + 4 + disp;
    assert_eq!(landing, target);
}

#[test]
fn abs64_reloc_writes_value() {
    let mut buf = CodeBuffer::new();
    buf.emit_u8(0x48);
    buf.emit_u8(0xB8);
    let field = buf.len();
    buf.emit_u64(0);
    buf.add_reloc(field, Imm::Value(0x1122334455667788), RelocKind::Abs64);

    let mut dst = vec![0u8; buf.len()];
    buf.write_to(&mut dst, &FixedResolver(0));

    let mut value = [0u8; 8];
    value.copy_from_slice(&dst[field..field + 8]);
    assert_eq!(i64::from_le_bytes(value), 0x1122334455667788);
}

#[test]
fn write_to_preserves_unrelocated_bytes() {
    let mut buf = CodeBuffer::new();
    buf.emit_bytes(&[1, 2, 3, 4]);
    let mut dst = vec![0u8; 8];
    buf.write_to(&mut dst, &FixedResolver(0));
    assert_eq!(&dst[..4], &[1, 2, 3, 4]);
    assert_eq!(&dst[4..], &[0, 0, 0, 0]);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn exec_buffer_runs_code() {
    let mut exec = ExecBuffer::new(64).unwrap();
    // mov eax, 7; ret
    exec.as_mut_slice()[..6].copy_from_slice(&[0xB8, 7, 0, 0, 0, 0xC3]);
    exec.make_executable().unwrap();
    let f: extern "C" fn() -> u64 =
        unsafe { std::mem::transmute(exec.ptr()) };
    assert_eq!(f(), 7);
}

mod properties;
mod scenarios;

use kestrel_asm::BinaryOp;
use kestrel_compiler::CompilerClient;

/// Hands out one fixed helper address for every thunked operation.
pub struct TestClient;

pub const THUNK_ADDRESS: i64 = 0x7000_0000;

impl CompilerClient for TestClient {
    fn get_thunk(&self, _op: BinaryOp, _size: u32) -> i64 {
        THUNK_ADDRESS
    }
}

/// x86-64 general-purpose register numbers.
///
/// The encoding matches ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix bit (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// Total number of general-purpose registers.
pub const REGISTER_COUNT: u8 = 16;

/// Frame-base register. Reserved for the compiler.
pub const BASE: Reg = Reg::Rbp;

/// Stack-pointer register. Reserved.
pub const STACK: Reg = Reg::Rsp;

/// Thread-context register. Reserved; generated code addresses
/// per-thread VM state through it.
pub const THREAD: Reg = Reg::Rbx;

/// Argument registers in call order (System V AMD64 ABI).
pub const ARGUMENT_REGS: &[Reg] = &[
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
];

/// Low half of the return-value pair.
pub const RETURN_LOW: Reg = Reg::Rax;

/// High half of the return-value pair.
pub const RETURN_HIGH: Reg = Reg::Rdx;

/// Register that shift instructions take their count in.
pub const SHIFT_COUNT: Reg = Reg::Rcx;

//! x86 / x86-64 register definitions.

use std::fmt;

/// General-purpose registers. `R8`..`R15` exist only in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Gpr {
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

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Register with the full 4-bit number `n` (REX bit included).
    pub fn from_num(n: u8) -> Gpr {
        Self::ALL[(n & 0xf) as usize]
    }

    /// Full register number, 0-15.
    pub fn num(self) -> u8 {
        self as u8
    }

    /// Hardware encoding (3-bit register number in ModR/M).
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    pub fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    /// Display name for the 8-bit low sub-register.
    pub fn name8(self) -> &'static str {
        match self {
            Gpr::Rax => "al",
            Gpr::Rcx => "cl",
            Gpr::Rdx => "dl",
            Gpr::Rbx => "bl",
            Gpr::Rsp => "spl",
            Gpr::Rbp => "bpl",
            Gpr::Rsi => "sil",
            Gpr::Rdi => "dil",
            Gpr::R8 => "r8b",
            Gpr::R9 => "r9b",
            Gpr::R10 => "r10b",
            Gpr::R11 => "r11b",
            Gpr::R12 => "r12b",
            Gpr::R13 => "r13b",
            Gpr::R14 => "r14b",
            Gpr::R15 => "r15b",
        }
    }

    /// Display name for the legacy high byte (`ah`..`bh`) of `Rax`..`Rbx`.
    pub fn name8_high(self) -> &'static str {
        match self {
            Gpr::Rax => "ah",
            Gpr::Rcx => "ch",
            Gpr::Rdx => "dh",
            _ => "bh",
        }
    }

    pub fn name16(self) -> &'static str {
        match self {
            Gpr::Rax => "ax",
            Gpr::Rcx => "cx",
            Gpr::Rdx => "dx",
            Gpr::Rbx => "bx",
            Gpr::Rsp => "sp",
            Gpr::Rbp => "bp",
            Gpr::Rsi => "si",
            Gpr::Rdi => "di",
            Gpr::R8 => "r8w",
            Gpr::R9 => "r9w",
            Gpr::R10 => "r10w",
            Gpr::R11 => "r11w",
            Gpr::R12 => "r12w",
            Gpr::R13 => "r13w",
            Gpr::R14 => "r14w",
            Gpr::R15 => "r15w",
        }
    }

    /// Display name for 32-bit sub-register.
    pub fn name32(self) -> &'static str {
        match self {
            Gpr::Rax => "eax",
            Gpr::Rcx => "ecx",
            Gpr::Rdx => "edx",
            Gpr::Rbx => "ebx",
            Gpr::Rsp => "esp",
            Gpr::Rbp => "ebp",
            Gpr::Rsi => "esi",
            Gpr::Rdi => "edi",
            Gpr::R8 => "r8d",
            Gpr::R9 => "r9d",
            Gpr::R10 => "r10d",
            Gpr::R11 => "r11d",
            Gpr::R12 => "r12d",
            Gpr::R13 => "r13d",
            Gpr::R14 => "r14d",
            Gpr::R15 => "r15d",
        }
    }

    /// Display name for 64-bit register.
    pub fn name64(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

/// Condition codes, numbered as in the `Jcc`/`SETcc`/`CMOVcc` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn from_bits(bits: u8) -> Cond {
        Self::ALL[(bits & 0xf) as usize]
    }

    /// Low nibble of the opcode.
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// The opposite condition.
    pub fn negate(self) -> Cond {
        Self::from_bits(self.encoding() ^ 1)
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

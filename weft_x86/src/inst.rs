//! Machine instruction model shared by the decoder and the encoder.
//!
//! An [`Inst`] carries two views of one instruction: the semantic view
//! (`op`, `size`, `operands` in Intel order, destination first) used by
//! analyses and rewrites, and the [`Encoding`] that records how the
//! operands map onto prefixes, opcode bytes, ModR/M and immediates. The
//! decoder fills the encoding from the bytes it saw, so re-encoding a
//! decoded instruction reproduces it exactly; [`crate::build`] fills it for
//! synthesized instructions.

use crate::reg::{Cond, Gpr};

/// Operand size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpSize {
    S8,
    S16,
    S32,
    S64,
}

impl OpSize {
    pub fn bytes(self) -> u8 {
        match self {
            OpSize::S8 => 1,
            OpSize::S16 => 2,
            OpSize::S32 => 4,
            OpSize::S64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Native pointer width.
    pub fn pointer(is_64: bool) -> OpSize {
        if is_64 {
            OpSize::S64
        } else {
            OpSize::S32
        }
    }
}

/// A register operand of a given width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub gpr: Gpr,
    pub size: OpSize,
    /// `ah`, `ch`, `dh` or `bh` (8-bit, `gpr` names the containing register).
    pub high: bool,
}

impl Reg {
    pub fn new(gpr: Gpr, size: OpSize) -> Self {
        Self {
            gpr,
            size,
            high: false,
        }
    }

    pub fn high8(gpr: Gpr) -> Self {
        Self {
            gpr,
            size: OpSize::S8,
            high: true,
        }
    }

    /// 3-bit register number as encoded (high bytes use 4-7).
    pub fn encoding(self) -> u8 {
        if self.high {
            self.gpr.encoding() | 4
        } else {
            self.gpr.encoding()
        }
    }

    /// `spl`, `bpl`, `sil` and `dil` are only reachable with a REX prefix.
    pub fn needs_rex_presence(self) -> bool {
        self.size == OpSize::S8 && !self.high && (4..8).contains(&self.gpr.num())
    }

    pub fn name(self) -> &'static str {
        match (self.size, self.high) {
            (OpSize::S8, true) => self.gpr.name8_high(),
            (OpSize::S8, false) => self.gpr.name8(),
            (OpSize::S16, _) => self.gpr.name16(),
            (OpSize::S32, _) => self.gpr.name32(),
            (OpSize::S64, _) => self.gpr.name64(),
        }
    }
}

/// Base of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    Reg(Gpr),
    /// RIP-relative (64-bit mode only); the displacement is relative to
    /// the end of the instruction.
    Rip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispWidth {
    None,
    D8,
    D32,
}

/// The ModR/M shape an operand was decoded with. The encoder never picks
/// a narrower displacement than recorded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemLayout {
    pub disp: DispWidth,
    pub sib: bool,
}

/// A memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mem {
    /// Width of the accessed value.
    pub size: OpSize,
    pub base: Option<Base>,
    pub index: Option<Gpr>,
    /// 1, 2, 4 or 8.
    pub scale: u8,
    pub disp: i32,
    /// `None` for synthesized operands: the encoder picks the shortest form.
    pub layout: Option<MemLayout>,
}

impl Mem {
    pub fn base(size: OpSize, base: Gpr, disp: i32) -> Self {
        Self {
            size,
            base: Some(Base::Reg(base)),
            index: None,
            scale: 1,
            disp,
            layout: None,
        }
    }

    pub fn base_index(size: OpSize, base: Gpr, index: Gpr, scale: u8, disp: i32) -> Self {
        Self {
            index: Some(index),
            scale,
            ..Self::base(size, base, disp)
        }
    }

    pub fn rip(size: OpSize, disp: i32) -> Self {
        Self {
            size,
            base: Some(Base::Rip),
            index: None,
            scale: 1,
            disp,
            layout: None,
        }
    }

    /// `[disp32]` with no base or index.
    pub fn absolute(size: OpSize, disp: i32) -> Self {
        Self {
            size,
            base: None,
            index: None,
            scale: 1,
            disp,
            layout: None,
        }
    }

    pub fn is_rip(&self) -> bool {
        self.base == Some(Base::Rip)
    }

    pub fn base_reg(&self) -> Option<Gpr> {
        match self.base {
            Some(Base::Reg(r)) => Some(r),
            _ => None,
        }
    }

    /// Whether the address computation reads `gpr`.
    pub fn uses(&self, gpr: Gpr) -> bool {
        self.base_reg() == Some(gpr) || self.index == Some(gpr)
    }

    /// Whether the address is computed from the stack pointer.
    pub fn is_stack_relative(&self) -> bool {
        self.uses(Gpr::Rsp)
    }

    /// Require a 32-bit displacement field (a relocation lives there).
    pub fn force_disp32(&mut self) {
        let sib = self.layout.map(|l| l.sib).unwrap_or(false);
        self.layout = Some(MemLayout {
            disp: DispWidth::D32,
            sib,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(Mem),
    /// Branch displacement relative to the end of the instruction.
    Rel(i64),
}

impl Operand {
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn mem(&self) -> Option<&Mem> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    pub fn uses(&self, gpr: Gpr) -> bool {
        match self {
            Operand::Reg(r) => r.gpr == gpr,
            Operand::Mem(m) => m.uses(gpr),
            _ => false,
        }
    }
}

/// Instruction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Mov,
    Movzx,
    Movsx,
    Movsxd,
    Lea,
    Xchg,
    Push,
    Pop,
    Pushf,
    Popf,
    Call,
    Jmp,
    Jcc(Cond),
    Ret,
    Leave,
    Nop,
    Int3,
    Ud2,
    Endbr,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul,
    Div,
    Idiv,
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
    Setcc(Cond),
    Cmovcc(Cond),
    /// `cbw` / `cwde` / `cdqe` (opcode 98).
    Cbw,
    /// `cwd` / `cdq` / `cqo` (opcode 99).
    Cwd,
    Movs,
    Stos,
}

impl Op {
    const ALU: [Op; 8] = [
        Op::Add,
        Op::Or,
        Op::Adc,
        Op::Sbb,
        Op::And,
        Op::Sub,
        Op::Xor,
        Op::Cmp,
    ];

    /// The binary arithmetic group selected by bits 3-5 of opcodes `00`-`3D`
    /// and the `/digit` of `80`/`81`/`83`.
    pub fn from_alu(n: u8) -> Op {
        Self::ALU[(n & 7) as usize]
    }

    pub fn alu_index(self) -> Option<u8> {
        Self::ALU.iter().position(|&o| o == self).map(|i| i as u8)
    }

    /// `/digit` of the `C0`/`C1`/`D0`-`D3` shift group.
    pub fn shift_ext(self) -> Option<u8> {
        match self {
            Op::Rol => Some(0),
            Op::Ror => Some(1),
            Op::Shl => Some(4),
            Op::Shr => Some(5),
            Op::Sar => Some(7),
            _ => None,
        }
    }
}

/// What the ModR/M `reg` field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegField {
    /// The register operand at this index.
    Operand(usize),
    /// An opcode extension (`/digit`).
    Ext(u8),
}

/// How the explicit operands are placed in the instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandEnc {
    /// No ModR/M; register operands, if any, are implied by the opcode.
    Implicit,
    ModRm { reg: RegField, rm: usize },
    /// Register number in the low three bits of the last opcode byte.
    OpcodeReg(usize),
    /// `A0`-`A3` absolute memory offset (32-bit mode).
    Moffs(usize),
}

/// An immediate or relative field following the operand bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImmSlot {
    pub operand: usize,
    /// Field width in bytes: 1, 2, 4 or 8.
    pub width: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Encoding {
    /// Legacy prefixes in their original order.
    pub prefixes: Vec<u8>,
    /// REX byte as decoded, 0 when absent. Only the W bit and the fact that
    /// a REX byte is present are taken from here; R, X and B are recomputed
    /// from the operands.
    pub rex: u8,
    /// Opcode bytes including any `0F` escape. For `OpcodeReg` the register
    /// bits of the last byte are zero.
    pub opcode: Vec<u8>,
    pub operands: OperandEnc,
    pub imm: Option<ImmSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inst {
    pub op: Op,
    /// Operand size (the accumulator width for string and sign-extension
    /// instructions).
    pub size: OpSize,
    pub operands: Vec<Operand>,
    pub enc: Encoding,
    /// Length in bytes when decoded; 0 for synthesized instructions.
    pub len: u8,
}

impl Inst {
    pub fn is_call(&self) -> bool {
        self.op == Op::Call
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.op, Op::Jmp | Op::Jcc(_))
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self.op, Op::Jmp | Op::Ret | Op::Ud2)
    }

    /// The branch displacement of a direct call or jump.
    pub fn rel(&self) -> Option<i64> {
        self.operands.iter().find_map(|o| match o {
            Operand::Rel(r) => Some(*r),
            _ => None,
        })
    }

    pub fn set_rel(&mut self, value: i64) {
        for o in &mut self.operands {
            if let Operand::Rel(r) = o {
                *r = value;
            }
        }
    }

    /// Width in bytes of the relative field, if any.
    pub fn rel_width(&self) -> Option<u8> {
        let slot = self.enc.imm?;
        matches!(self.operands.get(slot.operand), Some(Operand::Rel(_))).then_some(slot.width)
    }

    /// Turn a short (`rel8`) jump into its `rel32` form. Returns whether
    /// the instruction changed.
    pub fn widen_branch(&mut self) -> bool {
        if self.rel_width() != Some(1) {
            return false;
        }
        let opcode = match self.op {
            Op::Jmp => vec![0xe9],
            Op::Jcc(cc) => vec![0x0f, 0x80 | cc.encoding()],
            _ => return false,
        };
        self.enc.opcode = opcode;
        if let Some(slot) = self.enc.imm.as_mut() {
            slot.width = 4;
        }
        true
    }

    /// The memory operand, if any.
    pub fn mem(&self) -> Option<&Mem> {
        self.operands.iter().find_map(Operand::mem)
    }

    pub fn mem_mut(&mut self) -> Option<&mut Mem> {
        self.operands.iter_mut().find_map(|o| match o {
            Operand::Mem(m) => Some(m),
            _ => None,
        })
    }

    /// Index of the operand that holds the immediate field, if any.
    pub fn imm_operand(&self) -> Option<usize> {
        let slot = self.enc.imm?;
        matches!(self.operands.get(slot.operand), Some(Operand::Imm(_))).then_some(slot.operand)
    }

    /// Whether the instruction consumes the arithmetic flags.
    pub fn reads_flags(&self) -> bool {
        matches!(
            self.op,
            Op::Adc | Op::Sbb | Op::Jcc(_) | Op::Setcc(_) | Op::Cmovcc(_) | Op::Pushf
        )
    }

    /// Whether the instruction overwrites every status flag without reading
    /// any of them.
    pub fn defines_flags(&self) -> bool {
        matches!(
            self.op,
            Op::Add | Op::Or | Op::And | Op::Sub | Op::Xor | Op::Cmp | Op::Test | Op::Neg | Op::Popf
        )
    }

    /// Whether the instruction can change any status flag.
    pub fn writes_flags(&self) -> bool {
        self.defines_flags()
            || matches!(
                self.op,
                Op::Adc
                    | Op::Sbb
                    | Op::Inc
                    | Op::Dec
                    | Op::Mul
                    | Op::Imul
                    | Op::Div
                    | Op::Idiv
                    | Op::Rol
                    | Op::Ror
                    | Op::Shl
                    | Op::Shr
                    | Op::Sar
                    | Op::Call
            )
    }

    /// Registers read or written without appearing as operands.
    pub fn implicit_regs(&self) -> &'static [Gpr] {
        match self.op {
            Op::Push | Op::Pop | Op::Pushf | Op::Popf | Op::Call | Op::Ret => &[Gpr::Rsp],
            Op::Leave => &[Gpr::Rsp, Gpr::Rbp],
            Op::Mul | Op::Div | Op::Idiv | Op::Cwd => &[Gpr::Rax, Gpr::Rdx],
            Op::Imul if self.operands.len() == 1 => &[Gpr::Rax, Gpr::Rdx],
            Op::Cbw => &[Gpr::Rax],
            Op::Movs => &[Gpr::Rsi, Gpr::Rdi, Gpr::Rcx],
            Op::Stos => &[Gpr::Rax, Gpr::Rdi, Gpr::Rcx],
            _ => &[],
        }
    }

    /// Whether the instruction mentions `gpr` at all.
    pub fn uses(&self, gpr: Gpr) -> bool {
        self.operands.iter().any(|o| o.uses(gpr)) || self.implicit_regs().contains(&gpr)
    }

    /// Mnemonic in Intel syntax.
    pub fn mnemonic(&self) -> String {
        let name = match self.op {
            Op::Add => "add",
            Op::Or => "or",
            Op::Adc => "adc",
            Op::Sbb => "sbb",
            Op::And => "and",
            Op::Sub => "sub",
            Op::Xor => "xor",
            Op::Cmp => "cmp",
            Op::Test => "test",
            Op::Mov => "mov",
            Op::Movzx => "movzx",
            Op::Movsx => "movsx",
            Op::Movsxd => "movsxd",
            Op::Lea => "lea",
            Op::Xchg => "xchg",
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Pushf => "pushf",
            Op::Popf => "popf",
            Op::Call => "call",
            Op::Jmp => "jmp",
            Op::Jcc(cc) => return format!("j{cc}"),
            Op::Ret => "ret",
            Op::Leave => "leave",
            Op::Nop => "nop",
            Op::Int3 => "int3",
            Op::Ud2 => "ud2",
            Op::Endbr => {
                if self.enc.opcode.last() == Some(&0xfa) {
                    "endbr64"
                } else {
                    "endbr32"
                }
            }
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Neg => "neg",
            Op::Not => "not",
            Op::Mul => "mul",
            Op::Imul => "imul",
            Op::Div => "div",
            Op::Idiv => "idiv",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Sar => "sar",
            Op::Setcc(cc) => return format!("set{cc}"),
            Op::Cmovcc(cc) => return format!("cmov{cc}"),
            Op::Cbw => match self.size {
                OpSize::S16 => "cbw",
                OpSize::S64 => "cdqe",
                _ => "cwde",
            },
            Op::Cwd => match self.size {
                OpSize::S16 => "cwd",
                OpSize::S64 => "cqo",
                _ => "cdq",
            },
            Op::Movs | Op::Stos => {
                let base = if self.op == Op::Movs { "movs" } else { "stos" };
                let suffix = match self.size {
                    OpSize::S8 => 'b',
                    OpSize::S16 => 'w',
                    OpSize::S32 => 'd',
                    OpSize::S64 => 'q',
                };
                let rep = if self.enc.prefixes.contains(&0xf3) { "rep " } else { "" };
                return format!("{rep}{base}{suffix}");
            }
        };
        name.to_string()
    }
}

//! Instruction decoder.
//!
//! Recognizes the integer subset that compilers emit for ordinary code:
//! moves, LEA, arithmetic and comparison, shifts, push/pop, direct and
//! indirect calls and jumps, conditional branches, `setcc`/`cmovcc`, and
//! the usual padding and control instructions. Anything else (vector
//! instructions, far transfers, address-size overrides, ...) stops the
//! decoder with an [`Unrecognized`] marker.

use std::fmt;

use weft_obj::{Arch, Module, RelocKind};

use crate::encode::encode;
use crate::inst::{
    Base, DispWidth, Encoding, ImmSlot, Inst, Mem, MemLayout, Op, OpSize, Operand, OperandEnc,
    Reg, RegField,
};
use crate::reg::{Cond, Gpr};

/// Position of the first byte sequence the decoder could not classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unrecognized {
    pub offset: usize,
}

impl fmt::Display for Unrecognized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized encoding at offset {:#x}", self.offset)
    }
}

/// Lazy decoder over a byte slice. Yields `(offset, inst)` pairs and stops
/// after the first unrecognized instruction; [`Decoder::seek`] restarts it.
pub struct Decoder<'a> {
    bytes: &'a [u8],
    arch: Arch,
    pos: usize,
    stopped: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8], arch: Arch) -> Self {
        Self {
            bytes,
            arch,
            pos: 0,
            stopped: false,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
        self.stopped = false;
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<(usize, Inst), Unrecognized>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped || self.pos >= self.bytes.len() {
            return None;
        }
        let at = self.pos;
        match decode_one(&self.bytes[at..], self.arch) {
            Some(inst) => {
                self.pos += inst.len as usize;
                Some(Ok((at, inst)))
            }
            None => {
                self.stopped = true;
                Some(Err(Unrecognized { offset: at }))
            }
        }
    }
}

/// Decode `bytes` up to the first unrecognized instruction.
pub fn decode_all(bytes: &[u8], arch: Arch) -> (Vec<(usize, Inst)>, Option<Unrecognized>) {
    let mut insts = Vec::new();
    for item in Decoder::new(bytes, arch) {
        match item {
            Ok(pair) => insts.push(pair),
            Err(marker) => return (insts, Some(marker)),
        }
    }
    (insts, None)
}

/// Decode the single instruction at the start of `bytes`. Bytes the
/// encoder would not reproduce exactly (a REX bit no operand uses, for
/// instance) are unrecognized.
pub fn decode_one(bytes: &[u8], arch: Arch) -> Option<Inst> {
    let inst = decode_raw(bytes, arch)?;
    let encoded = encode(&inst, arch).ok()?;
    (encoded.bytes[..] == bytes[..inst.len as usize]).then_some(inst)
}

fn decode_raw(bytes: &[u8], arch: Arch) -> Option<Inst> {
    let mut c = Cursor { bytes, pos: 0 };
    let is_64 = arch.is_64();
    let mut legacy = Vec::new();
    while let Some(b) = c.peek() {
        if !matches!(
            b,
            0x66 | 0xf0 | 0xf2 | 0xf3 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65
        ) {
            break;
        }
        if legacy.len() == 14 {
            return None;
        }
        legacy.push(b);
        c.pos += 1;
    }
    let mut rex = 0;
    if is_64 {
        if let Some(b) = c.peek() {
            if b & 0xf0 == 0x40 {
                rex = b;
                c.pos += 1;
            }
        }
    }
    let p = Prefix { legacy, rex, is_64 };
    let mut inst = decode_opcode(&mut c, &p)?;
    if c.pos > 15 {
        return None;
    }
    inst.len = c.pos as u8;
    Some(inst)
}

// ---------------------------------------------------------------------------
// Byte cursor and prefix state
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn u8(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    fn i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    /// Read a sign-extended immediate of `width` bytes.
    fn imm(&mut self, width: u8) -> Option<i64> {
        Some(match width {
            1 => self.u8()? as i8 as i64,
            2 => i16::from_le_bytes(self.take::<2>()?) as i64,
            4 => self.i32()? as i64,
            _ => i64::from_le_bytes(self.take::<8>()?),
        })
    }
}

struct Prefix {
    legacy: Vec<u8>,
    rex: u8,
    is_64: bool,
}

const MR: OperandEnc = OperandEnc::ModRm {
    reg: RegField::Operand(1),
    rm: 0,
};
const RM: OperandEnc = OperandEnc::ModRm {
    reg: RegField::Operand(0),
    rm: 1,
};

fn ext(n: u8) -> OperandEnc {
    OperandEnc::ModRm {
        reg: RegField::Ext(n),
        rm: 0,
    }
}

impl Prefix {
    fn has(&self, b: u8) -> bool {
        self.legacy.contains(&b)
    }

    fn rex_bit(&self, bit: u8) -> u8 {
        (self.rex >> bit) & 1
    }

    /// Operand size of a non-byte instruction.
    fn size(&self) -> OpSize {
        if self.rex & 0x08 != 0 {
            OpSize::S64
        } else if self.has(0x66) {
            OpSize::S16
        } else {
            OpSize::S32
        }
    }

    /// Operand size of push, pop and indirect branches.
    fn stack_size(&self) -> OpSize {
        if self.has(0x66) {
            OpSize::S16
        } else {
            OpSize::pointer(self.is_64)
        }
    }

    fn imm_width(size: OpSize) -> u8 {
        match size {
            OpSize::S8 => 1,
            OpSize::S16 => 2,
            _ => 4,
        }
    }

    fn reg(&self, num: u8, size: OpSize) -> Reg {
        if size == OpSize::S8 && self.rex == 0 && (4..8).contains(&num) {
            Reg::high8(Gpr::from_num(num - 4))
        } else {
            Reg::new(Gpr::from_num(num), size)
        }
    }

    fn inst(
        &self,
        op: Op,
        size: OpSize,
        operands: Vec<Operand>,
        opcode: &[u8],
        enc: OperandEnc,
        imm: Option<(usize, u8)>,
    ) -> Inst {
        Inst {
            op,
            size,
            operands,
            enc: Encoding {
                prefixes: self.legacy.clone(),
                rex: self.rex,
                opcode: opcode.to_vec(),
                operands: enc,
                imm: imm.map(|(operand, width)| ImmSlot { operand, width }),
            },
            len: 0,
        }
    }

    /// Decode ModR/M (plus SIB and displacement). Returns the full `reg`
    /// field (REX.R applied), the raw 3-bit field, and the r/m operand.
    fn modrm(&self, c: &mut Cursor, rm_size: OpSize) -> Option<(u8, u8, Operand)> {
        let b = c.u8()?;
        let md = b >> 6;
        let reg3 = (b >> 3) & 7;
        let rm3 = b & 7;
        let reg = reg3 | (self.rex_bit(2) << 3);
        if md == 3 {
            let num = rm3 | (self.rex_bit(0) << 3);
            return Some((reg, reg3, Operand::Reg(self.reg(num, rm_size))));
        }

        let mut mem = Mem::absolute(rm_size, 0);
        let mut sib = false;
        let mut disp = match md {
            1 => DispWidth::D8,
            2 => DispWidth::D32,
            _ => DispWidth::None,
        };
        if rm3 == 4 {
            sib = true;
            let s = c.u8()?;
            mem.scale = 1 << (s >> 6);
            let index = ((s >> 3) & 7) | (self.rex_bit(1) << 3);
            if index != 4 {
                mem.index = Some(Gpr::from_num(index));
            }
            let base3 = s & 7;
            if base3 == 5 && md == 0 {
                disp = DispWidth::D32;
            } else {
                mem.base = Some(Base::Reg(Gpr::from_num(base3 | (self.rex_bit(0) << 3))));
            }
        } else if rm3 == 5 && md == 0 {
            if self.is_64 {
                mem.base = Some(Base::Rip);
            }
            disp = DispWidth::D32;
        } else {
            mem.base = Some(Base::Reg(Gpr::from_num(rm3 | (self.rex_bit(0) << 3))));
        }
        mem.disp = match disp {
            DispWidth::None => 0,
            DispWidth::D8 => c.imm(1)? as i32,
            DispWidth::D32 => c.i32()?,
        };
        mem.layout = Some(MemLayout { disp, sib });
        Some((reg, reg3, Operand::Mem(mem)))
    }
}

// ---------------------------------------------------------------------------
// Opcode tables
// ---------------------------------------------------------------------------

fn decode_opcode(c: &mut Cursor, p: &Prefix) -> Option<Inst> {
    let b = c.u8()?;
    let size = p.size();
    match b {
        0x0f => decode_0f(c, p),

        // add/or/adc/sbb/and/sub/xor/cmp in their six forms.
        0x00..=0x3d if b & 7 < 6 => {
            let op = Op::from_alu(b >> 3);
            let sz = if b & 1 == 0 { OpSize::S8 } else { size };
            match b & 7 {
                0 | 1 => {
                    let (reg, _, rm) = p.modrm(c, sz)?;
                    let ops = vec![rm, Operand::Reg(p.reg(reg, sz))];
                    Some(p.inst(op, sz, ops, &[b], MR, None))
                }
                2 | 3 => {
                    let (reg, _, rm) = p.modrm(c, sz)?;
                    let ops = vec![Operand::Reg(p.reg(reg, sz)), rm];
                    Some(p.inst(op, sz, ops, &[b], RM, None))
                }
                _ => {
                    let width = Prefix::imm_width(sz);
                    let imm = c.imm(width)?;
                    let ops = vec![Operand::Reg(Reg::new(Gpr::Rax, sz)), Operand::Imm(imm)];
                    Some(p.inst(op, sz, ops, &[b], OperandEnc::Implicit, Some((1, width))))
                }
            }
        }

        0x40..=0x4f if !p.is_64 => {
            let op = if b < 0x48 { Op::Inc } else { Op::Dec };
            let ops = vec![Operand::Reg(p.reg(b & 7, size))];
            Some(p.inst(op, size, ops, &[b & 0xf8], OperandEnc::OpcodeReg(0), None))
        }

        0x50..=0x5f => {
            let op = if b < 0x58 { Op::Push } else { Op::Pop };
            let sz = p.stack_size();
            let num = (b & 7) | (p.rex_bit(0) << 3);
            let ops = vec![Operand::Reg(Reg::new(Gpr::from_num(num), sz))];
            Some(p.inst(op, sz, ops, &[b & 0xf8], OperandEnc::OpcodeReg(0), None))
        }

        0x63 if p.is_64 => {
            let (reg, _, rm) = p.modrm(c, OpSize::S32)?;
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm];
            Some(p.inst(Op::Movsxd, size, ops, &[b], RM, None))
        }

        0x68 | 0x6a => {
            let width = if b == 0x6a {
                1
            } else if p.has(0x66) {
                2
            } else {
                4
            };
            let imm = c.imm(width)?;
            let ops = vec![Operand::Imm(imm)];
            Some(p.inst(Op::Push, p.stack_size(), ops, &[b], OperandEnc::Implicit, Some((0, width))))
        }

        0x69 | 0x6b => {
            let (reg, _, rm) = p.modrm(c, size)?;
            let width = if b == 0x6b { 1 } else { Prefix::imm_width(size) };
            let imm = c.imm(width)?;
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm, Operand::Imm(imm)];
            Some(p.inst(Op::Imul, size, ops, &[b], RM, Some((2, width))))
        }

        0x70..=0x7f => {
            if p.has(0x66) {
                return None;
            }
            let rel = c.imm(1)?;
            let op = Op::Jcc(Cond::from_bits(b));
            let sz = OpSize::pointer(p.is_64);
            Some(p.inst(op, sz, vec![Operand::Rel(rel)], &[b], OperandEnc::Implicit, Some((0, 1))))
        }

        0x80 | 0x81 | 0x83 => {
            let sz = if b == 0x80 { OpSize::S8 } else { size };
            let (_, n, rm) = p.modrm(c, sz)?;
            let width = if b == 0x81 { Prefix::imm_width(sz) } else { 1 };
            let imm = c.imm(width)?;
            let ops = vec![rm, Operand::Imm(imm)];
            Some(p.inst(Op::from_alu(n), sz, ops, &[b], ext(n), Some((1, width))))
        }

        0x84..=0x89 => {
            let op = match b {
                0x84 | 0x85 => Op::Test,
                0x86 | 0x87 => Op::Xchg,
                _ => Op::Mov,
            };
            let sz = if b & 1 == 0 { OpSize::S8 } else { size };
            let (reg, _, rm) = p.modrm(c, sz)?;
            let ops = vec![rm, Operand::Reg(p.reg(reg, sz))];
            Some(p.inst(op, sz, ops, &[b], MR, None))
        }

        0x8a | 0x8b => {
            let sz = if b == 0x8a { OpSize::S8 } else { size };
            let (reg, _, rm) = p.modrm(c, sz)?;
            let ops = vec![Operand::Reg(p.reg(reg, sz)), rm];
            Some(p.inst(Op::Mov, sz, ops, &[b], RM, None))
        }

        0x8d => {
            let (reg, _, rm) = p.modrm(c, size)?;
            if !matches!(rm, Operand::Mem(_)) {
                return None;
            }
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm];
            Some(p.inst(Op::Lea, size, ops, &[b], RM, None))
        }

        0x8f => {
            let sz = p.stack_size();
            let (_, n, rm) = p.modrm(c, sz)?;
            if n != 0 {
                return None;
            }
            Some(p.inst(Op::Pop, sz, vec![rm], &[b], ext(0), None))
        }

        0x90 if p.rex_bit(0) == 0 => Some(p.inst(Op::Nop, size, vec![], &[b], OperandEnc::Implicit, None)),
        0x98 => Some(p.inst(Op::Cbw, size, vec![], &[b], OperandEnc::Implicit, None)),
        0x99 => Some(p.inst(Op::Cwd, size, vec![], &[b], OperandEnc::Implicit, None)),
        0x9c => Some(p.inst(Op::Pushf, p.stack_size(), vec![], &[b], OperandEnc::Implicit, None)),
        0x9d => Some(p.inst(Op::Popf, p.stack_size(), vec![], &[b], OperandEnc::Implicit, None)),

        0xa0..=0xa3 if !p.is_64 => {
            let sz = if b & 1 == 0 { OpSize::S8 } else { size };
            let mem = Operand::Mem(Mem::absolute(sz, c.i32()?));
            let acc = Operand::Reg(Reg::new(Gpr::Rax, sz));
            let (ops, at) = if b < 0xa2 {
                (vec![acc, mem], 1)
            } else {
                (vec![mem, acc], 0)
            };
            Some(p.inst(Op::Mov, sz, ops, &[b], OperandEnc::Moffs(at), None))
        }

        0xa4 | 0xa5 | 0xaa | 0xab => {
            let op = if b < 0xaa { Op::Movs } else { Op::Stos };
            let sz = if b & 1 == 0 { OpSize::S8 } else { size };
            Some(p.inst(op, sz, vec![], &[b], OperandEnc::Implicit, None))
        }

        0xa8 | 0xa9 => {
            let sz = if b == 0xa8 { OpSize::S8 } else { size };
            let width = Prefix::imm_width(sz);
            let imm = c.imm(width)?;
            let ops = vec![Operand::Reg(Reg::new(Gpr::Rax, sz)), Operand::Imm(imm)];
            Some(p.inst(Op::Test, sz, ops, &[b], OperandEnc::Implicit, Some((1, width))))
        }

        0xb0..=0xbf => {
            let sz = if b < 0xb8 { OpSize::S8 } else { size };
            let width = match sz {
                OpSize::S64 => 8,
                s => Prefix::imm_width(s),
            };
            let num = (b & 7) | (p.rex_bit(0) << 3);
            let imm = c.imm(width)?;
            let ops = vec![Operand::Reg(p.reg(num, sz)), Operand::Imm(imm)];
            Some(p.inst(Op::Mov, sz, ops, &[b & 0xf8], OperandEnc::OpcodeReg(0), Some((1, width))))
        }

        0xc0 | 0xc1 | 0xd0..=0xd3 => {
            let sz = if b & 1 == 0 { OpSize::S8 } else { size };
            let (_, n, rm) = p.modrm(c, sz)?;
            let op = match n {
                0 => Op::Rol,
                1 => Op::Ror,
                4 | 6 => Op::Shl,
                5 => Op::Shr,
                7 => Op::Sar,
                _ => return None,
            };
            let (count, imm) = match b {
                0xc0 | 0xc1 => (Operand::Imm(c.u8()? as i64), Some((1, 1))),
                0xd0 | 0xd1 => (Operand::Imm(1), None),
                _ => (Operand::Reg(Reg::new(Gpr::Rcx, OpSize::S8)), None),
            };
            Some(p.inst(op, sz, vec![rm, count], &[b], ext(n), imm))
        }

        0xc2 => {
            let imm = u16::from_le_bytes(c.take::<2>()?) as i64;
            let sz = OpSize::pointer(p.is_64);
            Some(p.inst(Op::Ret, sz, vec![Operand::Imm(imm)], &[b], OperandEnc::Implicit, Some((0, 2))))
        }
        0xc3 => Some(p.inst(Op::Ret, OpSize::pointer(p.is_64), vec![], &[b], OperandEnc::Implicit, None)),

        0xc6 | 0xc7 => {
            let sz = if b == 0xc6 { OpSize::S8 } else { size };
            let (_, n, rm) = p.modrm(c, sz)?;
            if n != 0 {
                return None;
            }
            let width = Prefix::imm_width(sz);
            let imm = c.imm(width)?;
            Some(p.inst(Op::Mov, sz, vec![rm, Operand::Imm(imm)], &[b], ext(0), Some((1, width))))
        }

        0xc9 => Some(p.inst(Op::Leave, OpSize::pointer(p.is_64), vec![], &[b], OperandEnc::Implicit, None)),
        0xcc => Some(p.inst(Op::Int3, size, vec![], &[b], OperandEnc::Implicit, None)),

        0xe8 | 0xe9 | 0xeb => {
            if p.has(0x66) {
                return None;
            }
            let width = if b == 0xeb { 1 } else { 4 };
            let rel = c.imm(width)?;
            let op = if b == 0xe8 { Op::Call } else { Op::Jmp };
            let sz = OpSize::pointer(p.is_64);
            Some(p.inst(op, sz, vec![Operand::Rel(rel)], &[b], OperandEnc::Implicit, Some((0, width))))
        }

        0xf6 | 0xf7 => {
            let sz = if b == 0xf6 { OpSize::S8 } else { size };
            let (_, n, rm) = p.modrm(c, sz)?;
            if n == 0 {
                let width = Prefix::imm_width(sz);
                let imm = c.imm(width)?;
                return Some(p.inst(Op::Test, sz, vec![rm, Operand::Imm(imm)], &[b], ext(0), Some((1, width))));
            }
            let op = match n {
                2 => Op::Not,
                3 => Op::Neg,
                4 => Op::Mul,
                5 => Op::Imul,
                6 => Op::Div,
                7 => Op::Idiv,
                _ => return None,
            };
            Some(p.inst(op, sz, vec![rm], &[b], ext(n), None))
        }

        0xfe => {
            let (_, n, rm) = p.modrm(c, OpSize::S8)?;
            let op = match n {
                0 => Op::Inc,
                1 => Op::Dec,
                _ => return None,
            };
            Some(p.inst(op, OpSize::S8, vec![rm], &[b], ext(n), None))
        }

        0xff => {
            let n = (c.peek()? >> 3) & 7;
            let (op, sz) = match n {
                0 => (Op::Inc, size),
                1 => (Op::Dec, size),
                2 => (Op::Call, p.stack_size()),
                4 => (Op::Jmp, p.stack_size()),
                6 => (Op::Push, p.stack_size()),
                _ => return None,
            };
            let (_, _, rm) = p.modrm(c, sz)?;
            Some(p.inst(op, sz, vec![rm], &[b], ext(n), None))
        }

        _ => None,
    }
}

fn decode_0f(c: &mut Cursor, p: &Prefix) -> Option<Inst> {
    let b = c.u8()?;
    let size = p.size();
    if b == 0x1e {
        let b2 = c.u8()?;
        if !p.has(0xf3) || !matches!(b2, 0xfa | 0xfb) {
            return None;
        }
        let sz = OpSize::pointer(p.is_64);
        return Some(p.inst(Op::Endbr, sz, vec![], &[0x0f, 0x1e, b2], OperandEnc::Implicit, None));
    }
    // F2/F3 select a different (vector or bit-manipulation) instruction.
    if p.has(0xf2) || p.has(0xf3) {
        return None;
    }
    match b {
        0x0b => Some(p.inst(Op::Ud2, size, vec![], &[0x0f, b], OperandEnc::Implicit, None)),
        0x1f => {
            let (_, n, rm) = p.modrm(c, size)?;
            if n != 0 {
                return None;
            }
            Some(p.inst(Op::Nop, size, vec![rm], &[0x0f, b], ext(0), None))
        }
        0x40..=0x4f => {
            let (reg, _, rm) = p.modrm(c, size)?;
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm];
            Some(p.inst(Op::Cmovcc(Cond::from_bits(b)), size, ops, &[0x0f, b], RM, None))
        }
        0x80..=0x8f => {
            if p.has(0x66) {
                return None;
            }
            let rel = c.imm(4)?;
            let op = Op::Jcc(Cond::from_bits(b));
            let sz = OpSize::pointer(p.is_64);
            Some(p.inst(op, sz, vec![Operand::Rel(rel)], &[0x0f, b], OperandEnc::Implicit, Some((0, 4))))
        }
        0x90..=0x9f => {
            let (_, n, rm) = p.modrm(c, OpSize::S8)?;
            Some(p.inst(Op::Setcc(Cond::from_bits(b)), OpSize::S8, vec![rm], &[0x0f, b], ext(n), None))
        }
        0xaf => {
            let (reg, _, rm) = p.modrm(c, size)?;
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm];
            Some(p.inst(Op::Imul, size, ops, &[0x0f, b], RM, None))
        }
        0xb6 | 0xb7 | 0xbe | 0xbf => {
            let src = if b & 1 == 0 { OpSize::S8 } else { OpSize::S16 };
            let op = if b < 0xb8 { Op::Movzx } else { Op::Movsx };
            let (reg, _, rm) = p.modrm(c, src)?;
            let ops = vec![Operand::Reg(p.reg(reg, size)), rm];
            Some(p.inst(op, size, ops, &[0x0f, b], RM, None))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Relocation refinement
// ---------------------------------------------------------------------------

/// Reclassify 32-bit PC-relative relocations that sit in the displacement
/// of a RIP-relative memory operand as [`RelocKind::RipRelative32`].
///
/// Code is decoded from every defined symbol in each code section up to
/// the next one; undecodable ranges are left alone. Returns the number of
/// relocations changed.
pub fn refine_relocations(module: &mut Module) -> usize {
    if !module.arch.is_64() {
        return 0;
    }
    let mut changed = 0;
    for section in module.section_ids().collect::<Vec<_>>() {
        if !module.section(section).kind.is_code() {
            continue;
        }
        let data = &module.section(section).data;
        let mut starts: Vec<u64> = module
            .symbols_in(section)
            .filter_map(|(_, s)| s.location().map(|(_, o)| o))
            .chain(std::iter::once(0))
            .filter(|&o| o < data.len() as u64)
            .collect();
        starts.sort_unstable();
        starts.dedup();

        let mut rip_fields = Vec::new();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(data.len() as u64);
            let range = &data[start as usize..end as usize];
            for item in Decoder::new(range, module.arch) {
                let Ok((at, inst)) = item else { break };
                if !inst.mem().is_some_and(Mem::is_rip) {
                    continue;
                }
                if let Some(disp_at) = encode(&inst, module.arch).ok().and_then(|e| e.disp_at) {
                    rip_fields.push(start + (at + disp_at) as u64);
                }
            }
        }

        for r in module.relocations.iter_mut() {
            if r.section == section && r.kind == RelocKind::Relative32 && rip_fields.contains(&r.offset) {
                r.kind = RelocKind::RipRelative32;
                changed += 1;
            }
        }
    }
    changed
}

//! Constructors for synthesized instructions.
//!
//! Each constructor picks the conventional encoding (shortest immediate
//! form, `89` for register moves, ...). Immediates of 64-bit operations
//! must fit in a sign-extended 32-bit field unless noted otherwise.

use weft_obj::Arch;

use crate::encode::fits_signed;
use crate::inst::{Encoding, ImmSlot, Inst, Mem, Op, OpSize, Operand, OperandEnc, Reg, RegField};
use crate::reg::{Cond, Gpr};

fn encoding(size: OpSize, default_64: bool, opcode: &[u8], operands: OperandEnc, imm: Option<(usize, u8)>) -> Encoding {
    let mut prefixes = Vec::new();
    if size == OpSize::S16 {
        prefixes.push(0x66);
    }
    let rex = if size == OpSize::S64 && !default_64 { 0x48 } else { 0 };
    Encoding {
        prefixes,
        rex,
        opcode: opcode.to_vec(),
        operands,
        imm: imm.map(|(operand, width)| ImmSlot { operand, width }),
    }
}

fn make(op: Op, size: OpSize, operands: Vec<Operand>, enc: Encoding) -> Inst {
    Inst {
        op,
        size,
        operands,
        enc,
        len: 0,
    }
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

fn imm_width(size: OpSize) -> u8 {
    match size {
        OpSize::S8 => 1,
        OpSize::S16 => 2,
        _ => 4,
    }
}

fn operand_size(op: &Operand) -> OpSize {
    match op {
        Operand::Reg(r) => r.size,
        Operand::Mem(m) => m.size,
        _ => OpSize::S32,
    }
}

/// `mov dst, src` between registers (`89 /r`).
pub fn mov_rr(dst: Reg, src: Reg) -> Inst {
    mov_store(Operand::Reg(dst), src)
}

/// `mov dst, src` with `dst` a register or memory (`89 /r`).
pub fn mov_store(dst: Operand, src: Reg) -> Inst {
    let opcode = if src.size == OpSize::S8 { 0x88 } else { 0x89 };
    let enc = encoding(src.size, false, &[opcode], MR, None);
    make(Op::Mov, src.size, vec![dst, Operand::Reg(src)], enc)
}

/// `mov dst, src` with `src` a register or memory (`8B /r`).
pub fn mov_load(dst: Reg, src: Operand) -> Inst {
    let opcode = if dst.size == OpSize::S8 { 0x8a } else { 0x8b };
    let enc = encoding(dst.size, false, &[opcode], RM, None);
    make(Op::Mov, dst.size, vec![Operand::Reg(dst), src], enc)
}

/// `mov dst, imm`. A 64-bit destination uses the sign-extended `C7` form
/// when the value allows it and `movabs` otherwise.
pub fn mov_ri(dst: Reg, imm: i64) -> Inst {
    match dst.size {
        OpSize::S64 if fits_signed(imm, 4) => {
            let enc = encoding(OpSize::S64, false, &[0xc7], ext(0), Some((1, 4)));
            make(Op::Mov, OpSize::S64, vec![Operand::Reg(dst), Operand::Imm(imm)], enc)
        }
        OpSize::S64 => movabs(dst.gpr, imm),
        size => {
            let (opcode, width) = if size == OpSize::S8 { (0xb0, 1) } else { (0xb8, imm_width(size)) };
            let enc = encoding(size, false, &[opcode], OperandEnc::OpcodeReg(0), Some((1, width)));
            make(Op::Mov, size, vec![Operand::Reg(dst), Operand::Imm(imm)], enc)
        }
    }
}

/// `mov dst, imm32` always using a 4-byte immediate field (`B8+r`, or
/// `C7 /0` for 64-bit registers), so a relocation can be attached.
pub fn mov_ri32(dst: Reg, imm: i64) -> Inst {
    if dst.size == OpSize::S64 {
        let enc = encoding(OpSize::S64, false, &[0xc7], ext(0), Some((1, 4)));
        return make(Op::Mov, OpSize::S64, vec![Operand::Reg(dst), Operand::Imm(imm)], enc);
    }
    let enc = encoding(OpSize::S32, false, &[0xb8], OperandEnc::OpcodeReg(0), Some((1, 4)));
    make(Op::Mov, OpSize::S32, vec![Operand::Reg(Reg::new(dst.gpr, OpSize::S32)), Operand::Imm(imm)], enc)
}

/// `mov dst, imm` into memory (`C7 /0` or `C6 /0`).
pub fn mov_mi(dst: Mem, imm: i64) -> Inst {
    let opcode = if dst.size == OpSize::S8 { 0xc6 } else { 0xc7 };
    let enc = encoding(dst.size, false, &[opcode], ext(0), Some((1, imm_width(dst.size))));
    make(Op::Mov, dst.size, vec![Operand::Mem(dst), Operand::Imm(imm)], enc)
}

/// `movabs dst, imm64` (`REX.W B8+r`).
pub fn movabs(dst: Gpr, imm: i64) -> Inst {
    let enc = encoding(OpSize::S64, false, &[0xb8], OperandEnc::OpcodeReg(0), Some((1, 8)));
    make(
        Op::Mov,
        OpSize::S64,
        vec![Operand::Reg(Reg::new(dst, OpSize::S64)), Operand::Imm(imm)],
        enc,
    )
}

/// `lea dst, [mem]`.
pub fn lea(dst: Reg, mem: Mem) -> Inst {
    let enc = encoding(dst.size, false, &[0x8d], RM, None);
    make(Op::Lea, dst.size, vec![Operand::Reg(dst), Operand::Mem(mem)], enc)
}

/// Two-operand ALU instruction or `test` with a register source.
pub fn alu_rr(op: Op, dst: Operand, src: Reg) -> Inst {
    let byte = src.size == OpSize::S8;
    let opcode = match (op, op.alu_index()) {
        (Op::Test, _) => 0x84,
        (_, Some(n)) => n << 3,
        _ => 0x00,
    } | u8::from(!byte);
    let enc = encoding(src.size, false, &[opcode], MR, None);
    make(op, src.size, vec![dst, Operand::Reg(src)], enc)
}

/// Two-operand ALU instruction or `test` with an immediate source.
pub fn alu_ri(op: Op, dst: Operand, imm: i64) -> Inst {
    let size = operand_size(&dst);
    if op == Op::Test {
        let opcode = if size == OpSize::S8 { 0xf6 } else { 0xf7 };
        let enc = encoding(size, false, &[opcode], ext(0), Some((1, imm_width(size))));
        return make(op, size, vec![dst, Operand::Imm(imm)], enc);
    }
    let n = op.alu_index().unwrap_or(0);
    let (opcode, width) = if size == OpSize::S8 {
        (0x80, 1)
    } else if fits_signed(imm, 1) {
        (0x83, 1)
    } else {
        (0x81, imm_width(size))
    };
    let enc = encoding(size, false, &[opcode], ext(n), Some((1, width)));
    make(op, size, vec![dst, Operand::Imm(imm)], enc)
}

pub fn push_r(gpr: Gpr, arch: Arch) -> Inst {
    stack_reg(Op::Push, 0x50, gpr, arch)
}

pub fn pop_r(gpr: Gpr, arch: Arch) -> Inst {
    stack_reg(Op::Pop, 0x58, gpr, arch)
}

fn stack_reg(op: Op, opcode: u8, gpr: Gpr, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let enc = encoding(size, true, &[opcode], OperandEnc::OpcodeReg(0), None);
    make(op, size, vec![Operand::Reg(Reg::new(gpr, size))], enc)
}

/// `push imm`, using the 8-bit form when possible.
pub fn push_imm(imm: i64, arch: Arch) -> Inst {
    if fits_signed(imm, 1) {
        let size = OpSize::pointer(arch.is_64());
        let enc = encoding(size, true, &[0x6a], OperandEnc::Implicit, Some((0, 1)));
        make(Op::Push, size, vec![Operand::Imm(imm)], enc)
    } else {
        push_imm32(imm, arch)
    }
}

/// `push imm32` (`68`), always with a 4-byte field.
pub fn push_imm32(imm: i64, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let enc = encoding(size, true, &[0x68], OperandEnc::Implicit, Some((0, 4)));
    make(Op::Push, size, vec![Operand::Imm(imm)], enc)
}

/// `push [mem]` (`FF /6`).
pub fn push_mem(mut mem: Mem, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    mem.size = size;
    let enc = encoding(size, true, &[0xff], ext(6), None);
    make(Op::Push, size, vec![Operand::Mem(mem)], enc)
}

pub fn pushf(arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    make(Op::Pushf, size, vec![], encoding(size, true, &[0x9c], OperandEnc::Implicit, None))
}

pub fn popf(arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    make(Op::Popf, size, vec![], encoding(size, true, &[0x9d], OperandEnc::Implicit, None))
}

/// `call rel32`.
pub fn call_rel(rel: i64, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let enc = encoding(size, true, &[0xe8], OperandEnc::Implicit, Some((0, 4)));
    make(Op::Call, size, vec![Operand::Rel(rel)], enc)
}

/// `jmp rel32`, or `jmp rel8` when `short`.
pub fn jmp_rel(rel: i64, short: bool, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let (opcode, width) = if short { (0xeb, 1) } else { (0xe9, 4) };
    let enc = encoding(size, true, &[opcode], OperandEnc::Implicit, Some((0, width)));
    make(Op::Jmp, size, vec![Operand::Rel(rel)], enc)
}

/// `jcc rel32`, or `jcc rel8` when `short`.
pub fn jcc_rel(cc: Cond, rel: i64, short: bool, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let (opcode, width) = if short {
        (vec![0x70 | cc.encoding()], 1)
    } else {
        (vec![0x0f, 0x80 | cc.encoding()], 4)
    };
    let enc = encoding(size, true, &opcode, OperandEnc::Implicit, Some((0, width)));
    make(Op::Jcc(cc), size, vec![Operand::Rel(rel)], enc)
}

/// `call r/m` (`FF /2`).
pub fn call_indirect(target: Operand, arch: Arch) -> Inst {
    indirect(Op::Call, 2, target, arch)
}

/// `jmp r/m` (`FF /4`).
pub fn jmp_indirect(target: Operand, arch: Arch) -> Inst {
    indirect(Op::Jmp, 4, target, arch)
}

fn indirect(op: Op, n: u8, target: Operand, arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    let target = match target {
        Operand::Reg(r) => Operand::Reg(Reg::new(r.gpr, size)),
        Operand::Mem(mut m) => {
            m.size = size;
            Operand::Mem(m)
        }
        other => other,
    };
    make(op, size, vec![target], encoding(size, true, &[0xff], ext(n), None))
}

pub fn ret(arch: Arch) -> Inst {
    let size = OpSize::pointer(arch.is_64());
    make(Op::Ret, size, vec![], encoding(size, true, &[0xc3], OperandEnc::Implicit, None))
}

pub fn nop() -> Inst {
    make(Op::Nop, OpSize::S32, vec![], encoding(OpSize::S32, false, &[0x90], OperandEnc::Implicit, None))
}

pub fn int3() -> Inst {
    make(Op::Int3, OpSize::S32, vec![], encoding(OpSize::S32, false, &[0xcc], OperandEnc::Implicit, None))
}

//! Machine code encoding.
//!
//! `encode` is a pure function of the instruction and the mode. For a
//! decoded instruction it reproduces the original bytes, including
//! redundant prefixes, REX bytes and over-wide displacements; synthesized
//! instructions get the shortest encoding their [`Encoding`] allows.

use thiserror::Error;
use weft_obj::Arch;

use crate::inst::{Base, DispWidth, Inst, Mem, MemLayout, Operand, OperandEnc, Reg, RegField};
use crate::reg::Gpr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("`{0}` needs a REX prefix, which does not exist in 32-bit mode")]
    RexIn32Bit(String),
    #[error("`{0}` mixes a high byte register with a REX prefix")]
    HighByteWithRex(String),
    #[error("RIP-relative addressing does not exist in 32-bit mode")]
    RipIn32Bit,
    #[error("RIP-relative addressing cannot take an index register")]
    RipWithIndex,
    #[error("invalid scale factor {0}")]
    InvalidScale(u8),
    #[error("the stack pointer cannot be an index register")]
    StackIndex,
    #[error("value {value:#x} does not fit in a {width}-byte field")]
    OutOfRange { value: i64, width: u8 },
    #[error("operand {index} of `{mnemonic}` does not match its encoding")]
    OperandMismatch { mnemonic: String, index: usize },
}

/// Encoded bytes plus the positions of the relocatable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    /// Offset of the ModR/M displacement (or `moffs`) field.
    pub disp_at: Option<usize>,
    /// Offset of the immediate or relative field.
    pub imm_at: Option<usize>,
}

impl Encoded {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode one instruction.
pub fn encode(inst: &Inst, arch: Arch) -> Result<Encoded, EncodeError> {
    let is_64 = arch.is_64();
    let mut buf = inst.enc.prefixes.clone();

    let mut rxb = 0u8;
    let mut force_rex = false;
    let mut high = false;
    for o in &inst.operands {
        if let Operand::Reg(r) = o {
            force_rex |= r.needs_rex_presence();
            high |= r.high;
        }
    }
    match inst.enc.operands {
        OperandEnc::ModRm { reg, rm } => {
            if let RegField::Operand(i) = reg {
                if reg_operand(inst, i)?.gpr.needs_rex() {
                    rxb |= 0x04;
                }
            }
            match operand(inst, rm)? {
                Operand::Reg(r) if r.gpr.needs_rex() => rxb |= 0x01,
                Operand::Reg(_) => {}
                Operand::Mem(m) => {
                    if m.base_reg().is_some_and(Gpr::needs_rex) {
                        rxb |= 0x01;
                    }
                    if m.index.is_some_and(Gpr::needs_rex) {
                        rxb |= 0x02;
                    }
                }
                _ => return Err(mismatch(inst, rm)),
            }
        }
        OperandEnc::OpcodeReg(i) => {
            if reg_operand(inst, i)?.gpr.needs_rex() {
                rxb |= 0x01;
            }
        }
        OperandEnc::Implicit | OperandEnc::Moffs(_) => {}
    }

    let mut rex = inst.enc.rex & 0x48;
    if rxb != 0 || force_rex {
        rex |= 0x40 | rxb;
    }
    if rex != 0 {
        if !is_64 {
            return Err(EncodeError::RexIn32Bit(inst.mnemonic()));
        }
        if high {
            return Err(EncodeError::HighByteWithRex(inst.mnemonic()));
        }
        buf.push(rex);
    }

    let opcode_at = buf.len();
    buf.extend_from_slice(&inst.enc.opcode);
    if let OperandEnc::OpcodeReg(i) = inst.enc.operands {
        let r = reg_operand(inst, i)?;
        if let Some(last) = buf.get_mut(opcode_at + inst.enc.opcode.len().saturating_sub(1)) {
            *last |= r.encoding();
        }
    }

    let mut disp_at = None;
    match inst.enc.operands {
        OperandEnc::ModRm { reg, rm } => {
            let reg_bits = match reg {
                RegField::Operand(i) => reg_operand(inst, i)?.encoding(),
                RegField::Ext(e) => e & 7,
            };
            match operand(inst, rm)? {
                Operand::Reg(r) => buf.push(0xc0 | (reg_bits << 3) | r.encoding()),
                Operand::Mem(m) => disp_at = encode_mem(reg_bits, m, is_64, &mut buf)?,
                _ => return Err(mismatch(inst, rm)),
            }
        }
        OperandEnc::Moffs(i) => {
            let m = match operand(inst, i)? {
                Operand::Mem(m) => m,
                _ => return Err(mismatch(inst, i)),
            };
            disp_at = Some(buf.len());
            buf.extend_from_slice(&m.disp.to_le_bytes());
        }
        OperandEnc::Implicit | OperandEnc::OpcodeReg(_) => {}
    }

    let mut imm_at = None;
    if let Some(slot) = inst.enc.imm {
        let (value, fits) = match operand(inst, slot.operand)? {
            Operand::Imm(v) => (*v, fits_imm(*v, slot.width)),
            Operand::Rel(v) => (*v, fits_signed(*v, slot.width)),
            _ => return Err(mismatch(inst, slot.operand)),
        };
        if !fits {
            return Err(EncodeError::OutOfRange {
                value,
                width: slot.width,
            });
        }
        imm_at = Some(buf.len());
        buf.extend_from_slice(&value.to_le_bytes()[..slot.width as usize]);
    }

    Ok(Encoded {
        bytes: buf,
        disp_at,
        imm_at,
    })
}

/// Encode a sequence back to back.
pub fn encode_all<'a>(
    insts: impl IntoIterator<Item = &'a Inst>,
    arch: Arch,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for inst in insts {
        out.extend_from_slice(&encode(inst, arch)?.bytes);
    }
    Ok(out)
}

/// Whether `value` fits a signed `width`-byte field.
pub fn fits_signed(value: i64, width: u8) -> bool {
    if width >= 8 {
        return true;
    }
    let bits = width as u32 * 8;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&value)
}

/// Immediates are accepted in either their signed or unsigned reading.
fn fits_imm(value: i64, width: u8) -> bool {
    if width >= 8 {
        return true;
    }
    let bits = width as u32 * 8;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << bits) - 1;
    (min..=max).contains(&value)
}

fn encode_mem(reg: u8, m: &Mem, is_64: bool, buf: &mut Vec<u8>) -> Result<Option<usize>, EncodeError> {
    let layout = m.layout.unwrap_or(MemLayout {
        disp: DispWidth::None,
        sib: false,
    });
    let scale_bits = match m.scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        s => return Err(EncodeError::InvalidScale(s)),
    };
    if m.index == Some(Gpr::Rsp) {
        return Err(EncodeError::StackIndex);
    }
    let index_bits = m.index.map_or(4, Gpr::encoding);

    let disp32 = |buf: &mut Vec<u8>| {
        let at = buf.len();
        buf.extend_from_slice(&m.disp.to_le_bytes());
        Some(at)
    };

    match m.base {
        Some(Base::Rip) => {
            if !is_64 {
                return Err(EncodeError::RipIn32Bit);
            }
            if m.index.is_some() {
                return Err(EncodeError::RipWithIndex);
            }
            buf.push((reg << 3) | 0b101);
            Ok(disp32(buf))
        }
        None => {
            // Without a base, mod=00 r/m=101 means disp32 in 32-bit mode but
            // RIP-relative in 64-bit mode, so 64-bit needs the SIB form.
            if m.index.is_none() && !is_64 && !layout.sib {
                buf.push((reg << 3) | 0b101);
            } else {
                buf.push((reg << 3) | 0b100);
                buf.push((scale_bits << 6) | (index_bits << 3) | 0b101);
            }
            Ok(disp32(buf))
        }
        Some(Base::Reg(base)) => {
            // RBP/R13 as a base always needs a displacement.
            let minimal = if m.disp == 0 && base.encoding() != 0b101 {
                DispWidth::None
            } else if fits_signed(m.disp as i64, 1) {
                DispWidth::D8
            } else {
                DispWidth::D32
            };
            let width = minimal.max(layout.disp);
            let mode = match width {
                DispWidth::None => 0x00,
                DispWidth::D8 => 0x40,
                DispWidth::D32 => 0x80,
            };
            let sib = m.index.is_some() || base.encoding() == 0b100 || layout.sib;
            if sib {
                buf.push(mode | (reg << 3) | 0b100);
                buf.push((scale_bits << 6) | (index_bits << 3) | base.encoding());
            } else {
                buf.push(mode | (reg << 3) | base.encoding());
            }
            Ok(match width {
                DispWidth::None => None,
                DispWidth::D8 => {
                    let at = buf.len();
                    buf.push(m.disp as i8 as u8);
                    Some(at)
                }
                DispWidth::D32 => disp32(buf),
            })
        }
    }
}

fn operand(inst: &Inst, index: usize) -> Result<&Operand, EncodeError> {
    inst.operands.get(index).ok_or_else(|| mismatch(inst, index))
}

fn reg_operand(inst: &Inst, index: usize) -> Result<Reg, EncodeError> {
    operand(inst, index)?.reg().ok_or_else(|| mismatch(inst, index))
}

fn mismatch(inst: &Inst, index: usize) -> EncodeError {
    EncodeError::OperandMismatch {
        mnemonic: inst.mnemonic(),
        index,
    }
}

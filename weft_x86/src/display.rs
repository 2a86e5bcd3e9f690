//! Intel-syntax rendering, used by logs and the `inspect` command.

use std::fmt;

use weft_obj::Arch;

use crate::inst::{Base, Inst, Mem, OpSize, Operand};
use crate::reg::Gpr;

fn ptr_name(size: OpSize) -> &'static str {
    match size {
        OpSize::S8 => "byte",
        OpSize::S16 => "word",
        OpSize::S32 => "dword",
        OpSize::S64 => "qword",
    }
}

fn hex(f: &mut fmt::Formatter<'_>, v: i64) -> fmt::Result {
    if v < 0 {
        write!(f, "-{:#x}", v.unsigned_abs())
    } else {
        write!(f, "{v:#x}")
    }
}

fn addr_name(r: Gpr, is_64: bool) -> &'static str {
    if is_64 {
        r.name64()
    } else {
        r.name32()
    }
}

fn write_mem(
    f: &mut fmt::Formatter<'_>,
    m: &Mem,
    is_64: bool,
    segment: Option<&str>,
    with_size: bool,
) -> fmt::Result {
    if with_size {
        write!(f, "{} ptr ", ptr_name(m.size))?;
    }
    if let Some(seg) = segment {
        write!(f, "{seg}:")?;
    }
    f.write_str("[")?;
    let mut first = true;
    match m.base {
        Some(Base::Reg(r)) => {
            f.write_str(addr_name(r, is_64))?;
            first = false;
        }
        Some(Base::Rip) => {
            f.write_str("rip")?;
            first = false;
        }
        None => {}
    }
    if let Some(index) = m.index {
        if !first {
            f.write_str(" + ")?;
        }
        write!(f, "{}*{}", addr_name(index, is_64), m.scale)?;
        first = false;
    }
    if first {
        write!(f, "{:#x}", m.disp as u32)?;
    } else if m.disp != 0 {
        f.write_str(if m.disp < 0 { " - " } else { " + " })?;
        write!(f, "{:#x}", m.disp.unsigned_abs())?;
    }
    f.write_str("]")
}

/// An instruction rendered for a particular mode.
pub struct Intel<'a> {
    inst: &'a Inst,
    is_64: bool,
}

impl Inst {
    /// Intel-syntax view using the address register names of `arch`.
    pub fn intel(&self, arch: Arch) -> Intel<'_> {
        Intel {
            inst: self,
            is_64: arch.is_64(),
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.intel(Arch::X64), f)
    }
}

impl fmt::Display for Intel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.inst;
        f.write_str(&inst.mnemonic())?;
        let segment = inst.enc.prefixes.iter().rev().find_map(|p| match p {
            0x64 => Some("fs"),
            0x65 => Some("gs"),
            _ => None,
        });
        // The access width is implied when a register operand is present.
        let has_reg = inst.operands.iter().any(|o| matches!(o, Operand::Reg(_)));
        for (i, op) in inst.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match op {
                Operand::Reg(r) => f.write_str(r.name())?,
                Operand::Imm(v) => hex(f, *v)?,
                Operand::Rel(v) => {
                    f.write_str("$")?;
                    let total = *v + inst.len as i64;
                    if total >= 0 {
                        f.write_str("+")?;
                    }
                    hex(f, total)?;
                }
                Operand::Mem(m) => write_mem(f, m, self.is_64, segment, !has_reg)?,
            }
        }
        Ok(())
    }
}

//! A small interpreter for the integer x86 subset that the fixtures and
//! the passes produce. Used to check that rewritten code still computes
//! the same results.

use weft_obj::Arch;
use weft_x86::{decode_one, Base, Cond, Gpr, Inst, Mem, Op, OpSize, Operand, Reg};

pub const IMAGE_BASE: u64 = 0x1_0000;
const MEMORY: usize = 0x10_0000;
const STACK_TOP: u64 = 0xf_0000;
const RETURN_SENTINEL: u64 = 0xdead_0000;
const STEP_LIMIT: usize = 1_000_000;

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    cf: bool,
    zf: bool,
    sf: bool,
    of: bool,
}

impl Flags {
    fn word(self) -> u64 {
        2 | self.cf as u64 | (self.zf as u64) << 6 | (self.sf as u64) << 7 | (self.of as u64) << 11
    }

    fn from_word(w: u64) -> Self {
        Self {
            cf: w & 1 != 0,
            zf: w & (1 << 6) != 0,
            sf: w & (1 << 7) != 0,
            of: w & (1 << 11) != 0,
        }
    }

    fn holds(self, cond: Cond) -> Result<bool, String> {
        Ok(match cond {
            Cond::O => self.of,
            Cond::No => !self.of,
            Cond::B => self.cf,
            Cond::Ae => !self.cf,
            Cond::E => self.zf,
            Cond::Ne => !self.zf,
            Cond::Be => self.cf || self.zf,
            Cond::A => !self.cf && !self.zf,
            Cond::S => self.sf,
            Cond::Ns => !self.sf,
            Cond::L => self.sf != self.of,
            Cond::Ge => self.sf == self.of,
            Cond::Le => self.zf || self.sf != self.of,
            Cond::G => !self.zf && self.sf == self.of,
            Cond::P | Cond::Np => return Err("parity flag is not modelled".to_string()),
        })
    }
}

fn mask(size: OpSize) -> u64 {
    match size {
        OpSize::S64 => u64::MAX,
        s => (1u64 << s.bits()) - 1,
    }
}

fn sign_extend(v: u64, size: OpSize) -> u64 {
    match size {
        OpSize::S8 => v as u8 as i8 as i64 as u64,
        OpSize::S16 => v as u16 as i16 as i64 as u64,
        OpSize::S32 => v as u32 as i32 as i64 as u64,
        OpSize::S64 => v,
    }
}

pub struct Machine {
    arch: Arch,
    regs: [u64; 16],
    flags: Flags,
    mem: Vec<u8>,
    rip: u64,
    pub steps: usize,
}

impl Machine {
    /// Load `image` at [`IMAGE_BASE`].
    pub fn new(image: &[u8], arch: Arch) -> Self {
        let mut mem = vec![0u8; MEMORY];
        let base = IMAGE_BASE as usize;
        mem[base..base + image.len()].copy_from_slice(image);
        Self {
            arch,
            regs: [0; 16],
            flags: Flags::default(),
            mem,
            rip: 0,
            steps: 0,
        }
    }

    pub fn set_reg(&mut self, gpr: Gpr, value: u64) {
        self.regs[gpr.num() as usize] = value;
    }

    pub fn reg(&self, gpr: Gpr) -> u64 {
        self.regs[gpr.num() as usize]
    }

    /// Call the function at image offset `entry` and return `rax` / `eax`.
    pub fn call(&mut self, entry: u64) -> Result<u64, String> {
        self.rip = IMAGE_BASE + entry;
        self.set_reg(Gpr::Rsp, STACK_TOP);
        self.push(RETURN_SENTINEL)?;
        while self.rip != RETURN_SENTINEL {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err("step limit exceeded".to_string());
            }
            self.step()?;
        }
        if self.reg(Gpr::Rsp) != STACK_TOP {
            return Err(format!("unbalanced stack: rsp = {:#x}", self.reg(Gpr::Rsp)));
        }
        Ok(self.reg(Gpr::Rax) & self.ptr_mask())
    }

    pub fn load(&self, addr: u64, size: OpSize) -> Result<u64, String> {
        let at = addr as usize;
        let n = size.bytes() as usize;
        let bytes = self
            .mem
            .get(at..at + n)
            .ok_or_else(|| format!("load from {addr:#x} out of bounds"))?;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, addr: u64, size: OpSize, value: u64) -> Result<(), String> {
        let at = addr as usize;
        let n = size.bytes() as usize;
        let bytes = self
            .mem
            .get_mut(at..at + n)
            .ok_or_else(|| format!("store to {addr:#x} out of bounds"))?;
        bytes.copy_from_slice(&value.to_le_bytes()[..n]);
        Ok(())
    }

    fn ptr(&self) -> OpSize {
        OpSize::pointer(self.arch.is_64())
    }

    fn ptr_mask(&self) -> u64 {
        mask(self.ptr())
    }

    fn push(&mut self, value: u64) -> Result<(), String> {
        let sp = self.reg(Gpr::Rsp).wrapping_sub(self.ptr().bytes() as u64) & self.ptr_mask();
        self.set_reg(Gpr::Rsp, sp);
        self.store(sp, self.ptr(), value)
    }

    fn pop(&mut self) -> Result<u64, String> {
        let sp = self.reg(Gpr::Rsp);
        let value = self.load(sp, self.ptr())?;
        self.set_reg(Gpr::Rsp, (sp + self.ptr().bytes() as u64) & self.ptr_mask());
        Ok(value)
    }

    fn read_reg(&self, r: Reg) -> u64 {
        let v = self.reg(r.gpr);
        if r.high {
            (v >> 8) & 0xff
        } else {
            v & mask(r.size)
        }
    }

    fn write_reg(&mut self, r: Reg, value: u64) {
        let old = self.reg(r.gpr);
        let new = match (r.size, r.high) {
            (OpSize::S64, _) => value,
            (OpSize::S32, _) => value & 0xffff_ffff,
            (OpSize::S16, _) => (old & !0xffff) | (value & 0xffff),
            (OpSize::S8, true) => (old & !0xff00) | ((value & 0xff) << 8),
            (OpSize::S8, false) => (old & !0xff) | (value & 0xff),
        };
        self.set_reg(r.gpr, new);
    }

    fn address(&self, m: &Mem, next: u64) -> u64 {
        let base = match m.base {
            Some(Base::Reg(g)) => self.reg(g),
            Some(Base::Rip) => next,
            None => 0,
        };
        let index = m.index.map_or(0, |g| self.reg(g).wrapping_mul(m.scale as u64));
        base.wrapping_add(index).wrapping_add(m.disp as i64 as u64) & self.ptr_mask()
    }

    fn read(&self, op: &Operand, size: OpSize, next: u64) -> Result<u64, String> {
        match op {
            Operand::Reg(r) => Ok(self.read_reg(*r)),
            Operand::Imm(v) => Ok(*v as u64 & mask(size)),
            Operand::Mem(m) => self.load(self.address(m, next), m.size),
            Operand::Rel(_) => Err("relative operand read as a value".to_string()),
        }
    }

    fn write(&mut self, op: &Operand, value: u64, next: u64) -> Result<(), String> {
        match op {
            Operand::Reg(r) => {
                self.write_reg(*r, value);
                Ok(())
            }
            Operand::Mem(m) => {
                let addr = self.address(m, next);
                self.store(addr, m.size, value & mask(m.size))
            }
            _ => Err("write to a non-lvalue operand".to_string()),
        }
    }

    fn operand_size(op: &Operand, default: OpSize) -> OpSize {
        match op {
            Operand::Reg(r) => r.size,
            Operand::Mem(m) => m.size,
            _ => default,
        }
    }

    fn alu(&mut self, op: Op, a: u64, b: u64, size: OpSize) -> Result<u64, String> {
        let m = mask(size);
        let sign = 1u64 << (size.bits() - 1);
        let carry = self.flags.cf as u64;
        let (r, cf, of) = match op {
            Op::Add | Op::Adc => {
                let c = if op == Op::Adc { carry } else { 0 };
                let wide = a as u128 + b as u128 + c as u128;
                let r = wide as u64 & m;
                (r, wide > m as u128, (a ^ r) & (b ^ r) & sign != 0)
            }
            Op::Sub | Op::Sbb | Op::Cmp => {
                let c = if op == Op::Sbb { carry } else { 0 };
                let r = a.wrapping_sub(b).wrapping_sub(c) & m;
                (r, (a as u128) < b as u128 + c as u128, (a ^ b) & (a ^ r) & sign != 0)
            }
            Op::And | Op::Test => (a & b, false, false),
            Op::Or => (a | b, false, false),
            Op::Xor => (a ^ b, false, false),
            other => return Err(format!("{other:?} is not an arithmetic operation")),
        };
        self.flags = Flags {
            cf,
            zf: r == 0,
            sf: r & sign != 0,
            of,
        };
        Ok(r)
    }

    fn step(&mut self) -> Result<(), String> {
        let at = self.rip as usize;
        let window = self
            .mem
            .get(at..(at + 15).min(MEMORY))
            .ok_or_else(|| format!("rip {:#x} out of bounds", self.rip))?;
        let inst = decode_one(window, self.arch)
            .ok_or_else(|| format!("undecodable instruction at {:#x}", self.rip - IMAGE_BASE))?;
        let next = self.rip + inst.len as u64;
        self.rip = next;
        self.execute(&inst, next)
            .map_err(|e| format!("{} at {:#x}: {e}", inst.intel(self.arch), next - inst.len as u64 - IMAGE_BASE))
    }

    fn execute(&mut self, inst: &Inst, next: u64) -> Result<(), String> {
        let ops = inst.operands.as_slice();
        match (inst.op, ops) {
            (Op::Nop | Op::Endbr, _) => {}
            (Op::Mov, [dst, src]) => {
                let size = Self::operand_size(dst, inst.size);
                let v = match src {
                    Operand::Imm(v) => *v as u64 & mask(size),
                    _ => self.read(src, size, next)?,
                };
                self.write(dst, v, next)?;
            }
            (Op::Movzx, [dst, src]) => {
                let v = self.read(src, Self::operand_size(src, OpSize::S8), next)?;
                self.write(dst, v, next)?;
            }
            (Op::Movsx | Op::Movsxd, [dst, src]) => {
                let size = Self::operand_size(src, OpSize::S8);
                let v = sign_extend(self.read(src, size, next)?, size);
                self.write(dst, v, next)?;
            }
            (Op::Lea, [Operand::Reg(r), Operand::Mem(m)]) => {
                let addr = self.address(m, next);
                self.write_reg(*r, addr & mask(r.size));
            }
            (Op::Add | Op::Or | Op::Adc | Op::Sbb | Op::And | Op::Sub | Op::Xor | Op::Cmp | Op::Test, [dst, src]) => {
                let size = Self::operand_size(dst, inst.size);
                let a = self.read(dst, size, next)?;
                let b = match src {
                    Operand::Imm(v) => *v as u64 & mask(size),
                    _ => self.read(src, size, next)?,
                };
                let r = self.alu(inst.op, a, b, size)?;
                if !matches!(inst.op, Op::Cmp | Op::Test) {
                    self.write(dst, r, next)?;
                }
            }
            (Op::Inc | Op::Dec, [dst]) => {
                let size = Self::operand_size(dst, inst.size);
                let a = self.read(dst, size, next)?;
                let cf = self.flags.cf;
                let op = if inst.op == Op::Inc { Op::Add } else { Op::Sub };
                let r = self.alu(op, a, 1, size)?;
                self.flags.cf = cf;
                self.write(dst, r, next)?;
            }
            (Op::Neg, [dst]) => {
                let size = Self::operand_size(dst, inst.size);
                let a = self.read(dst, size, next)?;
                let r = self.alu(Op::Sub, 0, a, size)?;
                self.write(dst, r, next)?;
            }
            (Op::Not, [dst]) => {
                let size = Self::operand_size(dst, inst.size);
                let a = self.read(dst, size, next)?;
                self.write(dst, !a & mask(size), next)?;
            }
            (Op::Push, [src]) => {
                let v = match src {
                    Operand::Imm(v) => *v as u64 & self.ptr_mask(),
                    Operand::Reg(r) => self.read_reg(Reg::new(r.gpr, self.ptr())),
                    _ => self.read(src, self.ptr(), next)?,
                };
                self.push(v)?;
            }
            (Op::Pop, [dst]) => {
                let v = self.pop()?;
                match dst {
                    Operand::Reg(r) => self.write_reg(Reg::new(r.gpr, self.ptr()), v),
                    _ => self.write(dst, v, next)?,
                }
            }
            (Op::Pushf, _) => self.push(self.flags.word())?,
            (Op::Popf, _) => {
                let w = self.pop()?;
                self.flags = Flags::from_word(w);
            }
            (Op::Call | Op::Jmp, [target]) => {
                let dest = match target {
                    Operand::Rel(r) => next.wrapping_add(*r as u64) & self.ptr_mask(),
                    other => self.read(other, self.ptr(), next)?,
                };
                if inst.op == Op::Call {
                    self.push(next)?;
                }
                self.rip = dest;
            }
            (Op::Jcc(cond), [Operand::Rel(r)]) => {
                if self.flags.holds(cond)? {
                    self.rip = next.wrapping_add(*r as u64) & self.ptr_mask();
                }
            }
            (Op::Ret, rest) => {
                self.rip = self.pop()?;
                if let [Operand::Imm(n)] = rest {
                    let sp = self.reg(Gpr::Rsp).wrapping_add(*n as u64);
                    self.set_reg(Gpr::Rsp, sp);
                }
            }
            (Op::Leave, _) => {
                let bp = self.reg(Gpr::Rbp);
                self.set_reg(Gpr::Rsp, bp);
                let v = self.pop()?;
                self.set_reg(Gpr::Rbp, v);
            }
            _ => return Err("not modelled".to_string()),
        }
        Ok(())
    }
}

/// Run the function at `entry` of a flat image and return its result.
pub fn run(image: &[u8], arch: Arch, entry: u64) -> Result<u64, String> {
    Machine::new(image, arch).call(entry)
}

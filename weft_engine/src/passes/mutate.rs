//! `mutate`: per-instruction rewrites that keep behavior.
//!
//! Each decoded instruction gets at most one of: constant decomposition,
//! stack-string materialization, or an equivalent substitution. Noise that
//! touches neither registers nor flags may follow any instruction that
//! falls through. Every choice draws from the build's random stream.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use weft_obj::{Arch, Module, ObjectFormat, SectionKind, SymbolId};
use weft_x86::encode::fits_signed;
use weft_x86::{build, Gpr, Inst, Mem, Op, OpSize, Operand, Reg};

use super::PassContext;
use crate::error::EngineError;
use crate::layout::{CodeLayout, Field, Function, Item, Node};

/// Longest string, terminator included, moved onto the stack.
const MAX_STACK_STRING: usize = 64;
/// Windows x64 callee home area left below a stack string.
const SHADOW_SPACE: i32 = 32;

#[derive(Debug, Default)]
struct Counts {
    split: usize,
    strings: usize,
    substituted: usize,
    noise: usize,
}

enum Kind {
    Split,
    String,
    Substitute,
}

#[tracing::instrument(skip_all, name = "Mutate")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let Some(mut layout) = CodeLayout::build(module, cx.log)? else {
        cx.log.warn(&module.name, "mutate: no code section");
        return Ok(());
    };
    let mut counts = Counts::default();
    for f in layout.functions.iter_mut() {
        if f.opaque {
            continue;
        }
        let mutator = Mutator::new(module, f, layout.arch);
        f.items = mutator.run(&f.items, cx.rng, &mut counts);
    }
    layout.apply(module)?;
    tracing::debug!(?counts, "mutated");
    cx.log.applied(
        &module.name,
        format!(
            "mutate: {} constant split(s), {} stack string(s), {} substitution(s), {} noise instruction(s)",
            counts.split, counts.strings, counts.substituted, counts.noise
        ),
    );
    Ok(())
}

struct Mutator<'a> {
    module: &'a Module,
    arch: Arch,
    /// Pushing below the stack pointer cannot clobber live data: 32-bit
    /// code, Windows, or a function that calls out (no red zone in use).
    stack_safe: bool,
    /// Stack strings are allowed: frame-pointer function that restores the
    /// stack pointer from the frame pointer and never addresses memory
    /// through the stack pointer.
    strings_ok: bool,
    /// `[target, branch]` old-offset ranges of backward branches.
    loops: Vec<(u64, u64)>,
}

impl<'a> Mutator<'a> {
    fn new(module: &'a Module, f: &Function, arch: Arch) -> Self {
        let has_call = f.nodes().any(|n| n.inst.is_call());
        let stack_safe = arch == Arch::X86 || module.format != ObjectFormat::Elf || has_call;
        let loops = f
            .nodes()
            .filter_map(|n| match (n.branch, n.origin) {
                (Some(target), Some(origin)) if target <= origin => Some((target, origin)),
                _ => None,
            })
            .collect();
        Self {
            module,
            arch,
            stack_safe,
            strings_ok: stack_safe && frame_pointer_function(f, arch),
            loops,
        }
    }

    fn ptr(&self) -> OpSize {
        OpSize::pointer(self.arch.is_64())
    }

    fn run(&self, items: &[Item], rng: &mut StdRng, counts: &mut Counts) -> Vec<Item> {
        let mut out = Vec::with_capacity(items.len() * 2);
        for (i, item) in items.iter().enumerate() {
            let Item::Inst(node) = item else {
                out.push(item.clone());
                continue;
            };
            let flags_dead = flags_dead_after(items, i);
            let mut options: Vec<(Kind, Vec<Node>)> = Vec::new();
            if node.is_plain() && rebuildable(&node.inst) {
                if let Some(seq) = self.split_constant(&node.inst, flags_dead, rng) {
                    options.push((Kind::Split, seq));
                }
                for inst in self.substitutes(&node.inst, flags_dead) {
                    options.push((Kind::Substitute, vec![Node::new(inst)]));
                }
            } else if let Some(seq) = self.stack_string(node) {
                options.push((Kind::String, seq));
            }

            let chosen = if !options.is_empty() && rng.gen_ratio(2, 3) {
                let pick = rng.gen_range(0..options.len());
                Some(options.swap_remove(pick))
            } else {
                None
            };
            match chosen {
                Some((kind, mut seq)) => {
                    match kind {
                        Kind::Split => counts.split += 1,
                        Kind::String => counts.strings += 1,
                        Kind::Substitute => counts.substituted += 1,
                    }
                    if let Some(first) = seq.first_mut() {
                        first.origin = node.origin;
                    }
                    out.extend(seq.into_iter().map(Item::Inst));
                }
                None => out.push(item.clone()),
            }

            if !node.inst.is_terminator() && rng.gen_ratio(1, 3) {
                out.extend(self.noise(rng).into_iter().map(Item::Inst));
                counts.noise += 1;
            }
        }
        out
    }

    /// `mov r, v` → `mov r, v - b; lea r, [r + b]`, or `xor r, r; add r, v`
    /// when the flags are dead.
    fn split_constant(&self, inst: &Inst, flags_dead: bool, rng: &mut StdRng) -> Option<Vec<Node>> {
        let (Op::Mov, [Operand::Reg(r), Operand::Imm(v)]) = (inst.op, inst.operands.as_slice()) else {
            return None;
        };
        let (r, v) = (*r, *v);
        if r.size != OpSize::S32 && r.size != OpSize::S64 {
            return None;
        }
        let full = Reg::new(r.gpr, self.ptr());

        let use_add = flags_dead && (r.size == OpSize::S32 || fits_signed(v, 4)) && rng.gen_bool(0.5);
        if use_add {
            let low = Reg::new(r.gpr, OpSize::S32);
            return Some(vec![
                Node::new(build::alu_rr(Op::Xor, Operand::Reg(low), low)),
                Node::new(build::alu_ri(Op::Add, Operand::Reg(r), v)),
            ]);
        }

        let b: i64 = rng.gen_range(1..=0x7fff_ffff);
        let first = if r.size == OpSize::S32 {
            build::mov_ri(r, (v as u32).wrapping_sub(b as u32) as i64)
        } else {
            build::mov_ri(r, v.checked_sub(b)?)
        };
        Some(vec![
            Node::new(first),
            Node::new(build::lea(r, Mem::base(full.size, full.gpr, b as i32))),
        ])
    }

    /// Equivalent single-instruction forms.
    fn substitutes(&self, inst: &Inst, flags_dead: bool) -> Vec<Inst> {
        let mut out = Vec::new();
        let wide = |r: &Reg| r.size == OpSize::S32 || r.size == OpSize::S64;
        match (inst.op, inst.operands.as_slice()) {
            (Op::Mov, [Operand::Reg(a), Operand::Reg(b)]) if wide(a) && a.size == b.size => {
                // 89 /r and 8B /r.
                if inst.enc.opcode == [0x89] {
                    out.push(build::mov_load(*a, Operand::Reg(*b)));
                } else {
                    out.push(build::mov_rr(*a, *b));
                }
            }
            (Op::Xor, [Operand::Reg(a), Operand::Reg(b)]) if a == b && wide(a) => {
                out.push(build::alu_rr(Op::Sub, Operand::Reg(*a), *a));
                if flags_dead {
                    out.push(build::mov_ri(Reg::new(a.gpr, OpSize::S32), 0));
                }
            }
            (Op::Sub, [Operand::Reg(a), Operand::Reg(b)]) if a == b && wide(a) => {
                out.push(build::alu_rr(Op::Xor, Operand::Reg(*a), *a));
            }
            (Op::Mov, [Operand::Reg(r), Operand::Imm(0)]) if wide(r) && flags_dead => {
                let low = Reg::new(r.gpr, OpSize::S32);
                out.push(build::alu_rr(Op::Xor, Operand::Reg(low), low));
            }
            (Op::Test | Op::Or, [Operand::Reg(a), Operand::Reg(b)]) if a == b && !a.high => {
                // `or r32, r32` clears the upper half on x86-64.
                if !(self.arch.is_64() && a.size == OpSize::S32) {
                    let other = if inst.op == Op::Test { Op::Or } else { Op::Test };
                    out.push(build::alu_rr(other, Operand::Reg(*a), *a));
                }
            }
            (Op::Add | Op::Sub, [dst @ (Operand::Reg(_) | Operand::Mem(_)), Operand::Imm(v)]) if flags_dead => {
                let size = match dst {
                    Operand::Reg(r) if !r.high => Some(r.size),
                    Operand::Mem(m) => Some(m.size),
                    _ => None,
                };
                if let Some(size) = size {
                    let width = size.bytes().min(4);
                    let v = sign_extend(*v, size);
                    if let Some(n) = v.checked_neg().filter(|n| fits_signed(*n, width)) {
                        let other = if inst.op == Op::Add { Op::Sub } else { Op::Add };
                        out.push(build::alu_ri(other, *dst, n));
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Replace a reference to a short read-only string by a copy built on
    /// the stack.
    fn stack_string(&self, node: &Node) -> Option<Vec<Node>> {
        if !self.strings_ok || node.relocs.len() != 1 || node.branch.is_some() {
            return None;
        }
        let origin = node.origin?;
        if self.loops.iter().any(|&(a, b)| (a..=b).contains(&origin)) {
            return None;
        }
        let reloc = &node.relocs[0];
        let inst = &node.inst;
        let ptr = self.ptr();
        enum Site {
            Register(Gpr),
            Push,
        }
        let site = match (inst.op, inst.operands.as_slice(), reloc.field) {
            (Op::Lea, [Operand::Reg(r), Operand::Mem(m)], Field::Disp)
                if r.size == ptr && m.base_reg().is_none() && m.index.is_none() =>
            {
                Site::Register(r.gpr)
            }
            (Op::Mov, [Operand::Reg(r), Operand::Imm(_)], Field::Imm) if !self.arch.is_64() && r.size == ptr => {
                Site::Register(r.gpr)
            }
            (Op::Push, [Operand::Imm(_)], Field::Imm) if !self.arch.is_64() => Site::Push,
            _ => return None,
        };
        if let Site::Register(g) = site {
            if g == Gpr::Rsp || g == Gpr::Rbp {
                return None;
            }
        }
        let text = self.read_string(reloc.symbol, reloc.delta)?;

        let mut seq = Vec::new();
        if self.arch.is_64() {
            let Site::Register(r) = site else { return None };
            // An even number of 8-byte chunks keeps the stack aligned.
            let mut chunks: Vec<i64> = text
                .chunks(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b[..c.len()].copy_from_slice(c);
                    i64::from_le_bytes(b)
                })
                .collect();
            if chunks.len() % 2 == 1 {
                chunks.push(0);
            }
            for &chunk in chunks.iter().rev() {
                seq.push(Node::new(build::movabs(r, chunk)));
                seq.push(Node::new(build::push_r(r, self.arch)));
            }
            seq.push(Node::new(build::mov_rr(Reg::new(r, ptr), Reg::new(Gpr::Rsp, ptr))));
            seq.push(Node::new(build::lea(
                Reg::new(Gpr::Rsp, ptr),
                Mem::base(ptr, Gpr::Rsp, -SHADOW_SPACE),
            )));
        } else {
            let mut chunks: Vec<i64> = text
                .chunks(4)
                .map(|c| {
                    let mut b = [0u8; 4];
                    b[..c.len()].copy_from_slice(c);
                    i32::from_le_bytes(b) as i64
                })
                .collect();
            // 16-byte multiples, counting the pushed pointer for `push`.
            let slots = if matches!(site, Site::Push) { 1 } else { 0 };
            while (chunks.len() + slots) % 4 != 0 {
                chunks.push(0);
            }
            for &chunk in chunks.iter().rev() {
                seq.push(Node::new(build::push_imm32(chunk, self.arch)));
            }
            match site {
                Site::Register(r) => {
                    seq.push(Node::new(build::mov_rr(Reg::new(r, ptr), Reg::new(Gpr::Rsp, ptr))));
                }
                Site::Push => seq.push(Node::new(build::push_r(Gpr::Rsp, self.arch))),
            }
        }
        Some(seq)
    }

    /// Bytes of the NUL-terminated printable string at `symbol + delta`,
    /// terminator included.
    fn read_string(&self, symbol: SymbolId, delta: i64) -> Option<Vec<u8>> {
        let (section, offset) = self.module.symbols.try_get(symbol)?.location()?;
        let section = self.module.section(section);
        if section.kind != SectionKind::ReadOnly {
            return None;
        }
        let start = usize::try_from(offset as i64 + delta).ok()?;
        let tail = section.data.get(start..)?;
        let end = tail.iter().take(MAX_STACK_STRING).position(|&b| b == 0)?;
        let text = &tail[..=end];
        text[..end]
            .iter()
            .all(|&b| b.is_ascii_graphic() || b == b' ' || b == b'\t' || b == b'\n' || b == b'\r')
            .then(|| text.to_vec())
    }

    /// An instruction sequence with no effect on registers, memory or
    /// flags.
    fn noise(&self, rng: &mut StdRng) -> Vec<Node> {
        const REGS: [Gpr; 6] = [Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::Rbx, Gpr::Rsi, Gpr::Rdi];
        let ptr = self.ptr();
        let g = REGS.choose(rng).copied().unwrap_or(Gpr::Rax);
        let r = Reg::new(g, ptr);
        let choices = if self.stack_safe { 4 } else { 3 };
        match rng.gen_range(0..choices) {
            0 => vec![Node::new(build::nop())],
            1 => vec![Node::new(build::mov_rr(r, r))],
            2 => vec![Node::new(build::lea(r, Mem::base(ptr, g, 0)))],
            _ => vec![
                Node::new(build::push_r(g, self.arch)),
                Node::new(build::pop_r(g, self.arch)),
            ],
        }
    }
}

/// `push rbp; mov rbp, rsp` prologue, every return preceded by `leave` or
/// `mov rsp, rbp; pop rbp`, and no memory operand based on the stack
/// pointer.
fn frame_pointer_function(f: &Function, arch: Arch) -> bool {
    let ptr = OpSize::pointer(arch.is_64());
    let insts: Vec<&Inst> = f.nodes().map(|n| &n.inst).collect();
    if insts.len() != f.items.len() {
        return false;
    }
    let is = |inst: &Inst, op: Op, operands: &[Operand]| inst.op == op && inst.operands == operands;
    let rbp = Operand::Reg(Reg::new(Gpr::Rbp, ptr));
    let rsp = Operand::Reg(Reg::new(Gpr::Rsp, ptr));

    let body = match insts.first() {
        Some(i) if i.op == Op::Endbr => &insts[1..],
        _ => &insts[..],
    };
    if body.len() < 2 || !is(body[0], Op::Push, &[rbp]) || !is(body[1], Op::Mov, &[rbp, rsp]) {
        return false;
    }
    if insts.iter().any(|i| i.mem().is_some_and(|m| m.is_stack_relative())) {
        return false;
    }
    let mut saw_ret = false;
    for (i, inst) in insts.iter().enumerate() {
        if inst.op != Op::Ret {
            continue;
        }
        saw_ret = true;
        let leave = i >= 1 && insts[i - 1].op == Op::Leave;
        let restore = i >= 2 && is(insts[i - 1], Op::Pop, &[rbp]) && is(insts[i - 2], Op::Mov, &[rsp, rbp]);
        if !leave && !restore {
            return false;
        }
    }
    saw_ret
}

/// Whether nothing reads the flags written at `items[i]` before they are
/// overwritten. Unknown successors count as readers.
fn flags_dead_after(items: &[Item], i: usize) -> bool {
    for item in &items[i + 1..] {
        let Item::Inst(node) = item else { return false };
        let inst = &node.inst;
        if inst.reads_flags() {
            return false;
        }
        if inst.defines_flags() || inst.op == Op::Ret || inst.is_call() {
            return true;
        }
        if inst.is_jump() || inst.is_terminator() {
            return false;
        }
    }
    false
}

/// Rebuilding from operands drops lock, repeat and segment prefixes.
fn rebuildable(inst: &Inst) -> bool {
    inst.enc.prefixes.iter().all(|&p| p == 0x66)
}

fn sign_extend(v: i64, size: OpSize) -> i64 {
    match size {
        OpSize::S8 => v as i8 as i64,
        OpSize::S16 => v as i16 as i64,
        OpSize::S32 => v as i32 as i64,
        OpSize::S64 => v,
    }
}

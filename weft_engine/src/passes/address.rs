//! Shared machinery of `fixptrs` and `fixbss`: replace an instruction that
//! embeds an absolute address by a call to an accessor function followed
//! by the same operation on a register holding the address.
//!
//! Accessor contract: it returns its value in `eax` / `rax` and preserves
//! every other register and the flags. On x86-64 it must not depend on
//! stack alignment.

use weft_obj::{Arch, Module, RelocKind, SymbolId};
use weft_x86::{build, Gpr, Inst, Mem, Op, OpSize, Operand, Reg};
use weft_x86::inst::OperandEnc;

use crate::error::EngineError;
use crate::layout::{Anchor, CodeLayout, Field, Item, Node, NodeReloc};
use crate::log::BuildLog;

/// How the register receives the address once the accessor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BaseLoad {
    /// The accessor returns the address of the instruction after the call;
    /// add the distance from there to `symbol + delta`.
    Relative { symbol: SymbolId, delta: i64 },
    /// The accessor returns a base; add a constant offset.
    Offset(i64),
}

pub(super) struct AddressRewriter<'a> {
    pub pass: &'static str,
    pub arch: Arch,
    pub accessor: SymbolId,
    pub accessor_name: &'a str,
    /// Bytes stepped over before the first push (the System V red zone).
    pub red_zone: i32,
}

const SCRATCH_32: [Gpr; 5] = [Gpr::Rdx, Gpr::Rcx, Gpr::Rbx, Gpr::Rsi, Gpr::Rdi];
const SCRATCH_64: [Gpr; 9] = [
    Gpr::Rdx,
    Gpr::Rcx,
    Gpr::Rbx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

impl AddressRewriter<'_> {
    fn ptr(&self) -> OpSize {
        OpSize::pointer(self.arch.is_64())
    }

    fn ptr_bytes(&self) -> i32 {
        self.ptr().bytes() as i32
    }

    fn reg(&self, gpr: Gpr) -> Reg {
        Reg::new(gpr, self.ptr())
    }

    fn unsupported(&self, function: &str, node: &Node, reason: &str) -> EngineError {
        EngineError::UnsupportedAddressingForm {
            pass: self.pass,
            function: function.to_string(),
            offset: node.origin.unwrap_or(0),
            inst: node.inst.intel(self.arch).to_string(),
            reason: reason.to_string(),
        }
    }

    /// Rewrite every selected reference in the code section. Returns the
    /// number of rewritten instructions.
    pub fn rewrite_module(
        &self,
        module: &mut Module,
        log: &mut BuildLog,
        select: impl Fn(&Module, SymbolId, RelocKind, i64) -> Option<BaseLoad>,
    ) -> Result<usize, EngineError> {
        let Some(mut layout) = CodeLayout::build(module, log)? else {
            return Ok(0);
        };
        let skip = layout.function_of(module, self.accessor_name);
        let mut count = 0;
        for (fi, f) in layout.functions.iter_mut().enumerate() {
            if Some(fi) == skip {
                continue;
            }
            let mut items = Vec::with_capacity(f.items.len());
            for item in std::mem::take(&mut f.items) {
                match item {
                    Item::Inst(node) => {
                        let selected = node
                            .relocs
                            .iter()
                            .find_map(|r| select(module, r.symbol, r.kind, r.delta).map(|b| (r.field, b)));
                        match selected {
                            Some((field, base)) => {
                                let replacement = self.rewrite(&f.name, &node, field, base)?;
                                items.extend(replacement.into_iter().map(Item::Inst));
                                count += 1;
                            }
                            None => items.push(Item::Inst(node)),
                        }
                    }
                    Item::Bytes { origin, bytes, relocs } => {
                        if let Some(r) = relocs.iter().find(|r| select(module, r.symbol, r.kind, r.delta).is_some()) {
                            return Err(EngineError::UnsupportedAddressingForm {
                                pass: self.pass,
                                function: f.name.clone(),
                                offset: origin + r.offset,
                                inst: "<undecoded>".to_string(),
                                reason: "reference inside code that could not be decoded".to_string(),
                            });
                        }
                        items.push(Item::Bytes { origin, bytes, relocs });
                    }
                }
            }
            f.items = items;
        }
        if count > 0 {
            layout.apply(module)?;
        }
        Ok(count)
    }

    fn scratch(&self, function: &str, node: &Node) -> Result<Gpr, EngineError> {
        let candidates: &[Gpr] = if self.arch.is_64() { &SCRATCH_64 } else { &SCRATCH_32 };
        candidates
            .iter()
            .copied()
            .find(|&g| !node.inst.uses(g))
            .ok_or_else(|| self.unsupported(function, node, "no free scratch register"))
    }

    fn call_accessor(&self) -> Node {
        Node::with_reloc(
            build::call_rel(0, self.arch),
            NodeReloc::new(Field::Imm, self.accessor, RelocKind::Relative32, 0),
        )
    }

    /// `lea dst, [acc + X]`
    fn load_address(&self, dst: Reg, base: BaseLoad) -> Node {
        match base {
            BaseLoad::Relative { symbol, delta } => {
                let mut mem = Mem::base(self.ptr(), Gpr::Rax, 0);
                mem.force_disp32();
                let reloc = NodeReloc {
                    anchor: Anchor::Start,
                    ..NodeReloc::new(Field::Disp, symbol, RelocKind::Relative32, delta)
                };
                Node::with_reloc(build::lea(dst, mem), reloc)
            }
            BaseLoad::Offset(offset) => Node::new(build::lea(dst, Mem::base(self.ptr(), Gpr::Rax, offset as i32))),
        }
    }

    fn stack_step(&self, delta: i32) -> Node {
        let rsp = self.reg(Gpr::Rsp);
        Node::new(build::lea(rsp, Mem::base(self.ptr(), Gpr::Rsp, delta)))
    }

    fn push(&self, gpr: Gpr) -> Node {
        Node::new(build::push_r(gpr, self.arch))
    }

    fn pop(&self, gpr: Gpr) -> Node {
        Node::new(build::pop_r(gpr, self.arch))
    }

    /// Sequence leaving the address in `dst`, saving the accumulator
    /// around the call when `dst` is not the accumulator.
    fn address_into(&self, dst: Reg, base: BaseLoad) -> Vec<Node> {
        let load = self.load_address(dst, base);
        if dst.gpr == Gpr::Rax {
            vec![self.call_accessor(), load]
        } else {
            vec![self.push(Gpr::Rax), self.call_accessor(), load, self.pop(Gpr::Rax)]
        }
    }

    /// The memory operand `mem` re-expressed on top of `s`, which holds
    /// the address the relocation used to supply. `adjust` is the number
    /// of bytes pushed since the original instruction's stack pointer.
    fn rebase(&self, mem: &Mem, s: Gpr, adjust: i32) -> (Option<Node>, Mem) {
        match (mem.base_reg(), mem.index) {
            (None, None) => (None, Mem::base(mem.size, s, 0)),
            (Some(Gpr::Rsp), None) => (None, Mem::base_index(mem.size, Gpr::Rsp, s, 1, adjust)),
            (Some(b), None) => (None, Mem::base_index(mem.size, s, b, 1, 0)),
            (None, Some(i)) => (None, Mem::base_index(mem.size, s, i, mem.scale, 0)),
            (Some(b), Some(i)) => {
                let sum = if b == Gpr::Rsp {
                    Mem::base_index(self.ptr(), b, s, 1, adjust)
                } else {
                    Mem::base_index(self.ptr(), s, b, 1, 0)
                };
                let pre = Node::new(build::lea(self.reg(s), sum));
                (Some(pre), Mem::base_index(mem.size, s, i, mem.scale, 0))
            }
        }
    }

    /// `inst` with its memory operand replaced.
    fn with_mem(&self, inst: &Inst, mem: Mem) -> Inst {
        if let OperandEnc::Moffs(at) = inst.enc.operands {
            return match (at, inst.operands.first().and_then(Operand::reg)) {
                (1, Some(dst)) => build::mov_load(dst, Operand::Mem(mem)),
                _ => match inst.operands.get(1).and_then(Operand::reg) {
                    Some(src) => build::mov_store(Operand::Mem(mem), src),
                    None => inst.clone(),
                },
            };
        }
        let mut out = inst.clone();
        if let Some(m) = out.mem_mut() {
            *m = mem;
        }
        out
    }

    fn adjusted(&self, operand: &Operand, adjust: i32) -> Operand {
        match operand {
            Operand::Mem(m) if m.is_stack_relative() => Operand::Mem(Mem {
                disp: m.disp + adjust,
                layout: None,
                ..*m
            }),
            other => *other,
        }
    }

    fn wrap(&self, body: Vec<Node>) -> Vec<Node> {
        if self.red_zone == 0 {
            return body;
        }
        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(self.stack_step(-self.red_zone));
        out.extend(body);
        out.push(self.stack_step(self.red_zone));
        out
    }

    /// Replacement for `node`, whose `field` relocation is the address to
    /// rebase.
    fn rewrite(&self, function: &str, node: &Node, field: Field, base: BaseLoad) -> Result<Vec<Node>, EngineError> {
        let inst = &node.inst;
        if node.relocs.len() > 1 {
            return Err(self.unsupported(function, node, "displacement and immediate are both relocated"));
        }
        if inst.operands.iter().any(|o| matches!(o, Operand::Reg(r) if r.gpr == Gpr::Rsp)) {
            return Err(self.unsupported(function, node, "uses the stack pointer as a value"));
        }
        if node.branch.is_some() {
            return Err(self.unsupported(function, node, "also refers to code through its displacement"));
        }
        let ptr = self.ptr_bytes();
        let rz = self.red_zone;
        let dst_reg = inst.operands.first().and_then(Operand::reg);

        let mut out = match (field, inst.op, dst_reg) {
            (Field::Imm, Op::Mov, Some(dst)) => {
                if dst.size.bytes() < 4 {
                    return Err(self.unsupported(function, node, "address truncated below 32 bits"));
                }
                self.wrap(self.address_into(dst, base))
            }
            (Field::Imm, Op::Push, _) => {
                let mut seq = vec![self.stack_step(-ptr)];
                seq.extend(self.wrap(vec![
                    self.push(Gpr::Rax),
                    self.call_accessor(),
                    self.load_address(self.reg(Gpr::Rax), base),
                    Node::new(build::mov_store(
                        Operand::Mem(Mem::base(self.ptr(), Gpr::Rsp, ptr + rz)),
                        self.reg(Gpr::Rax),
                    )),
                    self.pop(Gpr::Rax),
                ]));
                seq
            }
            (Field::Imm, op, _) if op == Op::Mov || op == Op::Test || op.alu_index().is_some() => {
                let Some(dst) = inst.operands.first() else {
                    return Err(self.unsupported(function, node, "missing destination"));
                };
                let size = match dst {
                    Operand::Reg(r) => r.size,
                    Operand::Mem(m) => m.size,
                    _ => OpSize::S8,
                };
                if size.bytes() < 4 {
                    return Err(self.unsupported(function, node, "address operand narrower than a pointer"));
                }
                let s = self.scratch(function, node)?;
                let dst = self.adjusted(dst, rz + ptr);
                let src = Reg::new(s, size);
                let operation = if op == Op::Mov {
                    build::mov_store(dst, src)
                } else {
                    build::alu_rr(op, dst, src)
                };
                let mut body = vec![self.push(s)];
                body.extend(self.address_into(self.reg(s), base));
                body.push(Node::new(operation));
                body.push(self.pop(s));
                self.wrap(body)
            }
            (Field::Imm, _, _) => {
                return Err(self.unsupported(function, node, "immediate address in an instruction that cannot take a register"))
            }
            (Field::Disp, Op::Call | Op::Jmp, _) => {
                return Err(self.unsupported(function, node, "indirect transfer through the address"))
            }
            (Field::Disp, Op::Pop, _) => return Err(self.unsupported(function, node, "pop into the address")),
            (Field::Disp, Op::Push, _) => {
                let Some(mem) = inst.mem() else {
                    return Err(self.unsupported(function, node, "missing memory operand"));
                };
                let s = self.scratch(function, node)?;
                let (pre, mem) = self.rebase(mem, s, rz + 2 * ptr);
                let mut body = vec![self.push(s)];
                body.extend(self.address_into(self.reg(s), base));
                body.extend(pre);
                body.push(Node::new(build::mov_load(self.reg(s), Operand::Mem(Mem { size: self.ptr(), ..mem }))));
                body.push(Node::new(build::mov_store(
                    Operand::Mem(Mem::base(self.ptr(), Gpr::Rsp, ptr + rz)),
                    self.reg(s),
                )));
                body.push(self.pop(s));
                let mut seq = vec![self.stack_step(-ptr)];
                seq.extend(self.wrap(body));
                seq
            }
            (Field::Disp, _, _) if inst.implicit_regs().contains(&Gpr::Rsp) => {
                return Err(self.unsupported(function, node, "implicitly uses the stack"))
            }
            (Field::Disp, _, _) => {
                let Some(mem) = inst.mem() else {
                    return Err(self.unsupported(function, node, "missing memory operand"));
                };
                let s = self.scratch(function, node)?;
                let (pre, mem) = self.rebase(mem, s, rz + ptr);
                let mut body = vec![self.push(s)];
                body.extend(self.address_into(self.reg(s), base));
                body.extend(pre);
                body.push(Node::new(self.with_mem(inst, mem)));
                body.push(self.pop(s));
                self.wrap(body)
            }
        };
        if let Some(first) = out.first_mut() {
            first.origin = node.origin;
        }
        Ok(out)
    }
}

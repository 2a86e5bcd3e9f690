//! Instruction-level view of a module's code section.
//!
//! [`CodeLayout::build`] splits the code section at function symbols and
//! decodes every function into [`Node`]s. Relocations are attached to the
//! instruction field they patch and restated as a semantic target
//! (`symbol + delta`); direct branches and RIP-relative operands that the
//! assembler resolved without a relocation remember the old offset they
//! point at. Passes reorder, drop, insert and replace items freely, and
//! [`CodeLayout::apply`] re-encodes everything, rebuilds the section bytes
//! and rewrites relocations and symbols so every reference keeps its
//! target.
//!
//! A function that does not decode completely, or that carries a
//! relocation outside an instruction field, is kept as one opaque byte
//! block and moves as a unit.

use std::collections::HashMap;

use weft_obj::verify::validate;
use weft_obj::{Arch, Module, RelocKind, Relocation, SectionId, SectionKind, SymbolId, SymbolKind};
use weft_x86::encode::fits_signed;
use weft_x86::{encode, Decoder, Inst, Operand};

use crate::error::EngineError;
use crate::log::BuildLog;

/// Which field of an instruction a relocation patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// ModR/M displacement or `moffs`.
    Disp,
    /// Immediate or branch displacement.
    Imm,
}

/// The point a PC-relative field is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// End of the instruction: branches and RIP-relative operands.
    End,
    /// Start of the instruction: a register loaded with the address of the
    /// instruction itself, as the accessor sequences of `fixptrs` do.
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReloc {
    pub field: Field,
    pub symbol: SymbolId,
    pub kind: RelocKind,
    /// The instruction refers to `symbol + delta`.
    pub delta: i64,
    pub anchor: Anchor,
}

impl NodeReloc {
    pub fn new(field: Field, symbol: SymbolId, kind: RelocKind, delta: i64) -> Self {
        Self {
            field,
            symbol,
            kind,
            delta,
            anchor: Anchor::End,
        }
    }

    /// Distance from the relocated field to the anchor.
    fn bias(&self, len: usize, field_at: usize) -> i64 {
        if !self.kind.is_pc_relative() {
            return 0;
        }
        match self.anchor {
            Anchor::End => (len - field_at) as i64,
            Anchor::Start => -(field_at as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub inst: Inst,
    /// Offset the instruction was decoded from. Replacements inherit the
    /// origin of the instruction they replace; inserted code has none.
    pub origin: Option<u64>,
    /// Old offset targeted by a relocation-free branch or RIP-relative
    /// operand.
    pub branch: Option<u64>,
    pub relocs: Vec<NodeReloc>,
}

impl Node {
    pub fn new(inst: Inst) -> Self {
        Self {
            inst,
            origin: None,
            branch: None,
            relocs: Vec::new(),
        }
    }

    pub fn with_reloc(inst: Inst, reloc: NodeReloc) -> Self {
        Self {
            relocs: vec![reloc],
            ..Self::new(inst)
        }
    }

    pub fn reloc(&self, field: Field) -> Option<&NodeReloc> {
        self.relocs.iter().find(|r| r.field == field)
    }

    /// No relocation and no resolved branch: the instruction can be
    /// rewritten by looking at it alone.
    pub fn is_plain(&self) -> bool {
        self.relocs.is_empty() && self.branch.is_none()
    }

    /// Zero relocated fields and make sure displacements keep room for
    /// the relocation.
    fn prepare(&mut self) {
        let imm_operand = self.inst.enc.imm.map(|s| s.operand);
        for r in &self.relocs {
            match r.field {
                Field::Disp => {
                    if let Some(m) = self.inst.mem_mut() {
                        m.disp = 0;
                        if !m.is_rip() {
                            m.force_disp32();
                        }
                    }
                }
                Field::Imm => match imm_operand.and_then(|i| self.inst.operands.get_mut(i)) {
                    Some(Operand::Imm(v)) | Some(Operand::Rel(v)) => *v = 0,
                    _ => {}
                },
            }
        }
    }
}

/// A relocation inside an opaque byte block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReloc {
    pub offset: u64,
    pub symbol: SymbolId,
    pub kind: RelocKind,
    /// Refers to `symbol + delta`, measured from the end of the field for
    /// PC-relative kinds.
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Inst(Node),
    Bytes {
        origin: u64,
        bytes: Vec<u8>,
        relocs: Vec<BlobReloc>,
    },
}

impl Item {
    pub fn node(&self) -> Option<&Node> {
        match self {
            Item::Inst(n) => Some(n),
            Item::Bytes { .. } => None,
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut Node> {
        match self {
            Item::Inst(n) => Some(n),
            Item::Bytes { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Extent in the section as built.
    pub start: u64,
    pub end: u64,
    pub items: Vec<Item>,
    pub opaque: bool,
}

impl Function {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.items.iter().filter_map(Item::node)
    }

    pub fn contains(&self, offset: u64) -> bool {
        (self.start..self.end).contains(&offset)
    }

    pub fn instruction_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn mnemonics(&self) -> Vec<String> {
        self.nodes().map(|n| n.inst.mnemonic()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CodeLayout {
    pub arch: Arch,
    pub section: SectionId,
    pub functions: Vec<Function>,
    old_size: u64,
}

impl CodeLayout {
    /// Decode the code section of `module`. `None` when there is none.
    #[tracing::instrument(skip_all, name = "Build code layout")]
    pub fn build(module: &Module, log: &mut BuildLog) -> Result<Option<Self>, EngineError> {
        let Some(section) = module.canonical_section(SectionKind::Code) else {
            return Ok(None);
        };
        let data = &module.section(section).data;
        let old_size = data.len() as u64;

        let mut starts: Vec<(u64, Option<&str>, bool)> = module
            .symbols_in(section)
            .filter(|(_, s)| s.kind != SymbolKind::Section)
            .filter(|(_, s)| s.kind == SymbolKind::Function || !s.is_local())
            .filter_map(|(_, s)| {
                let (_, offset) = s.location()?;
                (offset < old_size).then_some((offset, Some(s.name.as_str()), !s.is_local()))
            })
            .collect();
        starts.push((0, None, false));
        // Global names first so they win the dedup below.
        starts.sort_by(|a, b| a.0.cmp(&b.0).then(b.2.cmp(&a.2)).then(b.1.is_some().cmp(&a.1.is_some())));
        starts.dedup_by_key(|s| s.0);

        let mut by_offset: HashMap<u64, Vec<&Relocation>> = HashMap::new();
        for (_, r) in module.relocations_in(section) {
            by_offset.entry(r.offset).or_default().push(r);
        }

        let mut functions = Vec::with_capacity(starts.len());
        for (i, &(start, name, _)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map_or(old_size, |s| s.0);
            if start == end {
                continue;
            }
            let name = name.map_or_else(|| format!("{}+{start:#x}", module.section(section).name), str::to_string);
            let relocs: Vec<&Relocation> = (start..end)
                .filter_map(|o| by_offset.get(&o))
                .flatten()
                .copied()
                .collect();
            let function = match decode_function(module.arch, data, start, end, old_size, &relocs) {
                Ok(items) => Function {
                    name,
                    start,
                    end,
                    items,
                    opaque: false,
                },
                Err(reason) => {
                    log.warn(
                        &module.name,
                        format!("`{name}` is kept as an opaque block: {reason}"),
                    );
                    Function {
                        name,
                        start,
                        end,
                        items: vec![opaque_block(data, start, end, &relocs)],
                        opaque: true,
                    }
                }
            };
            functions.push(function);
        }

        tracing::debug!(
            module = %module.name,
            functions = functions.len(),
            opaque = functions.iter().filter(|f| f.opaque).count(),
            "decoded code section"
        );
        Ok(Some(Self {
            arch: module.arch,
            section,
            functions,
            old_size,
        }))
    }

    pub fn has_opaque(&self) -> bool {
        self.functions.iter().any(|f| f.opaque)
    }

    /// Index of the function whose original extent covers `offset`.
    pub fn function_at(&self, offset: u64) -> Option<usize> {
        self.functions.iter().position(|f| f.contains(offset))
    }

    /// Index of the function defining `name`.
    pub fn function_of(&self, module: &Module, name: &str) -> Option<usize> {
        let (section, offset) = module.symbol_location(name)?;
        if section != self.section {
            return None;
        }
        self.function_at(offset)
    }

    /// Index of the function containing the entry symbol.
    pub fn entry_function(&self, module: &Module, entry: &str) -> Result<usize, EngineError> {
        self.function_of(module, entry)
            .ok_or_else(|| EngineError::undefined(entry, "entry point must be a function in the code section"))
    }

    /// Old offset in this code section that `symbol + delta` refers to.
    pub fn code_target(&self, module: &Module, symbol: SymbolId, delta: i64) -> Option<u64> {
        let (section, offset) = module.symbols.try_get(symbol)?.location()?;
        if section != self.section {
            return None;
        }
        u64::try_from(offset as i64 + delta).ok()
    }

    /// Re-encode every function in order and write the result back.
    #[tracing::instrument(skip_all, name = "Apply code layout")]
    pub fn apply(mut self, module: &mut Module) -> Result<(), EngineError> {
        let arch = self.arch;
        for f in &mut self.functions {
            for item in &mut f.items {
                if let Item::Inst(n) = item {
                    n.prepare();
                }
            }
        }

        // Resolve relocation-free branches, widening short ones that no
        // longer reach, until positions settle.
        let (positions, map) = loop {
            let positions = self.positions()?;
            let map = self.offset_map(&positions);
            let mut widened = false;
            for (fi, f) in self.functions.iter_mut().enumerate() {
                for (ii, item) in f.items.iter_mut().enumerate() {
                    let Item::Inst(node) = item else { continue };
                    let Some(old) = node.branch else { continue };
                    let target = map.lookup(old).ok_or_else(|| {
                        EngineError::invariant(format!("`{}` branches to {old:#x}, which has no counterpart", f.name))
                    })?;
                    let (pos, len) = positions[fi][ii];
                    let value = target as i64 - (pos + len) as i64;
                    if node.inst.rel().is_some() {
                        let width = node.inst.rel_width().unwrap_or(4);
                        if fits_signed(value, width) {
                            node.inst.set_rel(value);
                        } else if node.inst.widen_branch() {
                            widened = true;
                        } else {
                            return Err(EngineError::invariant(format!(
                                "branch in `{}` cannot reach {target:#x}",
                                f.name
                            )));
                        }
                    } else if let Some(m) = node.inst.mem_mut() {
                        m.disp = i32::try_from(value).map_err(|_| {
                            EngineError::invariant(format!("RIP-relative operand in `{}` out of range", f.name))
                        })?;
                    }
                }
            }
            if !widened {
                break (positions, map);
            }
        };

        let code = self.section;
        let old_locations: Vec<Option<(SectionId, u64)>> =
            module.symbols.iter().map(|(_, s)| s.location()).collect();

        // New symbol offsets in the code section; `None` drops the symbol.
        let mut function_sizes: HashMap<u64, u64> = HashMap::new();
        for (fi, f) in self.functions.iter().enumerate() {
            let start = positions[fi].first().map_or(0, |p| p.0);
            let end = positions[fi].last().map_or(start, |p| p.0 + p.1);
            function_sizes.insert(start, end - start);
        }
        let new_size = positions.iter().flatten().map(|p| p.0 + p.1).max().unwrap_or(0);
        let mut new_offset: Vec<Option<u64>> = Vec::with_capacity(old_locations.len());
        for (id, sym) in module.symbols.iter() {
            let value = match old_locations[id.index()] {
                Some((sec, _)) if sec == code && sym.kind == SymbolKind::Section => Some(0),
                Some((sec, old)) if sec == code => match map.lookup(old) {
                    Some(new) => Some(new),
                    None if old == self.old_size => Some(new_size),
                    None if self.functions.iter().any(|f| f.contains(old)) => {
                        return Err(EngineError::invariant(format!(
                            "symbol `{}` points into the middle of an instruction",
                            sym.name
                        )))
                    }
                    None => None,
                },
                _ => Some(0),
            };
            new_offset.push(value);
        }
        let map_target = |symbol: SymbolId, delta: i64| -> Option<i64> {
            match old_locations.get(symbol.index()).copied().flatten() {
                Some((sec, old)) if sec == code => {
                    let target = map.lookup(u64::try_from(old as i64 + delta).ok()?)?;
                    Some(target as i64 - new_offset[symbol.index()]? as i64)
                }
                _ => Some(delta),
            }
        };

        // References from other sections into moved code.
        for r in module.relocations.iter_mut().filter(|r| r.section != code) {
            let Some((sec, _)) = old_locations.get(r.symbol.index()).copied().flatten() else {
                continue;
            };
            if sec != code {
                continue;
            }
            if new_offset[r.symbol.index()].is_none() {
                return Err(EngineError::invariant(format!(
                    "relocation at {:#x} refers to removed code",
                    r.offset
                )));
            }
            if let Some(delta) = map_target(r.symbol, r.addend) {
                r.addend = delta;
            }
        }

        // Re-emit the code section.
        module.relocations.retain(|r| r.section != code);
        let mut bytes = Vec::with_capacity(new_size as usize);
        for f in &self.functions {
            for item in &f.items {
                match item {
                    Item::Inst(node) => {
                        let enc = encode(&node.inst, arch).map_err(|source| EngineError::Encode {
                            function: f.name.clone(),
                            source,
                        })?;
                        let pos = bytes.len() as u64;
                        for r in &node.relocs {
                            let field_at = match r.field {
                                Field::Disp => enc.disp_at,
                                Field::Imm => enc.imm_at,
                            }
                            .ok_or_else(|| {
                                EngineError::invariant(format!(
                                    "`{}` in `{}` lost its relocated field",
                                    node.inst.intel(arch),
                                    f.name
                                ))
                            })?;
                            let delta = map_target(r.symbol, r.delta).ok_or_else(|| {
                                EngineError::invariant(format!(
                                    "`{}` in `{}` refers to code that no longer exists",
                                    node.inst.intel(arch),
                                    f.name
                                ))
                            })?;
                            module.relocations.push(Relocation {
                                section: code,
                                offset: pos + field_at as u64,
                                symbol: r.symbol,
                                kind: r.kind,
                                addend: delta - r.bias(enc.len(), field_at),
                            });
                        }
                        bytes.extend_from_slice(&enc.bytes);
                    }
                    Item::Bytes {
                        bytes: blob, relocs, ..
                    } => {
                        let pos = bytes.len() as u64;
                        for r in relocs {
                            let bias = if r.kind.is_pc_relative() { r.kind.width() as i64 } else { 0 };
                            let delta = map_target(r.symbol, r.delta).unwrap_or(r.delta);
                            module.relocations.push(Relocation {
                                section: code,
                                offset: pos + r.offset,
                                symbol: r.symbol,
                                kind: r.kind,
                                addend: delta - bias,
                            });
                        }
                        bytes.extend_from_slice(blob);
                    }
                }
            }
        }
        module.section_mut(code).set_data(bytes);

        let mut keep = vec![true; new_offset.len()];
        for (i, value) in new_offset.iter().enumerate() {
            let Some((sec, _)) = old_locations[i] else { continue };
            if sec != code {
                continue;
            }
            let id = SymbolId(i as u32);
            match value {
                Some(new) => {
                    let sym = module.symbols.get_mut(id);
                    if let weft_obj::SymbolDef::Section { offset, .. } = &mut sym.def {
                        *offset = *new;
                    }
                    if sym.kind == SymbolKind::Function {
                        if let Some(&size) = function_sizes.get(new) {
                            sym.size = size;
                        }
                    }
                }
                None => keep[i] = false,
            }
        }
        let keep_sections = vec![true; module.sections.len()];
        module.prune(&keep_sections, &keep);
        module.relocations.sort_by_key(|r| (r.section, r.offset));

        let check = validate(module);
        if check.dangling_relocations != 0 || !check.is_ok() {
            return Err(EngineError::invariant(format!(
                "code layout left {} dangling relocation(s): {check}",
                check.dangling_relocations
            )));
        }
        Ok(())
    }

    /// `(offset, length)` of every item.
    fn positions(&self) -> Result<Vec<Vec<(u64, u64)>>, EngineError> {
        let mut pos = 0u64;
        let mut out = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            let mut items = Vec::with_capacity(f.items.len());
            for item in &f.items {
                let len = match item {
                    Item::Inst(n) => encode(&n.inst, self.arch)
                        .map_err(|source| EngineError::Encode {
                            function: f.name.clone(),
                            source,
                        })?
                        .len() as u64,
                    Item::Bytes { bytes, .. } => bytes.len() as u64,
                };
                items.push((pos, len));
                pos += len;
            }
            out.push(items);
        }
        Ok(out)
    }

    fn offset_map(&self, positions: &[Vec<(u64, u64)>]) -> OffsetMap {
        let mut entries = Vec::new();
        for (fi, f) in self.functions.iter().enumerate() {
            for (ii, item) in f.items.iter().enumerate() {
                let new = positions[fi][ii].0;
                match item {
                    Item::Inst(n) => {
                        if let Some(origin) = n.origin {
                            entries.push((origin, 0, new));
                        }
                    }
                    Item::Bytes { origin, bytes, .. } => entries.push((*origin, bytes.len() as u64, new)),
                }
            }
        }
        entries.sort_by_key(|e| e.0);
        let end = positions.iter().flatten().map(|p| p.0 + p.1).max().unwrap_or(0);
        OffsetMap {
            entries,
            old_end: self.old_size,
            new_end: end,
        }
    }
}

/// Old offset → new offset. Instructions map only at their start; opaque
/// blocks map byte for byte.
struct OffsetMap {
    /// `(old, block length or 0, new)`, sorted by old offset.
    entries: Vec<(u64, u64, u64)>,
    old_end: u64,
    new_end: u64,
}

impl OffsetMap {
    fn lookup(&self, old: u64) -> Option<u64> {
        let i = self.entries.partition_point(|e| e.0 <= old);
        if i > 0 {
            let (start, len, new) = self.entries[i - 1];
            if start == old {
                return Some(new);
            }
            if old < start + len {
                return Some(new + (old - start));
            }
        }
        (old == self.old_end).then_some(self.new_end)
    }
}

fn opaque_block(data: &[u8], start: u64, end: u64, relocs: &[&Relocation]) -> Item {
    Item::Bytes {
        origin: start,
        bytes: data[start as usize..end as usize].to_vec(),
        relocs: relocs
            .iter()
            .map(|r| BlobReloc {
                offset: r.offset - start,
                symbol: r.symbol,
                kind: r.kind,
                delta: r.addend + if r.kind.is_pc_relative() { r.kind.width() as i64 } else { 0 },
            })
            .collect(),
    }
}

fn decode_function(
    arch: Arch,
    data: &[u8],
    start: u64,
    end: u64,
    section_size: u64,
    relocs: &[&Relocation],
) -> Result<Vec<Item>, String> {
    let range = &data[start as usize..end as usize];
    let mut items = Vec::new();
    let mut claimed = 0;
    for item in Decoder::new(range, arch) {
        let (at, inst) = item.map_err(|u| format!("unrecognized encoding at +{:#x}", u.offset))?;
        let origin = start + at as u64;
        let len = inst.len as u64;
        let enc = encode(&inst, arch).map_err(|e| format!("cannot re-encode `{}`: {e}", inst.intel(arch)))?;

        let mut node = Node {
            origin: Some(origin),
            ..Node::new(inst)
        };
        for r in relocs.iter().filter(|r| (origin..origin + len).contains(&r.offset)) {
            let field_at = (r.offset - origin) as usize;
            let field = if enc.disp_at == Some(field_at) {
                Field::Disp
            } else if enc.imm_at == Some(field_at) {
                Field::Imm
            } else {
                return Err(format!("relocation at {:#x} is not on an operand field", r.offset));
            };
            let mut reloc = NodeReloc::new(field, r.symbol, r.kind, 0);
            reloc.delta = r.addend + reloc.bias(len as usize, field_at);
            node.relocs.push(reloc);
            claimed += 1;
        }

        let has_imm_reloc = node.reloc(Field::Imm).is_some();
        let has_disp_reloc = node.reloc(Field::Disp).is_some();
        let local_target = if let Some(rel) = node.inst.rel().filter(|_| !has_imm_reloc) {
            Some(origin as i64 + len as i64 + rel)
        } else if let Some(m) = node.inst.mem().filter(|m| m.is_rip() && !has_disp_reloc) {
            Some(origin as i64 + len as i64 + m.disp as i64)
        } else {
            None
        };
        if let Some(target) = local_target {
            if !(0..=section_size as i64).contains(&target) {
                return Err(format!("`{}` leaves the section", node.inst.intel(arch)));
            }
            node.branch = Some(target as u64);
        }
        items.push(Item::Inst(node));
    }
    if claimed != relocs.len() {
        return Err("relocation overlaps two instructions".to_string());
    }
    Ok(items)
}

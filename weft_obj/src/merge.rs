//! Module merging: section concatenation and symbol-table union.

use crate::error::ObjError;
use crate::module::{Binding, Module, Relocation, SectionId, Symbol, SymbolDef, SymbolId, SymbolKind};

impl Module {
    /// Merge `other` into `self`.
    ///
    /// Sections of the same kind are concatenated. Undefined references
    /// bind to definitions from either side, weak definitions yield to
    /// strong ones, and two strong definitions of one global must have
    /// identical contents or the merge fails with `DuplicateSymbol`.
    pub fn merge(mut self, other: Module) -> Result<Module, ObjError> {
        if self.arch != other.arch {
            return Err(ObjError::ArchMismatch {
                first: self.name.clone(),
                first_arch: self.arch,
                second: other.name.clone(),
                second_arch: other.arch,
            });
        }
        if self.format == crate::module::ObjectFormat::Raw {
            self.format = other.format;
        }

        let mut placed: Vec<(SectionId, u64)> = Vec::with_capacity(other.sections.len());
        for sec in &other.sections {
            let id = self.ensure_section(sec.kind);
            let base = if sec.kind == crate::module::SectionKind::Bss {
                self.section_mut(id).reserve(sec.virtual_size, sec.align)
            } else {
                self.section_mut(id).append(&sec.data, sec.align)
            };
            placed.push((id, base));
        }

        let mut symbol_map: Vec<SymbolId> = Vec::with_capacity(other.symbols.len());
        let mut addend_shift: Vec<i64> = Vec::with_capacity(other.symbols.len());
        for (other_id, sym) in other.symbols.iter() {
            let def = match sym.def {
                SymbolDef::Section { section, offset } => {
                    let (new, base) = placed[section.index()];
                    SymbolDef::Section {
                        section: new,
                        offset: base + offset,
                    }
                }
                d => d,
            };
            if sym.kind == SymbolKind::Section {
                let (new, base) = sym
                    .location()
                    .map(|(s, _)| placed[s.index()])
                    .ok_or_else(|| ObjError::malformed(&other.name, "section symbol without section"))?;
                let target = self
                    .section_symbol(new)
                    .ok_or_else(|| ObjError::malformed(&self.name, "section without section symbol"))?;
                symbol_map.push(target);
                addend_shift.push(base as i64);
                continue;
            }
            let incoming = Symbol { def, ..sym.clone() };
            let id = if incoming.is_local() {
                self.symbols.add(incoming)
            } else if let Some(existing) = self.symbols.lookup(&incoming.name) {
                self.resolve_duplicate(existing, incoming, &other, other_id)?
            } else {
                self.symbols.add(incoming)
            };
            symbol_map.push(id);
            addend_shift.push(0);
        }

        for r in &other.relocations {
            let (section, base) = placed[r.section.index()];
            self.relocations.push(Relocation {
                section,
                offset: base + r.offset,
                symbol: symbol_map[r.symbol.index()],
                kind: r.kind,
                addend: r.addend + addend_shift[r.symbol.index()],
            });
        }

        tracing::debug!(
            module = %self.name,
            merged = %other.name,
            symbols = self.symbols.len(),
            "merged module"
        );
        Ok(self)
    }

    fn resolve_duplicate(
        &mut self,
        existing: SymbolId,
        incoming: Symbol,
        other: &Module,
        other_id: SymbolId,
    ) -> Result<SymbolId, ObjError> {
        let current = self.symbols.get(existing).clone();
        match (current.is_defined(), incoming.is_defined()) {
            (_, false) => Ok(existing),
            (false, true) => {
                *self.symbols.get_mut(existing) = incoming;
                Ok(existing)
            }
            (true, true) => {
                if incoming.binding == Binding::Weak {
                    Ok(existing)
                } else if current.binding == Binding::Weak {
                    *self.symbols.get_mut(existing) = incoming;
                    Ok(existing)
                } else if self.same_contents(existing, other, other_id) {
                    Ok(existing)
                } else {
                    Err(ObjError::DuplicateSymbol {
                        symbol: incoming.name,
                        first: self.name.clone(),
                        second: other.name.clone(),
                    })
                }
            }
        }
    }

    /// Whether a definition in `self` and one in `other` have byte-identical
    /// extents with identical relocations.
    fn same_contents(&self, ours: SymbolId, other: &Module, theirs: SymbolId) -> bool {
        let (Some((a_sec, a_start, a_end)), Some((b_sec, b_start, b_end))) =
            (self.symbol_extent(ours), other.symbol_extent(theirs))
        else {
            return false;
        };
        if a_end - a_start != b_end - b_start || a_start == a_end {
            return false;
        }
        let a = &self.section(a_sec).data;
        let b = &other.section(b_sec).data;
        let range = |data: &[u8], s: u64, e: u64| data.get(s as usize..e as usize).map(<[u8]>::to_vec);
        if range(a, a_start, a_end) != range(b, b_start, b_end) {
            return false;
        }
        let relocs = |m: &Module, sec: SectionId, s: u64, e: u64| {
            let mut v: Vec<_> = m
                .relocations_in(sec)
                .filter(|(_, r)| r.offset >= s && r.offset < e)
                .map(|(_, r)| {
                    (
                        r.offset - s,
                        m.symbols.get(r.symbol).name.clone(),
                        r.kind,
                        r.addend,
                    )
                })
                .collect();
            v.sort_by(|x, y| x.0.cmp(&y.0));
            v
        };
        relocs(self, a_sec, a_start, a_end) == relocs(other, b_sec, b_start, b_end)
    }

    /// Byte extent `[start, end)` of a defined symbol: its declared size,
    /// or up to the next symbol of the same section when the size is
    /// unknown.
    pub fn symbol_extent(&self, id: SymbolId) -> Option<(SectionId, u64, u64)> {
        let sym = self.symbols.try_get(id)?;
        let (section, start) = sym.location()?;
        if sym.size > 0 {
            return Some((section, start, start + sym.size));
        }
        let end = self
            .symbols_in(section)
            .filter(|(_, s)| s.kind != SymbolKind::Section)
            .filter_map(|(_, s)| s.location().map(|(_, o)| o))
            .filter(|&o| o > start)
            .min()
            .unwrap_or_else(|| self.section(section).size());
        Some((section, start, end))
    }
}

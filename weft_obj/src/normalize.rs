//! Normalization of ELF and COFF relocatable objects into [`Module`]s.
//!
//! Input sections are folded into one canonical section per kind (so
//! `.text.foo`, `.text$mn` and `.text` all land in `.text`), section
//! symbols collapse onto the canonical section symbol, and implicit
//! addends are moved out of the section bytes into the relocation table.

use std::collections::HashMap;

use object::read::archive::ArchiveFile;
use object::{
    Architecture, BinaryFormat, FileKind, Object, ObjectKind, ObjectSection, ObjectSymbol,
    RelocationEncoding, RelocationKind, RelocationTarget, SectionIndex, SymbolIndex,
    SymbolSection,
};

use crate::error::ObjError;
use crate::module::{
    Arch, Binding, Import, Module, ObjectFormat, RelocKind, Relocation, SectionId, SectionKind,
    Symbol, SymbolDef, SymbolKind,
};

/// Input sections that never survive normalization: unwind tables would
/// pin every function alive and are meaningless once code moves.
const DISCARDED_SECTIONS: &[&str] = &[".eh_frame", ".pdata", ".xdata"];

/// Load an object or an archive of objects. Archive members are
/// normalized and merged into a single module.
pub fn load(name: &str, data: &[u8]) -> Result<Module, ObjError> {
    if !is_archive(data) {
        return normalize(name, data);
    }
    let mut members = load_archive(name, data)?.into_iter();
    let Some(first) = members.next() else {
        return Err(ObjError::malformed(name, "archive contains no objects"));
    };
    let mut merged = members.try_fold(first, |acc, m| acc.merge(m))?;
    merged.name = name.to_string();
    Ok(merged)
}

pub fn is_archive(data: &[u8]) -> bool {
    data.starts_with(b"!<arch>\n")
}

/// Normalize every object member of an `ar` archive. Members that are
/// not relocatable objects (symbol tables, short import entries) are
/// skipped.
pub fn load_archive(name: &str, data: &[u8]) -> Result<Vec<Module>, ObjError> {
    let archive = ArchiveFile::parse(data).map_err(|e| ObjError::malformed(name, e.to_string()))?;
    let mut modules = Vec::new();
    for member in archive.members() {
        let member = member.map_err(|e| ObjError::malformed(name, e.to_string()))?;
        let member_name = format!("{name}({})", String::from_utf8_lossy(member.name()));
        let bytes = member
            .data(data)
            .map_err(|e| ObjError::malformed(&member_name, e.to_string()))?;
        match FileKind::parse(bytes) {
            Ok(FileKind::Elf32 | FileKind::Elf64 | FileKind::Coff) => {
                modules.push(normalize(&member_name, bytes)?);
            }
            _ => tracing::debug!(member = %member_name, "skipping non-object archive member"),
        }
    }
    Ok(modules)
}

/// Wrap raw bytes as a module with a single read-only section.
pub fn raw(name: &str, data: &[u8], arch: Arch) -> Module {
    let mut module = Module::new(name, arch, ObjectFormat::Raw);
    let id = module.ensure_section(SectionKind::ReadOnly);
    module.section_mut(id).append(data, 1);
    module
}

/// Parse a relocatable object and normalize it.
pub fn normalize(name: &str, data: &[u8]) -> Result<Module, ObjError> {
    let file = object::File::parse(data).map_err(|e| ObjError::malformed(name, e.to_string()))?;
    let arch = match file.architecture() {
        Architecture::X86_64 => Arch::X64,
        Architecture::I386 => Arch::X86,
        other => {
            return Err(ObjError::malformed(
                name,
                format!("unsupported architecture {other:?}"),
            ))
        }
    };
    let format = match file.format() {
        BinaryFormat::Elf => ObjectFormat::Elf,
        BinaryFormat::Coff => ObjectFormat::Coff,
        other => {
            return Err(ObjError::malformed(
                name,
                format!("unsupported container {other:?}"),
            ))
        }
    };
    if file.kind() != ObjectKind::Relocatable {
        return Err(ObjError::malformed(name, "not a relocatable object"));
    }

    let mut module = Module::new(name, arch, format);

    // Classify input sections, then lay them out kind by kind. COFF
    // grouped sections (`.text$a`, `.text$b`) are ordered by suffix.
    let mut inputs = Vec::new();
    for section in file.sections() {
        let section_name = section
            .name()
            .map_err(|e| ObjError::malformed(name, e.to_string()))?
            .to_string();
        if let Some(kind) = classify_section(&section_name, section.kind()) {
            inputs.push((kind, section_name, section));
        } else if matches!(
            section.kind(),
            object::SectionKind::Tls | object::SectionKind::UninitializedTls
        ) {
            return Err(ObjError::malformed(
                name,
                format!("thread-local section `{section_name}` is not supported"),
            ));
        }
    }
    if format == ObjectFormat::Coff {
        inputs.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| coff_group_key(&a.1).cmp(&coff_group_key(&b.1)))
        });
    } else {
        inputs.sort_by_key(|input| input.0);
    }

    let mut placement: HashMap<SectionIndex, (SectionId, u64)> = HashMap::new();
    for (kind, section_name, section) in &inputs {
        let id = module.ensure_section(*kind);
        let align = section.align().max(1);
        let offset = if *kind == SectionKind::Bss {
            module.section_mut(id).reserve(section.size(), align)
        } else {
            let bytes = section
                .data()
                .map_err(|e| ObjError::malformed(name, format!("{section_name}: {e}")))?;
            module.section_mut(id).append(bytes, align)
        };
        placement.insert(section.index(), (id, offset));
    }

    let mut symbol_map: HashMap<SymbolIndex, crate::module::SymbolId> = HashMap::new();
    let mut section_symbols: HashMap<SymbolIndex, SectionIndex> = HashMap::new();
    for sym in file.symbols() {
        match sym.kind() {
            object::SymbolKind::File => continue,
            object::SymbolKind::Section => {
                if let Some(idx) = sym.section_index() {
                    section_symbols.insert(sym.index(), idx);
                }
                continue;
            }
            _ => {}
        }
        let sym_name = sym
            .name()
            .map_err(|e| ObjError::malformed(name, e.to_string()))?;
        if sym_name.is_empty() {
            continue;
        }
        let def = match sym.section() {
            SymbolSection::Section(idx) => match placement.get(&idx) {
                Some(&(section, base)) => SymbolDef::Section {
                    section,
                    offset: base + sym.address(),
                },
                None => continue,
            },
            SymbolSection::Undefined => SymbolDef::Undefined,
            // COFF feature markers such as `@feat.00`.
            SymbolSection::Absolute if sym_name.starts_with('@') => continue,
            SymbolSection::Absolute => SymbolDef::Absolute(sym.address()),
            SymbolSection::Common => {
                let bss = module.ensure_section(SectionKind::Bss);
                let align = common_alignment(format, sym.address(), sym.size());
                let offset = module.section_mut(bss).reserve(sym.size(), align);
                SymbolDef::Section {
                    section: bss,
                    offset,
                }
            }
            _ => continue,
        };
        let binding = if sym.is_weak() {
            Binding::Weak
        } else if sym.is_global() {
            Binding::Global
        } else {
            Binding::Local
        };
        let in_code = matches!(def, SymbolDef::Section { section, .. }
            if module.section(section).kind.is_code());
        let kind = if def == SymbolDef::Undefined && Import::parse(sym_name).is_some() {
            SymbolKind::Import
        } else {
            match sym.kind() {
                object::SymbolKind::Text => SymbolKind::Function,
                object::SymbolKind::Data => SymbolKind::Data,
                _ if in_code && binding != Binding::Local => SymbolKind::Function,
                _ => SymbolKind::Unknown,
            }
        };
        let id = module.symbols.add(Symbol {
            name: sym_name.to_string(),
            def,
            binding,
            kind,
            size: sym.size(),
        });
        symbol_map.insert(sym.index(), id);
    }

    for (_, section_name, section) in &inputs {
        let (section_id, base) = placement[&section.index()];
        let input_len = section.data().map(|d| d.len() as u64).unwrap_or(0);
        for (offset, reloc) in section.relocations() {
            let kind = reloc_kind(&reloc).ok_or_else(|| {
                ObjError::malformed(
                    name,
                    format!(
                        "unsupported relocation {:?}/{} at {section_name}+{offset:#x}",
                        reloc.kind(),
                        reloc.size()
                    ),
                )
            })?;
            if offset + kind.width() as u64 > input_len {
                return Err(ObjError::malformed(
                    name,
                    format!("relocation at {section_name}+{offset:#x} is out of range"),
                ));
            }
            let section_target = |idx: SectionIndex| -> Result<_, ObjError> {
                let &(target, target_base) = placement.get(&idx).ok_or_else(|| {
                    ObjError::malformed(
                        name,
                        format!("relocation at {section_name}+{offset:#x} targets a discarded section"),
                    )
                })?;
                let sym = module.section_symbol(target).ok_or_else(|| {
                    ObjError::malformed(name, "canonical section has no section symbol")
                })?;
                Ok((sym, target_base as i64))
            };
            let (symbol, extra) = match reloc.target() {
                RelocationTarget::Symbol(idx) => {
                    if let Some(&id) = symbol_map.get(&idx) {
                        (id, 0)
                    } else if let Some(&sec) = section_symbols.get(&idx) {
                        section_target(sec)?
                    } else {
                        return Err(ObjError::malformed(
                            name,
                            format!(
                                "relocation at {section_name}+{offset:#x} references an unknown symbol"
                            ),
                        ));
                    }
                }
                RelocationTarget::Section(idx) => section_target(idx)?,
                _ => {
                    return Err(ObjError::malformed(
                        name,
                        format!("relocation at {section_name}+{offset:#x} has no symbol"),
                    ))
                }
            };

            let field = (base + offset) as usize;
            let data = &mut module.section_mut(section_id).data;
            let implicit = if reloc.has_implicit_addend() {
                read_field(&data[field..], kind.width())
            } else {
                0
            };
            data[field..field + kind.width()].fill(0);
            module.relocations.push(Relocation {
                section: section_id,
                offset: base + offset,
                symbol,
                kind,
                addend: reloc.addend() + implicit + extra,
            });
        }
    }

    tracing::debug!(
        module = %module.name,
        arch = %module.arch,
        sections = module.sections.len(),
        symbols = module.symbols.len(),
        relocations = module.relocations.len(),
        "normalized object"
    );
    Ok(module)
}

fn classify_section(name: &str, kind: object::SectionKind) -> Option<SectionKind> {
    if DISCARDED_SECTIONS
        .iter()
        .any(|d| name == *d || name.starts_with(&format!("{d}$")) || name.starts_with(&format!("{d}.")))
    {
        return None;
    }
    match kind {
        object::SectionKind::Text => Some(SectionKind::Code),
        object::SectionKind::Data => Some(SectionKind::Data),
        object::SectionKind::ReadOnlyData
        | object::SectionKind::ReadOnlyDataWithRel
        | object::SectionKind::ReadOnlyString => Some(SectionKind::ReadOnly),
        object::SectionKind::UninitializedData | object::SectionKind::Common => {
            Some(SectionKind::Bss)
        }
        _ => None,
    }
}

/// Sort key for COFF grouped sections: the part after `$` orders the
/// contributions within a group.
fn coff_group_key(name: &str) -> (&str, &str) {
    name.split_once('$').unwrap_or((name, ""))
}

fn common_alignment(format: ObjectFormat, value: u64, size: u64) -> u64 {
    match format {
        // ELF stores the alignment of a common symbol in its value.
        ObjectFormat::Elf if value.is_power_of_two() => value,
        _ => size.next_power_of_two().clamp(1, 16),
    }
}

fn reloc_kind(reloc: &object::Relocation) -> Option<RelocKind> {
    match (reloc.kind(), reloc.size()) {
        (RelocationKind::Absolute, 32) => Some(RelocKind::Absolute32),
        (RelocationKind::Absolute, 64) => Some(RelocKind::Absolute64),
        (RelocationKind::Relative | RelocationKind::PltRelative, 32) => Some(
            if matches!(
                reloc.encoding(),
                RelocationEncoding::X86RipRelative | RelocationEncoding::X86RipRelativeMovq
            ) {
                RelocKind::RipRelative32
            } else {
                RelocKind::Relative32
            },
        ),
        _ => None,
    }
}

fn read_field(bytes: &[u8], width: usize) -> i64 {
    match width {
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            i64::from_le_bytes(b)
        }
        _ => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[..4]);
            i32::from_le_bytes(b) as i64
        }
    }
}

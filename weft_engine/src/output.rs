//! Output generation: relocatable objects, position-independent blobs
//! and capability objects.
//!
//! Only the object form carries relocations. The blob forms lay the
//! sections out in canonical order from offset 0, apply every relocation
//! in place and fail on anything that would need a load address.

use std::collections::HashMap;

use object::write::{Mangling, Object, Relocation as ObjRelocation, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolScope,
};
use serde::{Deserialize, Serialize};
use weft_obj::module::align_up;
use weft_obj::{Arch, Binding, Module, ObjectFormat, RelocKind, SectionId, SectionKind, SymbolDef, SymbolKind};

use crate::error::EngineError;
use crate::log::BuildLog;

/// Magic of a capability object.
pub const PICO_MAGIC: &[u8; 4] = b"PICO";
pub const PICO_VERSION: u16 = 1;
const PICO_HEADER: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Relocatable ELF or COFF object.
    Object,
    /// Relocation-free position-independent code blob.
    Pic,
    /// Capability object: a PIC image behind a header with a tagged
    /// export table.
    Pico,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputKind::Object => "object",
            OutputKind::Pic => "pic",
            OutputKind::Pico => "pico",
        })
    }
}

/// A function exported from a capability object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub function: String,
    pub tag: u32,
}

/// Serialize `module` as `kind`.
#[tracing::instrument(skip_all, name = "Generate output", fields(kind = %kind))]
pub fn generate(
    kind: OutputKind,
    module: &Module,
    entry: &str,
    exports: &[Export],
    log: &mut BuildLog,
) -> Result<Vec<u8>, EngineError> {
    match kind {
        OutputKind::Object => emit_object(module),
        OutputKind::Pic => {
            let image = Image::build(module)?;
            match image.symbol_offset(module, entry) {
                Some(0) => {}
                Some(offset) => log.warn(
                    &module.name,
                    format!("entry `{entry}` is at {offset:#x}, not at the start of the blob"),
                ),
                None => return Err(EngineError::undefined(entry, "entry point of position-independent output")),
            }
            Ok(image.into_bytes(true))
        }
        OutputKind::Pico => {
            let image = Image::build(module)?;
            let entry_offset = image
                .symbol_offset(module, entry)
                .ok_or_else(|| EngineError::undefined(entry, "entry point of capability object"))?;
            let mut table = Vec::with_capacity(exports.len());
            for e in exports {
                let offset = image
                    .symbol_offset(module, &e.function)
                    .ok_or_else(|| EngineError::undefined(&e.function, "exported function"))?;
                table.push((e.tag, offset));
            }
            let machine: u16 = match module.arch {
                Arch::X86 => 0x014c,
                Arch::X64 => 0x8664,
            };
            let total = image.total;
            let body = image.into_bytes(false);
            let mut out = Vec::with_capacity(PICO_HEADER + table.len() * 8 + body.len());
            out.extend_from_slice(PICO_MAGIC);
            out.extend_from_slice(&PICO_VERSION.to_le_bytes());
            out.extend_from_slice(&machine.to_le_bytes());
            out.extend_from_slice(&u32_field(entry_offset, "entry offset")?.to_le_bytes());
            out.extend_from_slice(&u32_field(total, "image size")?.to_le_bytes());
            out.extend_from_slice(&u32_field(body.len() as u64, "initialized size")?.to_le_bytes());
            out.extend_from_slice(&(table.len() as u32).to_le_bytes());
            for (tag, offset) in table {
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&u32_field(offset, "export offset")?.to_le_bytes());
            }
            out.extend_from_slice(&body);
            Ok(out)
        }
    }
}

fn u32_field(value: u64, what: &str) -> Result<u32, EngineError> {
    u32::try_from(value).map_err(|_| EngineError::Output(format!("{what} {value:#x} does not fit in 32 bits")))
}

/// Sections laid out from offset 0 with relocations applied.
struct Image {
    base: Vec<Option<u64>>,
    bytes: Vec<u8>,
    /// End of initialized contents; uninitialized sections follow.
    initialized: u64,
    total: u64,
}

impl Image {
    fn build(module: &Module) -> Result<Self, EngineError> {
        let mut order: Vec<SectionId> = module.section_ids().collect();
        order.sort_by_key(|&id| module.section(id).kind);

        let mut base = vec![None; module.sections.len()];
        let mut offset = 0u64;
        let mut initialized = 0u64;
        for &id in &order {
            let section = module.section(id);
            offset = align_up(offset, section.align);
            base[id.index()] = Some(offset);
            offset += section.size();
            if section.kind != SectionKind::Bss {
                initialized = offset;
            }
        }
        let total = offset;
        let mut bytes = vec![0u8; total as usize];
        for &id in &order {
            let section = module.section(id);
            if let Some(start) = base[id.index()] {
                let start = start as usize;
                bytes[start..start + section.data.len()].copy_from_slice(&section.data);
            }
        }

        let mut image = Self {
            base,
            bytes,
            initialized,
            total,
        };
        for r in &module.relocations {
            image.apply(module, r)?;
        }
        tracing::debug!(module = %module.name, total, initialized, "laid out image");
        Ok(image)
    }

    fn apply(&mut self, module: &Module, r: &weft_obj::Relocation) -> Result<(), EngineError> {
        let symbol = module
            .symbols
            .try_get(r.symbol)
            .ok_or_else(|| EngineError::invariant(format!("relocation at {:#x} has no symbol", r.offset)))?;
        let section = module.section(r.section);
        let place = self.base[r.section.index()]
            .ok_or_else(|| EngineError::invariant(format!("section `{}` was not laid out", section.name)))?
            + r.offset;
        let (target, absolute) = match symbol.def {
            SymbolDef::Section { section, offset } => {
                let base = self.base[section.index()].ok_or_else(|| {
                    EngineError::invariant(format!("`{}` lies in a section that was not laid out", symbol.name))
                })?;
                (base + offset, false)
            }
            SymbolDef::Absolute(value) => (value, true),
            SymbolDef::Undefined => {
                return Err(EngineError::undefined(
                    &symbol.name,
                    format!("referenced from {}+{:#x}", section.name, r.offset),
                ))
            }
        };
        let position_dependent = || EngineError::PositionDependent {
            symbol: symbol.name.clone(),
            section: section.name.clone(),
            offset: r.offset,
        };
        let value = match r.kind {
            // The distance to a fixed address depends on the load address.
            RelocKind::Relative32 | RelocKind::RipRelative32 if absolute => return Err(position_dependent()),
            RelocKind::Relative32 | RelocKind::RipRelative32 => {
                let v = target.wrapping_add(r.addend as u64).wrapping_sub(place) as i64;
                i32::try_from(v).map_err(|_| {
                    EngineError::Output(format!("`{}` is out of reach of {}+{:#x}", symbol.name, section.name, r.offset))
                })?;
                v as u64
            }
            RelocKind::Absolute32 | RelocKind::Absolute64 if absolute => target.wrapping_add(r.addend as u64),
            RelocKind::Absolute32 | RelocKind::Absolute64 => return Err(position_dependent()),
        };
        let at = place as usize;
        let width = r.kind.width();
        if at + width > self.initialized as usize {
            return Err(EngineError::invariant(format!(
                "relocation at {}+{:#x} lies outside initialized data",
                section.name, r.offset
            )));
        }
        self.bytes[at..at + width].copy_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }

    fn symbol_offset(&self, module: &Module, name: &str) -> Option<u64> {
        let (section, offset) = module.symbol_location(name)?;
        Some(self.base[section.index()]? + offset)
    }

    /// The image bytes, with uninitialized space zero-filled or cut off.
    fn into_bytes(mut self, zero_fill: bool) -> Vec<u8> {
        if !zero_fill {
            self.bytes.truncate(self.initialized as usize);
        }
        self.bytes
    }
}

fn emit_object(module: &Module) -> Result<Vec<u8>, EngineError> {
    let (format, architecture) = match (module.format, module.arch) {
        (ObjectFormat::Coff, Arch::X86) => (BinaryFormat::Coff, Architecture::I386),
        (ObjectFormat::Coff, Arch::X64) => (BinaryFormat::Coff, Architecture::X86_64),
        (_, Arch::X86) => (BinaryFormat::Elf, Architecture::I386),
        (_, Arch::X64) => (BinaryFormat::Elf, Architecture::X86_64),
    };
    let mut obj = Object::new(format, architecture, Endianness::Little);
    // Names already carry their platform decoration.
    obj.set_mangling(Mangling::None);

    let mut sections = Vec::with_capacity(module.sections.len());
    for section in &module.sections {
        let kind = match section.kind {
            SectionKind::Code => object::SectionKind::Text,
            SectionKind::ReadOnly => object::SectionKind::ReadOnlyData,
            SectionKind::Data => object::SectionKind::Data,
            SectionKind::Bss => object::SectionKind::UninitializedData,
        };
        let id = obj.add_section(Vec::new(), section.name.as_bytes().to_vec(), kind);
        if section.kind == SectionKind::Bss {
            obj.append_section_bss(id, section.size(), section.align);
        } else {
            obj.append_section_data(id, &section.data, section.align);
        }
        sections.push(id);
    }

    let mut symbols: HashMap<usize, SymbolId> = HashMap::new();
    for (id, sym) in module.symbols.iter() {
        let out = match sym.def {
            SymbolDef::Section { section, .. } if sym.kind == SymbolKind::Section => {
                obj.section_symbol(sections[section.index()])
            }
            _ => {
                let (value, section) = match sym.def {
                    SymbolDef::Section { section, offset } => (offset, SymbolSection::Section(sections[section.index()])),
                    SymbolDef::Absolute(v) => (v, SymbolSection::Absolute),
                    SymbolDef::Undefined => (0, SymbolSection::Undefined),
                };
                let kind = match sym.kind {
                    SymbolKind::Function | SymbolKind::Import => object::SymbolKind::Text,
                    SymbolKind::Data => object::SymbolKind::Data,
                    SymbolKind::Section => object::SymbolKind::Section,
                    // COFF has no untyped symbols.
                    SymbolKind::Unknown if module.format == ObjectFormat::Coff => object::SymbolKind::Data,
                    SymbolKind::Unknown => object::SymbolKind::Unknown,
                };
                let scope = match (sym.binding, &sym.def) {
                    (_, SymbolDef::Undefined) => SymbolScope::Unknown,
                    (Binding::Local, _) => SymbolScope::Compilation,
                    _ => SymbolScope::Linkage,
                };
                obj.add_symbol(Symbol {
                    name: sym.name.as_bytes().to_vec(),
                    value,
                    size: sym.size,
                    kind,
                    scope,
                    weak: sym.binding == Binding::Weak,
                    section,
                    flags: SymbolFlags::None,
                })
            }
        };
        symbols.insert(id.index(), out);
    }

    for r in &module.relocations {
        let symbol = *symbols
            .get(&r.symbol.index())
            .ok_or_else(|| EngineError::invariant(format!("relocation at {:#x} has no symbol", r.offset)))?;
        let (kind, size) = match r.kind {
            RelocKind::Absolute32 => (RelocationKind::Absolute, 32),
            RelocKind::Absolute64 => (RelocationKind::Absolute, 64),
            RelocKind::Relative32 | RelocKind::RipRelative32 => (RelocationKind::Relative, 32),
        };
        obj.add_relocation(
            sections[r.section.index()],
            ObjRelocation {
                offset: r.offset,
                symbol,
                addend: r.addend,
                flags: RelocationFlags::Generic {
                    kind,
                    encoding: RelocationEncoding::Generic,
                    size,
                },
            },
        )
        .map_err(|e| EngineError::Output(e.to_string()))?;
    }

    let mut buf = Vec::new();
    obj.emit(&mut buf).map_err(|e| EngineError::Output(e.to_string()))?;
    Ok(buf)
}

/// What [`validate_output`] found in a generated output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputReport {
    pub size: usize,
    pub sections: Vec<String>,
    pub symbols: Vec<String>,
    /// `(tag, offset)` of capability-object exports.
    pub exports: Vec<(u32, u32)>,
    pub entry: Option<u32>,
    pub relocation_count: usize,
}

/// Parse an output back and describe it.
pub fn validate_output(kind: OutputKind, bytes: &[u8]) -> Result<OutputReport, EngineError> {
    use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

    let malformed = |reason: String| EngineError::MalformedInput {
        module: format!("{kind} output"),
        reason,
    };
    match kind {
        OutputKind::Object => {
            let file = object::File::parse(bytes).map_err(|e| malformed(e.to_string()))?;
            let mut report = OutputReport {
                size: bytes.len(),
                ..OutputReport::default()
            };
            for section in file.sections() {
                report.sections.push(section.name().unwrap_or("").to_string());
                report.relocation_count += section.relocations().count();
            }
            report.symbols = file
                .symbols()
                .filter_map(|s| s.name().ok().filter(|n| !n.is_empty()).map(str::to_string))
                .collect();
            Ok(report)
        }
        OutputKind::Pic => Ok(OutputReport {
            size: bytes.len(),
            entry: Some(0),
            ..OutputReport::default()
        }),
        OutputKind::Pico => {
            let word = |at: usize| -> Result<u32, EngineError> {
                bytes
                    .get(at..at + 4)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(|| malformed(format!("truncated at {at:#x}")))
            };
            if bytes.get(..4) != Some(PICO_MAGIC.as_slice()) {
                return Err(malformed("bad magic".to_string()));
            }
            let version = word(4)? & 0xffff;
            if version != u32::from(PICO_VERSION) {
                return Err(malformed(format!("unsupported version {version}")));
            }
            let entry = word(8)?;
            let image_size = word(12)?;
            let initialized = word(16)?;
            let count = word(20)? as usize;
            let mut exports = Vec::with_capacity(count.min(1024));
            for i in 0..count {
                let at = PICO_HEADER + i * 8;
                exports.push((word(at)?, word(at + 4)?));
            }
            let body = PICO_HEADER + count * 8;
            if bytes.len() != body + initialized as usize || initialized > image_size {
                return Err(malformed("image size does not match the header".to_string()));
            }
            if entry >= image_size.max(1) || exports.iter().any(|&(_, o)| o >= image_size) {
                return Err(malformed("offset outside the image".to_string()));
            }
            Ok(OutputReport {
                size: bytes.len(),
                exports,
                entry: Some(entry),
                ..OutputReport::default()
            })
        }
    }
}

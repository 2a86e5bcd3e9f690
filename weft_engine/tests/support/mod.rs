//! Fixture objects for the end-to-end tests, written with `object::write`.

#![allow(dead_code)]

pub mod emu;

use std::collections::HashMap;

use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use weft_engine::{build, BuildOutput, Directive, EngineError, OutputKind, Pass, Script};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Elf64,
    Elf32,
    Coff64,
}

impl Target {
    pub fn arch(self) -> weft_obj::Arch {
        match self {
            Target::Elf32 => weft_obj::Arch::X86,
            Target::Elf64 | Target::Coff64 => weft_obj::Arch::X64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sect {
    Text,
    Rodata,
    Data,
    Bss,
}

/// How a field refers to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fix {
    /// `call rel32`: PC-relative with the usual -4 addend.
    Call,
    /// PC-relative with an explicit addend (-4 minus the bytes that
    /// follow the field).
    Pc32(i64),
    Abs32,
    Abs64,
    /// PC-relative through the section symbol of a section, the way an
    /// assembler refers to a local function: `.text + addend`.
    ViaSection(Sect, i64),
}

struct Fixup {
    sect: Sect,
    offset: u64,
    target: String,
    fix: Fix,
}

/// Builds a relocatable object one function or datum at a time.
/// Functions are packed back to back so the code section holds no
/// padding between them.
pub struct ObjBuilder {
    target: Target,
    text: Vec<u8>,
    rodata: Vec<u8>,
    data: Vec<u8>,
    bss: u64,
    defs: Vec<(String, Sect, u64)>,
    fixups: Vec<Fixup>,
}

impl ObjBuilder {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            text: Vec::new(),
            rodata: Vec::new(),
            data: Vec::new(),
            bss: 0,
            defs: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn func(mut self, name: &str, code: &[u8]) -> Self {
        self.defs.push((name.to_string(), Sect::Text, self.text.len() as u64));
        self.text.extend_from_slice(code);
        self
    }

    pub fn rodata(mut self, name: &str, bytes: &[u8]) -> Self {
        pad(&mut self.rodata, 8);
        self.defs.push((name.to_string(), Sect::Rodata, self.rodata.len() as u64));
        self.rodata.extend_from_slice(bytes);
        self
    }

    pub fn data(mut self, name: &str, bytes: &[u8]) -> Self {
        pad(&mut self.data, 8);
        self.defs.push((name.to_string(), Sect::Data, self.data.len() as u64));
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn bss(mut self, name: &str, size: u64) -> Self {
        self.bss = self.bss.next_multiple_of(8);
        self.defs.push((name.to_string(), Sect::Bss, self.bss));
        self.bss += size;
        self
    }

    /// Relocate the field at `at` bytes into function `func`.
    pub fn fix(self, func: &str, at: u64, target: &str, fix: Fix) -> Self {
        self.fix_in(Sect::Text, func, at, target, fix)
    }

    /// Relocate the field at `at` bytes past the symbol `base` of `sect`.
    pub fn fix_in(mut self, sect: Sect, base: &str, at: u64, target: &str, fix: Fix) -> Self {
        let start = self
            .defs
            .iter()
            .find(|(n, s, _)| n == base && *s == sect)
            .map(|d| d.2)
            .unwrap_or_else(|| panic!("no symbol `{base}` in {sect:?}"));
        self.fixups.push(Fixup {
            sect,
            offset: start + at,
            target: target.to_string(),
            fix,
        });
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let (format, architecture) = match self.target {
            Target::Elf64 => (BinaryFormat::Elf, Architecture::X86_64),
            Target::Elf32 => (BinaryFormat::Elf, Architecture::I386),
            Target::Coff64 => (BinaryFormat::Coff, Architecture::X86_64),
        };
        let mut obj = Object::new(format, architecture, Endianness::Little);

        let mut sections = HashMap::new();
        if !self.text.is_empty() {
            let id = obj.section_id(StandardSection::Text);
            obj.append_section_data(id, &self.text, 16);
            sections.insert(Sect::Text, id);
        }
        if !self.rodata.is_empty() {
            let id = obj.section_id(StandardSection::ReadOnlyData);
            obj.append_section_data(id, &self.rodata, 8);
            sections.insert(Sect::Rodata, id);
        }
        if !self.data.is_empty() {
            let id = obj.section_id(StandardSection::Data);
            obj.append_section_data(id, &self.data, 8);
            sections.insert(Sect::Data, id);
        }
        if self.bss > 0 {
            let id = obj.section_id(StandardSection::UninitializedData);
            obj.append_section_bss(id, self.bss, 8);
            sections.insert(Sect::Bss, id);
        }

        let mut symbols: HashMap<String, SymbolId> = HashMap::new();
        for (name, sect, offset) in &self.defs {
            let (kind, scope) = match sect {
                Sect::Text => (SymbolKind::Text, SymbolScope::Linkage),
                _ => (SymbolKind::Data, SymbolScope::Compilation),
            };
            let id = obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: *offset,
                size: 0,
                kind,
                scope,
                weak: false,
                section: SymbolSection::Section(sections[sect]),
                flags: SymbolFlags::None,
            });
            symbols.insert(name.clone(), id);
        }

        for f in &self.fixups {
            let symbol = match (f.fix, symbols.get(&f.target)) {
                (Fix::ViaSection(sect, _), _) => obj.section_symbol(sections[&sect]),
                (_, Some(&id)) => id,
                (_, None) => {
                    let kind = if f.target.starts_with("__imp_") {
                        SymbolKind::Data
                    } else {
                        SymbolKind::Text
                    };
                    let id = obj.add_symbol(Symbol {
                        name: f.target.as_bytes().to_vec(),
                        value: 0,
                        size: 0,
                        kind,
                        scope: SymbolScope::Linkage,
                        weak: false,
                        section: SymbolSection::Undefined,
                        flags: SymbolFlags::None,
                    });
                    symbols.insert(f.target.clone(), id);
                    id
                }
            };
            let (kind, size, addend) = match f.fix {
                Fix::Call => (RelocationKind::Relative, 32, -4),
                Fix::Pc32(addend) | Fix::ViaSection(_, addend) => (RelocationKind::Relative, 32, addend),
                Fix::Abs32 => (RelocationKind::Absolute, 32, 0),
                Fix::Abs64 => (RelocationKind::Absolute, 64, 0),
            };
            obj.add_relocation(
                sections[&f.sect],
                Relocation {
                    offset: f.offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Generic {
                        kind,
                        encoding: RelocationEncoding::Generic,
                        size,
                    },
                },
            )
            .unwrap();
        }
        obj.write().unwrap()
    }
}

fn pad(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

/// Little-endian bytes of a 32-bit immediate.
pub fn imm32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

pub fn load(input: &str) -> Directive {
    Directive::Load {
        input: input.to_string(),
        raw: false,
        arch: None,
    }
}

pub fn make(passes: &[Pass]) -> Directive {
    Directive::Make {
        passes: passes.to_vec(),
        entry: None,
        ptr_accessor: None,
        bss_accessor: None,
    }
}

pub fn link(output: &str, kind: OutputKind) -> Directive {
    Directive::Link {
        output: output.to_string(),
        kind,
    }
}

/// Run `directives` with a fixed seed against the named inputs.
pub fn run_script(
    directives: Vec<Directive>,
    seed: u64,
    inputs: &[(&str, Vec<u8>)],
) -> Result<BuildOutput, EngineError> {
    let script = Script {
        directives,
        seed: Some(seed),
    };
    let inputs: HashMap<String, Vec<u8>> = inputs
        .iter()
        .map(|(name, bytes)| (name.to_string(), bytes.clone()))
        .collect();
    build(&script, &inputs)
}

/// Build a single object through `passes` and link it as a PIC blob.
pub fn pic_of(object: Vec<u8>, passes: &[Pass], seed: u64) -> Vec<u8> {
    let out = run_script(
        vec![load("in.o"), make(passes), link("out.bin", OutputKind::Pic)],
        seed,
        &[("in.o", object)],
    )
    .unwrap();
    out.outputs["out.bin"].clone()
}

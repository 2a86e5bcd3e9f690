//! Canonical in-memory representation of one object module.
//!
//! A `Module` owns its sections, an interned symbol table and a flat
//! relocation table. Relocations always carry an explicit addend and use
//! the `S + A - P` convention for PC-relative kinds, regardless of whether
//! the input format stored the addend in the relocated field.

use std::collections::HashMap;
use std::fmt;

/// Target architecture of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86 (i386).
    X86,
    /// x86-64.
    X64,
}

impl Arch {
    pub fn is_64(self) -> bool {
        matches!(self, Arch::X64)
    }

    pub fn pointer_size(self) -> u64 {
        match self {
            Arch::X86 => 4,
            Arch::X64 => 8,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86 => write!(f, "x86"),
            Arch::X64 => write!(f, "x64"),
        }
    }
}

/// Container format the module was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    Coff,
    /// A raw byte blob with no container.
    Raw,
}

/// Section classification. A normalized module has at most one section
/// of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Code,
    ReadOnly,
    Data,
    Bss,
}

impl SectionKind {
    /// Layout order used by the normalizer and the output generator.
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Code,
        SectionKind::ReadOnly,
        SectionKind::Data,
        SectionKind::Bss,
    ];

    /// Canonical section name for `format`.
    pub fn canonical_name(self, format: ObjectFormat) -> &'static str {
        match (self, format) {
            (SectionKind::Code, _) => ".text",
            (SectionKind::ReadOnly, ObjectFormat::Coff) => ".rdata",
            (SectionKind::ReadOnly, _) => ".rodata",
            (SectionKind::Data, _) => ".data",
            (SectionKind::Bss, _) => ".bss",
        }
    }

    pub fn is_code(self) -> bool {
        matches!(self, SectionKind::Code)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, SectionKind::Data | SectionKind::Bss)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SectionKind::Code => "code",
            SectionKind::ReadOnly => "rodata",
            SectionKind::Data => "data",
            SectionKind::Bss => "bss",
        };
        f.write_str(s)
    }
}

/// Index of a section within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub u32);

impl SectionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    /// Initialized contents. Empty for `Bss`.
    pub data: Vec<u8>,
    /// Size in memory; never smaller than `data.len()`.
    pub virtual_size: u64,
    pub align: u64,
}

impl Section {
    pub fn new(name: impl Into<String>, kind: SectionKind, align: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            data: Vec::new(),
            virtual_size: 0,
            align: align.max(1),
        }
    }

    /// Append `bytes` at the next `align`-aligned offset and return that
    /// offset. Gaps in code are filled with `int3`.
    pub fn append(&mut self, bytes: &[u8], align: u64) -> u64 {
        let align = align.max(1);
        self.align = self.align.max(align);
        let offset = align_up(self.virtual_size, align);
        if self.kind == SectionKind::Bss {
            self.virtual_size = offset + bytes.len() as u64;
            return offset;
        }
        let fill = if self.kind.is_code() { 0xcc } else { 0 };
        self.data.resize(offset as usize, fill);
        self.data.extend_from_slice(bytes);
        self.virtual_size = self.data.len() as u64;
        offset
    }

    /// Reserve `size` zero bytes (uninitialized space for `Bss`).
    pub fn reserve(&mut self, size: u64, align: u64) -> u64 {
        if self.kind == SectionKind::Bss {
            let align = align.max(1);
            self.align = self.align.max(align);
            let offset = align_up(self.virtual_size, align);
            self.virtual_size = offset + size;
            offset
        } else {
            self.append(&vec![0; size as usize], align)
        }
    }

    /// Replace the initialized contents, keeping the virtual size invariant.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.virtual_size = data.len() as u64;
        self.data = data;
    }

    pub fn size(&self) -> u64 {
        self.virtual_size
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    let align = align.max(1);
    value.div_ceil(align) * align
}

/// Interned symbol identifier. Indexes into the module's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    /// An undefined reference to a function exported by another module
    /// (see [`Import`]).
    Import,
    /// The start of a canonical section.
    Section,
    Unknown,
}

/// Where a symbol's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolDef {
    Section { section: SectionId, offset: u64 },
    Absolute(u64),
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub def: SymbolDef,
    pub binding: Binding,
    pub kind: SymbolKind,
    pub size: u64,
}

impl Symbol {
    pub fn defined(
        name: impl Into<String>,
        section: SectionId,
        offset: u64,
        binding: Binding,
        kind: SymbolKind,
    ) -> Self {
        Self {
            name: name.into(),
            def: SymbolDef::Section { section, offset },
            binding,
            kind,
            size: 0,
        }
    }

    pub fn undefined(name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            def: SymbolDef::Undefined,
            binding: Binding::Global,
            kind,
            size: 0,
        }
    }

    pub fn absolute(name: impl Into<String>, value: u64, binding: Binding) -> Self {
        Self {
            name: name.into(),
            def: SymbolDef::Absolute(value),
            binding,
            kind: SymbolKind::Data,
            size: 0,
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self.def, SymbolDef::Undefined)
    }

    pub fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }

    /// Section and offset of a section-relative definition.
    pub fn location(&self) -> Option<(SectionId, u64)> {
        match self.def {
            SymbolDef::Section { section, offset } => Some((section, offset)),
            _ => None,
        }
    }
}

/// A function imported from another module, named with the
/// `MODULE$Function` convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Import {
    pub module: String,
    pub function: String,
}

impl Import {
    /// Parse an import symbol name. Accepts `__imp_MODULE$Func`,
    /// `__imp__MODULE$Func@N` (32-bit decoration) and bare `MODULE$Func`.
    pub fn parse(name: &str) -> Option<Self> {
        let bare = name
            .strip_prefix("__imp__")
            .or_else(|| name.strip_prefix("__imp_"))
            .unwrap_or(name);
        let bare = bare.strip_prefix('_').unwrap_or(bare);
        let (module, function) = bare.split_once('$')?;
        let function = match function.rsplit_once('@') {
            Some((f, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => f,
            _ => function,
        };
        if module.is_empty() || function.is_empty() {
            return None;
        }
        Some(Self {
            module: module.to_string(),
            function: function.to_string(),
        })
    }

    /// Whether `target` names this import, either as `MODULE$Func`
    /// (module compared case-insensitively) or as the bare function name.
    pub fn matches(&self, target: &str) -> bool {
        match target.split_once('$') {
            Some((m, f)) => m.eq_ignore_ascii_case(&self.module) && f == self.function,
            None => target == self.function,
        }
    }
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.module, self.function)
    }
}

/// Relocation kinds. PC-relative kinds compute `S + A - P` where `P` is
/// the address of the relocated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    Absolute32,
    Absolute64,
    /// 32-bit branch or other PC-relative displacement.
    Relative32,
    /// 32-bit displacement of a RIP-relative memory operand.
    RipRelative32,
}

impl RelocKind {
    /// Width of the relocated field in bytes.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Absolute64 => 8,
            _ => 4,
        }
    }

    pub fn is_pc_relative(self) -> bool {
        matches!(self, RelocKind::Relative32 | RelocKind::RipRelative32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Section containing the relocated field.
    pub section: SectionId,
    /// Offset of the relocated field within `section`.
    pub offset: u64,
    pub symbol: SymbolId,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Symbol table. Non-local names are unique and indexed for lookup;
/// locals may repeat across merged inputs and are addressed by id.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    lookup: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symbol. A non-local symbol replaces the lookup entry of any
    /// earlier non-local symbol with the same name.
    pub fn add(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        if !symbol.is_local() {
            self.lookup.insert(symbol.name.clone(), id);
        }
        self.symbols.push(symbol);
        id
    }

    /// Look up a non-local symbol by name.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.lookup.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn try_get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.index())
    }

    /// Mutable access to a symbol. The name must not be changed through
    /// this reference; use [`SymbolTable::rename`].
    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub fn rename(&mut self, id: SymbolId, name: impl Into<String>) {
        let name = name.into();
        let sym = &mut self.symbols[id.index()];
        if !sym.is_local() && self.lookup.get(&sym.name) == Some(&id) {
            self.lookup.remove(&sym.name);
        }
        sym.name = name.clone();
        if !sym.is_local() {
            self.lookup.insert(name, id);
        }
    }

    /// Change binding, keeping the lookup index in sync.
    pub fn set_binding(&mut self, id: SymbolId, binding: Binding) {
        let sym = &mut self.symbols[id.index()];
        let was_local = sym.is_local();
        sym.binding = binding;
        if was_local && binding != Binding::Local {
            self.lookup.insert(sym.name.clone(), id);
        } else if !was_local && binding == Binding::Local && self.lookup.get(&sym.name) == Some(&id)
        {
            self.lookup.remove(&sym.name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Drop symbols whose `keep` entry is false. Returns the old → new id map.
    fn compact(&mut self, keep: &[bool]) -> Vec<Option<SymbolId>> {
        let mut remap = Vec::with_capacity(self.symbols.len());
        let mut kept = Vec::new();
        for (i, sym) in std::mem::take(&mut self.symbols).into_iter().enumerate() {
            if keep.get(i).copied().unwrap_or(true) {
                remap.push(Some(SymbolId(kept.len() as u32)));
                kept.push(sym);
            } else {
                remap.push(None);
            }
        }
        self.lookup.clear();
        for (i, sym) in kept.iter().enumerate() {
            if !sym.is_local() {
                self.lookup.insert(sym.name.clone(), SymbolId(i as u32));
            }
        }
        self.symbols = kept;
        remap
    }
}

/// One normalized object module.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub arch: Arch,
    pub format: ObjectFormat,
    pub sections: Vec<Section>,
    pub symbols: SymbolTable,
    pub relocations: Vec<Relocation>,
}

impl Module {
    pub fn new(name: impl Into<String>, arch: Arch, format: ObjectFormat) -> Self {
        Self {
            name: name.into(),
            arch,
            format,
            sections: Vec::new(),
            symbols: SymbolTable::new(),
            relocations: Vec::new(),
        }
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.index()]
    }

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len() as u32).map(SectionId)
    }

    /// The section of `kind`, if present.
    pub fn canonical_section(&self, kind: SectionKind) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.kind == kind)
            .map(|i| SectionId(i as u32))
    }

    /// The section of `kind`, created (with its section symbol) if absent.
    pub fn ensure_section(&mut self, kind: SectionKind) -> SectionId {
        if let Some(id) = self.canonical_section(kind) {
            return id;
        }
        let id = SectionId(self.sections.len() as u32);
        let name = kind.canonical_name(self.format);
        self.sections.push(Section::new(name, kind, 1));
        self.symbols.add(Symbol::defined(
            name,
            id,
            0,
            Binding::Local,
            SymbolKind::Section,
        ));
        id
    }

    /// The section symbol of `section`.
    pub fn section_symbol(&self, section: SectionId) -> Option<SymbolId> {
        self.symbols.iter().find_map(|(id, s)| {
            (s.kind == SymbolKind::Section
                && s.def == SymbolDef::Section { section, offset: 0 })
            .then_some(id)
        })
    }

    /// Apply the platform's C-level name decoration (a leading underscore
    /// for 32-bit COFF).
    pub fn c_name(&self, name: &str) -> String {
        if self.arch == Arch::X86 && self.format == ObjectFormat::Coff {
            format!("_{name}")
        } else {
            name.to_string()
        }
    }

    /// Find a symbol by its source-level name: the decorated non-local
    /// name first, then the undecorated one, then locals.
    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbols
            .lookup(&self.c_name(name))
            .or_else(|| self.symbols.lookup(name))
            .or_else(|| {
                let decorated = self.c_name(name);
                self.symbols
                    .iter()
                    .find(|(_, s)| {
                        s.is_local()
                            && s.kind != SymbolKind::Section
                            && (s.name == name || s.name == decorated)
                    })
                    .map(|(id, _)| id)
            })
    }

    /// Find the defining location of `name`.
    pub fn symbol_location(&self, name: &str) -> Option<(SectionId, u64)> {
        self.find_symbol(name)
            .and_then(|id| self.symbols.get(id).location())
    }

    /// The section and offset a relocation points at, ignoring any
    /// PC-relative bias (`S + A`).
    pub fn reloc_target(&self, reloc: &Relocation) -> Option<(SectionId, i64)> {
        let (section, offset) = self.symbols.try_get(reloc.symbol)?.location()?;
        Some((section, offset as i64 + reloc.addend))
    }

    /// Relocations whose field lies in `section`, with their table index.
    pub fn relocations_in(&self, section: SectionId) -> impl Iterator<Item = (usize, &Relocation)> {
        self.relocations
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.section == section)
    }

    /// Defined symbols inside `section`.
    pub fn symbols_in(&self, section: SectionId) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .filter(move |(_, s)| matches!(s.location(), Some((sec, _)) if sec == section))
    }

    /// Remove sections and symbols whose `keep` flag is false and every
    /// relocation that lives in a removed section or targets a removed
    /// symbol. Symbols defined in removed sections are removed as well.
    pub fn prune(&mut self, keep_sections: &[bool], keep_symbols: &[bool]) {
        let mut section_remap = Vec::with_capacity(self.sections.len());
        let mut kept_sections = Vec::new();
        for (i, sec) in std::mem::take(&mut self.sections).into_iter().enumerate() {
            if keep_sections.get(i).copied().unwrap_or(true) {
                section_remap.push(Some(SectionId(kept_sections.len() as u32)));
                kept_sections.push(sec);
            } else {
                section_remap.push(None);
            }
        }
        self.sections = kept_sections;

        let mut keep: Vec<bool> = (0..self.symbols.len())
            .map(|i| keep_symbols.get(i).copied().unwrap_or(true))
            .collect();
        for (id, sym) in self.symbols.iter() {
            if let Some((sec, _)) = sym.location() {
                if section_remap[sec.index()].is_none() {
                    keep[id.index()] = false;
                }
            }
        }
        let symbol_remap = self.symbols.compact(&keep);
        for sym in self.symbols.symbols.iter_mut() {
            if let SymbolDef::Section { section, offset } = sym.def {
                if let Some(new) = section_remap[section.index()] {
                    sym.def = SymbolDef::Section {
                        section: new,
                        offset,
                    };
                }
            }
        }

        self.relocations.retain_mut(|r| {
            match (
                section_remap[r.section.index()],
                symbol_remap.get(r.symbol.index()).copied().flatten(),
            ) {
                (Some(section), Some(symbol)) => {
                    r.section = section;
                    r.symbol = symbol;
                    true
                }
                _ => false,
            }
        });
    }

    /// Drop undefined symbols that no relocation references any more.
    pub fn drop_unreferenced_undefined(&mut self) {
        let mut used = vec![false; self.symbols.len()];
        for r in &self.relocations {
            used[r.symbol.index()] = true;
        }
        let keep: Vec<bool> = self
            .symbols
            .iter()
            .map(|(id, s)| s.is_defined() || used[id.index()])
            .collect();
        if keep.iter().all(|&k| k) {
            return;
        }
        let keep_sections = vec![true; self.sections.len()];
        self.prune(&keep_sections, &keep);
    }

    /// Total number of initialized bytes across all sections.
    pub fn image_size(&self) -> u64 {
        self.sections.iter().map(|s| s.data.len() as u64).sum()
    }
}

//! Module verifier: structural consistency checks.
//!
//! Collects all errors rather than stopping at the first one. A relocation
//! that cannot be resolved to a live symbol and an in-range field is
//! counted as dangling.

use std::fmt;

use crate::module::{Module, RelocKind, SectionKind, SymbolDef};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Location context for a verification error.
#[derive(Debug, Clone)]
pub enum Location {
    Module,
    Section(String),
    Symbol(String),
    Relocation { section: String, offset: u64 },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Module => write!(f, "module"),
            Location::Section(name) => write!(f, "section {name}"),
            Location::Symbol(name) => write!(f, "symbol `{name}`"),
            Location::Relocation { section, offset } => {
                write!(f, "relocation {section}+{offset:#x}")
            }
        }
    }
}

/// A single verification error.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub location: Location,
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.location, self.message)
    }
}

/// Collected verification results.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub errors: Vec<VerifyError>,
    pub relocation_count: usize,
    pub dangling_relocations: usize,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, location: Location, message: impl Into<String>) {
        self.errors.push(VerifyError {
            location,
            message: message.into(),
        });
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "verification passed");
        }
        writeln!(
            f,
            "verification failed with {} error(s):",
            self.errors.len()
        )?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}

/// Verify a module.
pub fn validate(module: &Module) -> VerifyResult {
    let mut result = VerifyResult {
        relocation_count: module.relocations.len(),
        ..VerifyResult::default()
    };

    let mut seen_kinds = Vec::new();
    for sec in &module.sections {
        let loc = || Location::Section(sec.name.clone());
        if sec.virtual_size < sec.data.len() as u64 {
            result.error(loc(), "virtual size is smaller than raw size");
        }
        if sec.kind == SectionKind::Bss && !sec.data.is_empty() {
            result.error(loc(), "uninitialized section carries raw bytes");
        }
        if !sec.align.is_power_of_two() {
            result.error(loc(), format!("alignment {} is not a power of two", sec.align));
        }
        if seen_kinds.contains(&sec.kind) {
            result.error(loc(), format!("second {} section", sec.kind));
        }
        seen_kinds.push(sec.kind);
    }

    for (id, sym) in module.symbols.iter() {
        if let SymbolDef::Section { section, offset } = sym.def {
            match module.sections.get(section.index()) {
                None => result.error(
                    Location::Symbol(sym.name.clone()),
                    format!("defined in missing section #{}", section.0),
                ),
                Some(sec) if offset > sec.size() => result.error(
                    Location::Symbol(sym.name.clone()),
                    format!("offset {offset:#x} is past the end of {}", sec.name),
                ),
                _ => {}
            }
        }
        if !sym.is_local() && module.symbols.lookup(&sym.name) != Some(id) {
            result.error(
                Location::Symbol(sym.name.clone()),
                "non-local name is shadowed by another symbol",
            );
        }
    }

    for r in &module.relocations {
        let Some(sec) = module.sections.get(r.section.index()) else {
            result.error(
                Location::Module,
                format!("relocation in missing section #{}", r.section.0),
            );
            result.dangling_relocations += 1;
            continue;
        };
        let loc = || Location::Relocation {
            section: sec.name.clone(),
            offset: r.offset,
        };
        let mut dangling = false;
        if r.offset + r.kind.width() as u64 > sec.data.len() as u64 {
            result.error(loc(), "field lies outside the initialized bytes");
            dangling = true;
        }
        match module.symbols.try_get(r.symbol) {
            None => {
                result.error(loc(), format!("target symbol #{} does not exist", r.symbol.0));
                dangling = true;
            }
            Some(sym) => {
                if let SymbolDef::Section { section, .. } = sym.def {
                    if module.sections.get(section.index()).is_none() {
                        result.error(loc(), format!("target `{}` lives in a missing section", sym.name));
                        dangling = true;
                    }
                }
                if r.kind == RelocKind::Absolute64 && !module.arch.is_64() {
                    result.error(loc(), "64-bit absolute relocation in a 32-bit module");
                }
            }
        }
        if dangling {
            result.dangling_relocations += 1;
        }
    }

    result
}

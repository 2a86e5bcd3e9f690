//! Appended resources and their generated `_binary_*` symbols.

use crate::module::{Binding, Module, SectionKind, Symbol, SymbolDef, SymbolKind};

/// The three symbol names generated for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSymbols {
    pub start: String,
    pub end: String,
    pub size: String,
}

impl ResourceSymbols {
    /// Symbol names for `resource` (non-identifier characters become `_`),
    /// decorated for the module's platform.
    pub fn for_resource(module: &Module, resource: &str) -> Self {
        let stem: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Self {
            start: module.c_name(&format!("_binary_{stem}_start")),
            end: module.c_name(&format!("_binary_{stem}_end")),
            size: module.c_name(&format!("_binary_{stem}_size")),
        }
    }
}

impl Module {
    /// Append `bytes` to the data section and (re)generate the start, end
    /// and size symbols for `resource`.
    pub fn append_resource(&mut self, resource: &str, bytes: &[u8]) -> ResourceSymbols {
        let names = ResourceSymbols::for_resource(self, resource);
        let section = self.ensure_section(SectionKind::Data);
        let offset = self.section_mut(section).append(bytes, 8);
        let len = bytes.len() as u64;

        let defs = [
            (&names.start, SymbolDef::Section { section, offset }),
            (
                &names.end,
                SymbolDef::Section {
                    section,
                    offset: offset + len,
                },
            ),
            (&names.size, SymbolDef::Absolute(len)),
        ];
        for (name, def) in defs {
            match self.symbols.lookup(name) {
                Some(id) => {
                    let sym = self.symbols.get_mut(id);
                    sym.def = def;
                    sym.kind = SymbolKind::Data;
                    sym.binding = Binding::Global;
                    sym.size = if matches!(def, SymbolDef::Absolute(_)) { 0 } else { len };
                }
                None => {
                    let mut sym = Symbol::absolute(name.clone(), 0, Binding::Global);
                    sym.def = def;
                    sym.size = if matches!(def, SymbolDef::Absolute(_)) { 0 } else { len };
                    self.symbols.add(sym);
                }
            }
        }
        tracing::debug!(module = %self.name, resource, len, "appended resource");
        names
    }

    /// Read a resource back through its start and size symbols.
    pub fn read_resource(&self, resource: &str) -> Option<&[u8]> {
        let names = ResourceSymbols::for_resource(self, resource);
        let (section, start) = self.symbols.get(self.symbols.lookup(&names.start)?).location()?;
        let size = match self.symbols.get(self.symbols.lookup(&names.size)?).def {
            SymbolDef::Absolute(v) => v,
            _ => return None,
        };
        self.section(section)
            .data
            .get(start as usize..(start + size) as usize)
    }
}

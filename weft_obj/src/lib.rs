//! weft_obj: Unified object model for the weft linker.
//!
//! Every input (ELF or COFF relocatable object, archive member, raw blob)
//! is normalized into a [`module::Module`] holding one canonical section
//! per kind, a symbol table and an explicit-addend relocation table.

pub mod error;
pub mod merge;
pub mod module;
pub mod normalize;
pub mod resource;
pub mod verify;

pub use error::ObjError;
pub use module::{
    Arch, Binding, Import, Module, ObjectFormat, RelocKind, Relocation, Section, SectionId,
    SectionKind, Symbol, SymbolDef, SymbolId, SymbolKind, SymbolTable,
};

#[cfg(test)]
mod tests;

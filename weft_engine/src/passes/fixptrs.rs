//! `fixptrs`: make 32-bit code position independent.
//!
//! x86 has no RIP-relative addressing, so every absolute reference to
//! code or initialized data is replaced by a call to the current-address
//! accessor plus the static distance from the instruction after the call
//! to the target. References into uninitialized data are left to
//! `fixbss`; imports are left to the resolver injector.

use weft_obj::{Arch, Module, RelocKind, SectionKind, SymbolId};

use super::address::{AddressRewriter, BaseLoad};
use super::PassContext;
use crate::error::EngineError;

fn selects(module: &Module, symbol: SymbolId, kind: RelocKind) -> bool {
    if kind != RelocKind::Absolute32 {
        return false;
    }
    match module.symbols.try_get(symbol).and_then(|s| s.location()) {
        Some((section, _)) => module.section(section).kind != SectionKind::Bss,
        None => false,
    }
}

#[tracing::instrument(skip_all, name = "Fix pointers")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    if module.arch != Arch::X86 {
        cx.log.warn(&module.name, "fixptrs only applies to 32-bit code; nothing to do");
        return Ok(());
    }
    let Some(accessor_name) = cx.ptr_accessor else {
        return Err(EngineError::MissingParameter {
            directive: "make".to_string(),
            parameter: "ptr_accessor",
        });
    };
    let accessor = module
        .find_symbol(accessor_name)
        .filter(|&id| module.symbols.get(id).is_defined())
        .ok_or_else(|| EngineError::undefined(accessor_name, "current-address accessor"))?;

    // Pointer tables in data cannot be rebased by rewriting code.
    let code = module.canonical_section(SectionKind::Code);
    if let Some(r) = module
        .relocations
        .iter()
        .find(|r| Some(r.section) != code && selects(module, r.symbol, r.kind))
    {
        return Err(EngineError::UnsupportedAddressingForm {
            pass: "fixptrs",
            function: module.section(r.section).name.clone(),
            offset: r.offset,
            inst: "<data>".to_string(),
            reason: format!(
                "absolute pointer to `{}` stored in data",
                module.symbols.get(r.symbol).name
            ),
        });
    }

    let rewriter = AddressRewriter {
        pass: "fixptrs",
        arch: module.arch,
        accessor,
        accessor_name,
        red_zone: 0,
    };
    let count = rewriter.rewrite_module(module, cx.log, |m, symbol, kind, delta| {
        selects(m, symbol, kind).then_some(BaseLoad::Relative { symbol, delta })
    })?;
    tracing::debug!(count, "rebased absolute references");
    if count == 0 {
        cx.log.warn(&module.name, "fixptrs found no absolute references");
    }
    Ok(())
}

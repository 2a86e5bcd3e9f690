//! `fixbss`: address uninitialized data through a base pointer.
//!
//! Position-independent output carries no uninitialized section, so every
//! reference to `.bss` becomes a call to the base-address accessor plus the
//! target's constant offset from the start of the section. The accessor
//! supplies at least the section's virtual size in zeroed memory.

use weft_obj::{Module, ObjectFormat, RelocKind, SectionKind, SymbolId};

use super::address::{AddressRewriter, BaseLoad};
use super::PassContext;
use crate::error::EngineError;

/// Bytes below the stack pointer that leaf functions may use on System V.
const RED_ZONE: i32 = 128;

#[tracing::instrument(skip_all, name = "Fix bss")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let Some(bss) = module.canonical_section(SectionKind::Bss) else {
        cx.log.warn(&module.name, "fixbss: no uninitialized data");
        return Ok(());
    };
    let Some(accessor_name) = cx.bss_accessor else {
        return Err(EngineError::MissingParameter {
            directive: "make".to_string(),
            parameter: "bss_accessor",
        });
    };
    let accessor = module
        .find_symbol(accessor_name)
        .filter(|&id| module.symbols.get(id).is_defined())
        .ok_or_else(|| EngineError::undefined(accessor_name, "base-address accessor"))?;

    let into_bss = |m: &Module, symbol: SymbolId| -> Option<u64> {
        match m.symbols.try_get(symbol)?.location()? {
            (section, offset) if section == bss => Some(offset),
            _ => None,
        }
    };

    let code = module.canonical_section(SectionKind::Code);
    if let Some(r) = module
        .relocations
        .iter()
        .find(|r| Some(r.section) != code && into_bss(module, r.symbol).is_some())
    {
        return Err(EngineError::UnsupportedAddressingForm {
            pass: "fixbss",
            function: module.section(r.section).name.clone(),
            offset: r.offset,
            inst: "<data>".to_string(),
            reason: format!(
                "pointer to `{}` stored in data",
                module.symbols.get(r.symbol).name
            ),
        });
    }

    let red_zone = if module.arch.is_64() && module.format == ObjectFormat::Elf {
        RED_ZONE
    } else {
        0
    };
    let rewriter = AddressRewriter {
        pass: "fixbss",
        arch: module.arch,
        accessor,
        accessor_name,
        red_zone,
    };
    let count = rewriter.rewrite_module(module, cx.log, |m, symbol, _kind: RelocKind, delta| {
        into_bss(m, symbol).map(|offset| BaseLoad::Offset(offset as i64 + delta))
    })?;

    let size = module.section(bss).virtual_size;
    tracing::debug!(count, size, "rebased uninitialized data references");
    cx.log.applied(
        &module.name,
        format!("fixbss: {count} reference(s) rebased; accessor must provide {size} byte(s)"),
    );
    Ok(())
}

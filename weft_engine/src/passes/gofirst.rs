//! `gofirst`: place the entry function at offset 0.

use weft_obj::Module;

use super::PassContext;
use crate::error::EngineError;
use crate::layout::CodeLayout;

#[tracing::instrument(skip_all, name = "Go first")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let Some(mut layout) = CodeLayout::build(module, cx.log)? else {
        cx.log.warn(&module.name, "gofirst: no code section");
        return Ok(());
    };
    let entry = layout.entry_function(module, cx.entry)?;
    if entry == 0 && module.symbol_location(cx.entry).map(|(_, o)| o) == Some(0) {
        tracing::debug!("entry already first");
        return Ok(());
    }
    let function = layout.functions.remove(entry);
    layout.functions.insert(0, function);
    layout.apply(module)
}

//! `disco`: shuffle function order.
//!
//! The entry function keeps its byte offset: the functions placed before
//! it are shuffled among themselves, as are the ones after it. Functions
//! move whole; nothing inside a function is reordered.

use rand::seq::SliceRandom;
use weft_obj::Module;

use super::PassContext;
use crate::error::EngineError;
use crate::layout::CodeLayout;

/// Orders tried before giving up on shuffling.
const ATTEMPTS: usize = 8;

#[tracing::instrument(skip_all, name = "Disco")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let Some(layout) = CodeLayout::build(module, cx.log)? else {
        cx.log.warn(&module.name, "disco: no code section");
        return Ok(());
    };
    let entry = layout.entry_function(module, cx.entry)?;
    let before = module.symbol_location(cx.entry).map(|(_, o)| o);

    // A short branch between functions may have to widen in the new order,
    // which shifts everything after it. Such orders are rejected.
    for attempt in 0..ATTEMPTS {
        let mut candidate = layout.clone();
        let (head, tail) = candidate.functions.split_at_mut(entry);
        head.shuffle(cx.rng);
        tail[1..].shuffle(cx.rng);
        let order: Vec<String> = candidate.functions.iter().map(|f| f.name.clone()).collect();

        let mut work = module.clone();
        candidate.apply(&mut work)?;
        if work.symbol_location(cx.entry).map(|(_, o)| o) == before {
            tracing::debug!(attempt, ?order, "shuffled");
            *module = work;
            return Ok(());
        }
        tracing::debug!(attempt, ?order, "order moves the entry");
    }
    cx.log.warn(
        &module.name,
        format!("disco: no order out of {ATTEMPTS} keeps `{}` in place; function order kept", cx.entry),
    );
    Ok(())
}

//! `optimize`: dead code and data elimination.
//!
//! Reachability starts at the entry symbol and the extra roots and follows
//! every reference: relocations and resolved branches inside functions,
//! and relocations inside data sections. Functions are the unit inside the
//! code section; other sections are kept or dropped whole.

use std::collections::HashSet;

use weft_obj::{Module, SectionId, SymbolId};

use super::PassContext;
use crate::error::EngineError;
use crate::layout::{CodeLayout, Item};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Unit {
    Function(usize),
    Section(SectionId),
}

struct Reach<'a> {
    module: &'a Module,
    layout: &'a CodeLayout,
    seen: HashSet<Unit>,
    work: Vec<Unit>,
}

impl Reach<'_> {
    fn mark(&mut self, unit: Unit) {
        if self.seen.insert(unit) {
            self.work.push(unit);
        }
    }

    fn offset(&mut self, offset: u64) {
        if let Some(f) = self.layout.function_at(offset) {
            self.mark(Unit::Function(f));
        }
    }

    fn symbol(&mut self, symbol: SymbolId, delta: i64) {
        let Some((section, offset)) = self.module.symbols.try_get(symbol).and_then(|s| s.location()) else {
            return;
        };
        if section == self.layout.section {
            if let Ok(target) = u64::try_from(offset as i64 + delta) {
                self.offset(target);
            }
        } else {
            self.mark(Unit::Section(section));
        }
    }

    fn run(&mut self) {
        while let Some(unit) = self.work.pop() {
            match unit {
                Unit::Function(i) => {
                    let layout = self.layout;
                    for item in &layout.functions[i].items {
                        match item {
                            Item::Inst(node) => {
                                for r in &node.relocs {
                                    self.symbol(r.symbol, r.delta);
                                }
                                if let Some(target) = node.branch {
                                    self.offset(target);
                                }
                            }
                            Item::Bytes { relocs, .. } => {
                                for r in relocs {
                                    self.symbol(r.symbol, r.delta);
                                }
                            }
                        }
                    }
                }
                Unit::Section(section) => {
                    let module = self.module;
                    for (_, r) in module.relocations_in(section) {
                        self.symbol(r.symbol, r.addend);
                    }
                }
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Optimize")]
pub fn run(module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let entry = module
        .find_symbol(cx.entry)
        .filter(|&id| module.symbols.get(id).is_defined())
        .ok_or_else(|| EngineError::undefined(cx.entry, "entry point"))?;
    let Some(mut layout) = CodeLayout::build(module, cx.log)? else {
        cx.log.warn(&module.name, "optimize: no code section");
        return Ok(());
    };

    let mut roots = vec![entry];
    roots.extend(cx.roots.iter().filter_map(|name| module.find_symbol(name)));

    let (functions, sections, conservative) = {
        let mut reach = Reach {
            module,
            layout: &layout,
            seen: HashSet::new(),
            work: Vec::new(),
        };
        for root in roots {
            reach.symbol(root, 0);
        }
        reach.run();
        // Undecoded code may hide references: keep every function and
        // whatever they reference.
        let conservative = layout.has_opaque()
            && (0..layout.functions.len()).any(|i| !reach.seen.contains(&Unit::Function(i)));
        if conservative {
            for i in 0..layout.functions.len() {
                reach.mark(Unit::Function(i));
            }
            reach.run();
        }
        let functions: Vec<bool> = (0..layout.functions.len())
            .map(|i| reach.seen.contains(&Unit::Function(i)))
            .collect();
        let sections: Vec<bool> = module
            .section_ids()
            .map(|id| id == layout.section || reach.seen.contains(&Unit::Section(id)))
            .collect();
        (functions, sections, conservative)
    };

    let total = layout.functions.len();
    let kept = functions.iter().filter(|&&k| k).count();
    if conservative {
        cx.log.warn(
            &module.name,
            "optimize: undecoded code may hide references; keeping every function",
        );
    } else if kept < total {
        let mut keep = functions.iter();
        layout.functions.retain(|_| keep.next().copied().unwrap_or(true));
        for f in &layout.functions {
            tracing::trace!(function = %f.name, "kept");
        }
        layout.apply(module)?;
    }

    let dropped_sections = sections.iter().filter(|&&k| !k).count();
    if dropped_sections > 0 {
        let keep_symbols = vec![true; module.symbols.len()];
        module.prune(&sections, &keep_symbols);
    }
    module.drop_unreferenced_undefined();

    tracing::debug!(kept, total, dropped_sections, "reachability");
    cx.log.applied(
        &module.name,
        format!("optimize: kept {kept} of {total} function(s), dropped {dropped_sections} section(s)"),
    );
    Ok(())
}

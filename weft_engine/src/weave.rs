//! Aspect weaving: hook attachment and the hook table.
//!
//! `attach(target, hook)` redirects references to `target` to `hook`.
//! Several hooks on one target form a chain in attachment order: ordinary
//! callers reach the first hook, hook *i* reaches hook *i + 1*, and the
//! last hook reaches the target itself. `protect`, `preserve` and `optout`
//! exempt callers from some or all of the chain.
//!
//! `addhook` registrations are materialized as a table the runtime uses
//! to patch import slots; see [`build_hook_table`].

use std::collections::HashMap;

use weft_obj::{Arch, Binding, Import, Module, RelocKind, SectionId, SectionKind, Symbol, SymbolId, SymbolKind};
use weft_x86::{build, Mem, Op, OpSize, Operand, Reg};

use crate::dfr::{function_hash, module_hash};
use crate::error::EngineError;
use crate::layout::{CodeLayout, Field, Item, Node, NodeReloc};
use crate::log::BuildLog;

/// Name of the hook table symbol before platform decoration.
pub const HOOK_TABLE: &str = "__hook_table";

/// Weaving directives collected on an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeaveConfig {
    /// `(target, hook)` in attachment order.
    pub attachments: Vec<(String, String)>,
    pub protected: Vec<String>,
    /// `(target, callers)`: calls of `target` made by `callers` stay put.
    pub preserved: Vec<(String, Vec<String>)>,
    /// `(caller, hooks)`: `hooks` are skipped for calls made by `caller`.
    pub optouts: Vec<(String, Vec<String>)>,
    /// `(import, hook)` hook-table registrations.
    pub registrations: Vec<(String, String)>,
    pub filter_registrations: bool,
}

impl WeaveConfig {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.registrations.is_empty()
    }

    /// Hook names that must survive dead-code elimination.
    pub fn hooks(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .iter()
            .chain(&self.registrations)
            .map(|(_, h)| h.as_str())
    }

    /// The hooks a call of `target` made by `caller` passes through, in
    /// order. Empty when the caller is exempt.
    pub fn chain(&self, target: &str, caller: &str) -> Vec<&str> {
        if self.protected.iter().any(|p| p == caller) {
            return Vec::new();
        }
        if self
            .preserved
            .iter()
            .any(|(t, callers)| t == target && callers.iter().any(|c| c == caller))
        {
            return Vec::new();
        }
        let skipped: Vec<&str> = self
            .optouts
            .iter()
            .filter(|(f, _)| f == caller)
            .flat_map(|(_, hooks)| hooks.iter().map(String::as_str))
            .collect();
        self.attachments
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, h)| h.as_str())
            .filter(|h| !skipped.contains(h))
            .collect()
    }

    /// Where a reference to `target` from `caller` should point: a hook,
    /// or `None` to keep the target.
    pub fn next_hop(&self, target: &str, caller: &str) -> Option<&str> {
        let chain = self.chain(target, caller);
        match chain.iter().position(|&h| h == caller) {
            Some(i) => chain.get(i + 1).copied(),
            None => chain.first().copied(),
        }
    }
}

/// Symbols standing for `target`: matching imports, or the defined symbol.
fn target_symbols(module: &Module, target: &str) -> (Vec<SymbolId>, bool) {
    let imports: Vec<SymbolId> = module
        .symbols
        .iter()
        .filter(|(_, s)| !s.is_defined())
        .filter(|(_, s)| Import::parse(&s.name).is_some_and(|i| i.matches(target)))
        .map(|(id, _)| id)
        .collect();
    if !imports.is_empty() {
        return (imports, true);
    }
    (module.find_symbol(target).into_iter().collect(), false)
}

/// Redirect references according to `config`. Returns the number of
/// rewritten sites.
#[tracing::instrument(skip_all, name = "Weave")]
pub fn weave(module: &mut Module, config: &WeaveConfig, log: &mut BuildLog) -> Result<usize, EngineError> {
    if config.attachments.is_empty() {
        return Ok(0);
    }
    let mut hooks: HashMap<&str, SymbolId> = HashMap::new();
    for (target, hook) in &config.attachments {
        let id = module
            .find_symbol(hook)
            .filter(|&id| module.symbols.get(id).is_defined())
            .ok_or_else(|| EngineError::undefined(hook, format!("hook attached to `{target}`")))?;
        hooks.insert(hook.as_str(), id);
    }

    // symbol → (target name, is import)
    let mut targets: HashMap<SymbolId, (&str, bool)> = HashMap::new();
    for (target, _) in &config.attachments {
        let (ids, import) = target_symbols(module, target);
        if ids.is_empty() {
            log.warn(&module.name, format!("attach: `{target}` is never referenced"));
        }
        for id in ids {
            targets.insert(id, (target.as_str(), import));
        }
    }

    let Some(mut layout) = CodeLayout::build(module, log)? else {
        return Ok(0);
    };
    // Location → local target, for references through another symbol
    // (a section symbol plus offset) and branches the assembler resolved.
    let local_locations: HashMap<(SectionId, u64), SymbolId> = targets
        .iter()
        .filter(|(_, (_, import))| !import)
        .filter_map(|(&id, _)| Some((module.symbols.get(id).location()?, id)))
        .collect();
    let code = layout.section;
    let resolve = |r: &NodeReloc| {
        if let Some(&(target, import)) = targets.get(&r.symbol) {
            if import || r.delta == 0 {
                return Some((target, import));
            }
        }
        let (section, offset) = module.symbols.try_get(r.symbol)?.location()?;
        let at = u64::try_from(offset as i64 + r.delta).ok()?;
        local_locations.get(&(section, at)).map(|id| targets[id])
    };
    // Function index → the source-level name used by the directives.
    let mut caller_names: HashMap<usize, &str> = HashMap::new();
    for name in config
        .hooks()
        .chain(config.protected.iter().map(String::as_str))
        .chain(config.preserved.iter().flat_map(|(_, c)| c.iter().map(String::as_str)))
        .chain(config.optouts.iter().map(|(f, _)| f.as_str()))
    {
        if let Some(i) = layout.function_of(module, name) {
            caller_names.insert(i, name);
        }
    }

    let arch = module.arch;
    let mut count = 0;
    for (fi, f) in layout.functions.iter_mut().enumerate() {
        let caller = caller_names.get(&fi).copied().unwrap_or(f.name.as_str());
        if f.opaque {
            let touches = f.items.iter().any(|item| match item {
                Item::Bytes { relocs, .. } => relocs.iter().any(|r| targets.contains_key(&r.symbol)),
                Item::Inst(_) => false,
            });
            if touches {
                log.warn(
                    &module.name,
                    format!("attach: `{}` was not decoded; its references are left in place", f.name),
                );
            }
            continue;
        }
        let mut items = Vec::with_capacity(f.items.len());
        for item in std::mem::take(&mut f.items) {
            let Item::Inst(mut node) = item else {
                items.push(item);
                continue;
            };
            // Branch resolved without a relocation.
            if let Some(&id) = node.branch.and_then(|b| local_locations.get(&(code, b))) {
                let (target, _) = targets[&id];
                if let Some(hook) = config.next_hop(target, caller) {
                    let reloc = if node.inst.rel().is_some() {
                        node.inst.widen_branch();
                        Some(NodeReloc::new(Field::Imm, hooks[hook], RelocKind::Relative32, 0))
                    } else if node.inst.mem().is_some_and(Mem::is_rip) {
                        Some(NodeReloc::new(Field::Disp, hooks[hook], RelocKind::RipRelative32, 0))
                    } else {
                        None
                    };
                    if let Some(reloc) = reloc {
                        node.branch = None;
                        node.relocs.push(reloc);
                        count += 1;
                    }
                }
                items.push(Item::Inst(node));
                continue;
            }
            let Some((ri, target, import)) = node
                .relocs
                .iter()
                .enumerate()
                .find_map(|(i, r)| resolve(r).map(|(t, import)| (i, t, import)))
            else {
                items.push(Item::Inst(node));
                continue;
            };
            let Some(hook) = config.next_hop(target, caller) else {
                items.push(Item::Inst(node));
                continue;
            };
            let hook_id = hooks[hook];
            let field = node.relocs[ri].field;
            let replacement = if import && field == Field::Disp {
                import_site(arch, &node, hook_id).ok_or_else(|| EngineError::UnsupportedAddressingForm {
                    pass: "attach",
                    function: f.name.clone(),
                    offset: node.origin.unwrap_or(0),
                    inst: node.inst.intel(arch).to_string(),
                    reason: format!("`{target}` used other than by call, jump or load"),
                })?
            } else {
                node.relocs[ri].symbol = hook_id;
                node.relocs[ri].delta = 0;
                node.clone()
            };
            tracing::trace!(caller, target, hook, "redirected");
            items.push(Item::Inst(Node {
                origin: node.origin,
                ..replacement
            }));
            count += 1;
        }
        f.items = items;
    }
    if count > 0 {
        layout.apply(module)?;
    }
    module.drop_unreferenced_undefined();
    log.applied(&module.name, format!("attach: {count} reference(s) redirected"));
    Ok(count)
}

/// A use of an import slot rewritten to refer to `hook` directly.
fn import_site(arch: Arch, node: &Node, hook: SymbolId) -> Option<Node> {
    let ptr = OpSize::pointer(arch.is_64());
    let direct = |kind| NodeReloc::new(Field::Imm, hook, kind, 0);
    match (node.inst.op, node.inst.operands.as_slice()) {
        (Op::Call, [Operand::Mem(_)]) => Some(Node::with_reloc(build::call_rel(0, arch), direct(RelocKind::Relative32))),
        (Op::Jmp, [Operand::Mem(_)]) => {
            Some(Node::with_reloc(build::jmp_rel(0, false, arch), direct(RelocKind::Relative32)))
        }
        (Op::Mov, [Operand::Reg(r), Operand::Mem(m)]) if r.size == ptr && m.base_reg().is_none() && m.index.is_none() => {
            let r = Reg::new(r.gpr, ptr);
            if arch.is_64() {
                Some(Node::with_reloc(
                    build::lea(r, Mem::rip(ptr, 0)),
                    NodeReloc::new(Field::Disp, hook, RelocKind::RipRelative32, 0),
                ))
            } else {
                Some(Node::with_reloc(build::mov_ri32(r, 0), direct(RelocKind::Absolute32)))
            }
        }
        _ => None,
    }
}

/// Emit the hook table for `config.registrations` into the read-only
/// section and return its symbol name.
///
/// Each record is `{u32 module hash, u32 function hash, i32 offset from
/// the field to the hook, u32 reserved}`; a zero record ends the table.
/// With filtering on, registrations whose import is no longer referenced
/// are dropped.
#[tracing::instrument(skip_all, name = "Build hook table")]
pub fn build_hook_table(module: &mut Module, config: &WeaveConfig, log: &mut BuildLog) -> Result<Option<String>, EngineError> {
    if config.registrations.is_empty() {
        return Ok(None);
    }
    let referenced: Vec<bool> = {
        let mut used = vec![false; module.symbols.len()];
        for r in &module.relocations {
            used[r.symbol.index()] = true;
        }
        used
    };
    let mut records = Vec::new();
    for (target, hook) in &config.registrations {
        let hook_id = module
            .find_symbol(hook)
            .filter(|&id| module.symbols.get(id).is_defined())
            .ok_or_else(|| EngineError::undefined(hook, format!("hook registered for `{target}`")))?;
        if config.filter_registrations {
            let (ids, _) = target_symbols(module, target);
            if !ids.iter().any(|id| referenced[id.index()]) {
                log.warn(&module.name, format!("addhook: `{target}` is unused; entry filtered"));
                continue;
            }
        }
        let (hmod, hfunc) = match Import::parse(target) {
            Some(i) => (module_hash(&i.module), function_hash(&i.function)),
            None => (0, function_hash(target)),
        };
        records.push((hmod, hfunc, hook_id));
    }

    let section = module.ensure_section(SectionKind::ReadOnly);
    let mut bytes = Vec::with_capacity((records.len() + 1) * 16);
    for &(hmod, hfunc, _) in &records {
        bytes.extend_from_slice(&hmod.to_le_bytes());
        bytes.extend_from_slice(&hfunc.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);
    }
    bytes.extend_from_slice(&[0; 16]);
    let base = module.section_mut(section).append(&bytes, 4);
    for (i, &(_, _, hook)) in records.iter().enumerate() {
        module.relocations.push(weft_obj::Relocation {
            section,
            offset: base + i as u64 * 16 + 8,
            symbol: hook,
            kind: RelocKind::Relative32,
            addend: 0,
        });
    }
    let name = module.c_name(HOOK_TABLE);
    let mut symbol = Symbol::defined(name.clone(), section, base, Binding::Global, SymbolKind::Data);
    symbol.size = bytes.len() as u64;
    match module.symbols.lookup(&name) {
        Some(id) => *module.symbols.get_mut(id) = symbol,
        None => {
            module.symbols.add(symbol);
        }
    }
    log.applied(&module.name, format!("addhook: {} hook-table entr(ies)", records.len()));
    Ok(Some(name))
}

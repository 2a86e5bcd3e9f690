//! Resolver injection ("dynamic function resolution").
//!
//! Every reference to an imported function (`MODULE$Function`) is replaced
//! by a call to a caller-supplied resolver that returns the function's
//! address at run time. Routes pick the resolver by module name; a route
//! with no module list is the default.
//!
//! Resolver contract:
//! * x86-64 COFF: `resolver(rcx, rdx)` with the Windows x64 convention.
//! * x86-64 ELF: `resolver(rdi, rsi)` with the System V convention.
//! * x86: `cdecl resolver(module, function)`, caller pops the arguments.
//!
//! Hash keying passes the ROR13 hashes of the module and function names;
//! string keying passes pointers to NUL-terminated copies of the names.
//! The call site keeps every register except the one receiving the
//! address, and the flags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use weft_obj::{
    Arch, Binding, Import, Module, ObjectFormat, RelocKind, SectionKind, Symbol, SymbolId,
    SymbolKind,
};
use weft_x86::{build, Gpr, Mem, Op, OpSize, Operand, Reg};

use crate::error::EngineError;
use crate::layout::{CodeLayout, Field, Item, Node, NodeReloc};
use crate::log::BuildLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keying {
    /// ROR13 hashes of the module and function names.
    #[default]
    #[serde(alias = "ror13")]
    Hash,
    /// Pointers to the names.
    Strings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub resolver: String,
    pub keying: Keying,
    /// Modules served by this route. Empty means every module.
    pub modules: Vec<String>,
}

impl Route {
    fn serves(&self, module: &str) -> bool {
        let wanted = canonical_module(module);
        self.modules.iter().any(|m| canonical_module(m) == wanted)
    }
}

fn canonical_module(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.strip_suffix(".DLL") {
        Some(stem) => stem.to_string(),
        None => upper,
    }
}

/// `h = ror(h, 13) + c` over the bytes of `bytes`.
pub fn ror13(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.rotate_right(13).wrapping_add(b as u32))
}

/// Hash of a module name as the loader lists it: upper case, with `.DLL`
/// appended when the name has no extension.
pub fn module_hash(name: &str) -> u32 {
    let mut upper = name.to_ascii_uppercase();
    if !upper.contains('.') {
        upper.push_str(".DLL");
    }
    ror13(upper.as_bytes())
}

pub fn function_hash(name: &str) -> u32 {
    ror13(name.as_bytes())
}

/// Per-import keys computed once per injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub module_hash: u32,
    pub function_hash: u32,
    /// Interned name strings, created on first string-keyed use.
    pub strings: Option<(SymbolId, SymbolId)>,
}

#[derive(Debug, Default)]
pub struct ResolverCache {
    entries: HashMap<Import, CacheEntry>,
    interned: HashMap<String, SymbolId>,
}

impl ResolverCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, import: &Import) -> Option<&CacheEntry> {
        self.entries.get(import)
    }

    pub fn entry(&mut self, import: &Import) -> &mut CacheEntry {
        self.entries.entry(import.clone()).or_insert_with(|| CacheEntry {
            module_hash: module_hash(&import.module),
            function_hash: function_hash(&import.function),
            strings: None,
        })
    }

    /// Symbols of the module and function name strings, emitted into the
    /// read-only section on first use.
    pub fn strings(&mut self, module: &mut Module, import: &Import) -> (SymbolId, SymbolId) {
        if let Some(s) = self.entry(import).strings {
            return s;
        }
        let m = self.intern(module, &import.module);
        let f = self.intern(module, &import.function);
        self.entry(import).strings = Some((m, f));
        (m, f)
    }

    fn intern(&mut self, module: &mut Module, text: &str) -> SymbolId {
        if let Some(&id) = self.interned.get(text) {
            return id;
        }
        let rodata = module.ensure_section(SectionKind::ReadOnly);
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let offset = module.section_mut(rodata).append(&bytes, 1);
        let name = format!("__weft_str_{}", self.interned.len());
        let mut symbol = Symbol::defined(name, rodata, offset, Binding::Local, SymbolKind::Data);
        symbol.size = bytes.len() as u64;
        let id = module.symbols.add(symbol);
        self.interned.insert(text.to_string(), id);
        id
    }
}

/// Rewrites import references of one module.
pub struct Injector<'a> {
    routes: &'a [Route],
    pub cache: ResolverCache,
}

/// How the call site consumes the resolved address.
enum Use {
    Call,
    Jump,
    Load(Reg),
}

impl<'a> Injector<'a> {
    pub fn new(routes: &'a [Route]) -> Self {
        Self {
            routes,
            cache: ResolverCache::new(),
        }
    }

    fn route(&self, import: &Import, symbol: &str) -> Result<&'a Route, EngineError> {
        self.routes
            .iter()
            .find(|r| r.serves(&import.module))
            .or_else(|| self.routes.iter().find(|r| r.modules.is_empty()))
            .ok_or_else(|| EngineError::NoResolverForModule {
                module: import.module.clone(),
                symbol: symbol.to_string(),
            })
    }

    /// Replace every import reference in `module`. Returns the number of
    /// rewritten sites.
    #[tracing::instrument(skip_all, name = "Inject resolvers")]
    pub fn run(&mut self, module: &mut Module, log: &mut BuildLog) -> Result<usize, EngineError> {
        if self.routes.is_empty() {
            return Ok(0);
        }
        let mut resolvers: HashMap<&str, SymbolId> = HashMap::new();
        for route in self.routes {
            let id = module
                .find_symbol(&route.resolver)
                .filter(|&id| module.symbols.get(id).is_defined())
                .ok_or_else(|| EngineError::undefined(&route.resolver, "resolver"))?;
            resolvers.insert(route.resolver.as_str(), id);
        }
        let imports: HashMap<SymbolId, Import> = module
            .symbols
            .iter()
            .filter(|(_, s)| !s.is_defined())
            .filter_map(|(id, s)| Import::parse(&s.name).map(|i| (id, i)))
            .collect();
        if imports.is_empty() {
            log.warn(&module.name, "dfr: no imports to resolve");
            return Ok(0);
        }

        let code = module.canonical_section(SectionKind::Code);
        if let Some(r) = module
            .relocations
            .iter()
            .find(|r| Some(r.section) != code && imports.contains_key(&r.symbol))
        {
            return Err(EngineError::UnsupportedAddressingForm {
                pass: "dfr",
                function: module.section(r.section).name.clone(),
                offset: r.offset,
                inst: "<data>".to_string(),
                reason: format!("import `{}` stored in data", module.symbols.get(r.symbol).name),
            });
        }

        let Some(mut layout) = CodeLayout::build(module, log)? else {
            return Ok(0);
        };
        let skip: Vec<usize> = self
            .routes
            .iter()
            .filter_map(|r| layout.function_of(module, &r.resolver))
            .collect();

        let mut count = 0;
        for (fi, f) in layout.functions.iter_mut().enumerate() {
            if skip.contains(&fi) {
                continue;
            }
            let mut items = Vec::with_capacity(f.items.len());
            for item in std::mem::take(&mut f.items) {
                let node = match item {
                    Item::Inst(node) => node,
                    Item::Bytes { origin, bytes, relocs } => {
                        if let Some(r) = relocs.iter().find(|r| imports.contains_key(&r.symbol)) {
                            return Err(EngineError::UnsupportedAddressingForm {
                                pass: "dfr",
                                function: f.name.clone(),
                                offset: origin + r.offset,
                                inst: "<undecoded>".to_string(),
                                reason: "import referenced from code that could not be decoded".to_string(),
                            });
                        }
                        items.push(Item::Bytes { origin, bytes, relocs });
                        continue;
                    }
                };
                let Some((field, symbol, import)) = node
                    .relocs
                    .iter()
                    .find_map(|r| imports.get(&r.symbol).map(|i| (r.field, r.symbol, i)))
                else {
                    items.push(Item::Inst(node));
                    continue;
                };
                let name = module.symbols.get(symbol).name.clone();
                let route = self.route(import, &name)?;
                let resolver = resolvers[route.resolver.as_str()];
                let unsupported = |reason: &str| EngineError::UnsupportedAddressingForm {
                    pass: "dfr",
                    function: f.name.clone(),
                    offset: node.origin.unwrap_or(0),
                    inst: node.inst.intel(module.arch).to_string(),
                    reason: reason.to_string(),
                };
                if node.relocs.len() > 1 {
                    return Err(unsupported("more than one relocated field"));
                }
                let ptr = OpSize::pointer(module.arch.is_64());
                let site = match (node.inst.op, node.inst.operands.as_slice(), field) {
                    (Op::Call, [Operand::Mem(m)], Field::Disp) if no_registers(m) => Use::Call,
                    (Op::Jmp, [Operand::Mem(m)], Field::Disp) if no_registers(m) => Use::Jump,
                    (Op::Call, [Operand::Rel(_)], Field::Imm) => Use::Call,
                    (Op::Jmp, [Operand::Rel(_)], Field::Imm) => Use::Jump,
                    (Op::Mov, [Operand::Reg(r), Operand::Mem(m)], Field::Disp)
                        if r.size == ptr && r.gpr != Gpr::Rsp && no_registers(m) =>
                    {
                        Use::Load(*r)
                    }
                    _ => return Err(unsupported("import used other than by call, jump or load")),
                };
                let mut seq = self.site(module, route, resolver, import, site);
                if let Some(first) = seq.first_mut() {
                    first.origin = node.origin;
                }
                items.extend(seq.into_iter().map(Item::Inst));
                count += 1;
            }
            f.items = items;
        }

        if count > 0 {
            layout.apply(module)?;
        }
        module.drop_unreferenced_undefined();
        log.applied(
            &module.name,
            format!("dfr: {count} import reference(s) routed through {} import(s)", self.cache.len()),
        );
        Ok(count)
    }

    /// The replacement for one call site.
    fn site(&mut self, module: &mut Module, route: &Route, resolver: SymbolId, import: &Import, site: Use) -> Vec<Node> {
        let arch = module.arch;
        let ptr = OpSize::pointer(arch.is_64());
        let target = match site {
            Use::Call | Use::Jump if arch.is_64() => Gpr::R11,
            Use::Call | Use::Jump => Gpr::Rax,
            Use::Load(r) => r.gpr,
        };
        let keys = self.cache.entry(import);
        let (hmod, hfunc) = (keys.module_hash, keys.function_hash);
        let strings = match route.keying {
            Keying::Strings => Some(self.cache.strings(module, import)),
            Keying::Hash => None,
        };

        let sysv = arch.is_64() && module.format != ObjectFormat::Coff;
        let saved: Vec<Gpr> = match (arch, sysv) {
            (Arch::X86, _) => vec![Gpr::Rax, Gpr::Rcx, Gpr::Rdx],
            (Arch::X64, false) => vec![Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11],
            (Arch::X64, true) => vec![
                Gpr::Rax,
                Gpr::Rcx,
                Gpr::Rdx,
                Gpr::Rsi,
                Gpr::Rdi,
                Gpr::R8,
                Gpr::R9,
                Gpr::R10,
                Gpr::R11,
            ],
        }
        .into_iter()
        .filter(|&g| g != target)
        .collect();

        let reg = |g: Gpr| Reg::new(g, ptr);
        let node = Node::new;
        let mut seq = Vec::new();
        if sysv {
            seq.push(node(build::lea(reg(Gpr::Rsp), Mem::base(ptr, Gpr::Rsp, -128))));
        }
        seq.push(node(build::pushf(arch)));
        seq.extend(saved.iter().map(|&g| node(build::push_r(g, arch))));

        let call = Node::with_reloc(
            build::call_rel(0, arch),
            NodeReloc::new(Field::Imm, resolver, RelocKind::Relative32, 0),
        );
        if arch.is_64() {
            let (a0, a1) = if sysv { (Gpr::Rdi, Gpr::Rsi) } else { (Gpr::Rcx, Gpr::Rdx) };
            seq.push(node(build::push_r(Gpr::Rbp, arch)));
            seq.push(node(build::mov_rr(reg(Gpr::Rbp), reg(Gpr::Rsp))));
            seq.push(node(build::alu_ri(Op::And, Operand::Reg(reg(Gpr::Rsp)), -16)));
            seq.push(node(build::alu_ri(Op::Sub, Operand::Reg(reg(Gpr::Rsp)), 32)));
            match strings {
                Some((m, f)) => {
                    for (arg, sym) in [(a0, m), (a1, f)] {
                        seq.push(Node::with_reloc(
                            build::lea(reg(arg), Mem::rip(ptr, 0)),
                            NodeReloc::new(Field::Disp, sym, RelocKind::RipRelative32, 0),
                        ));
                    }
                }
                None => {
                    seq.push(node(build::mov_ri(Reg::new(a0, OpSize::S32), hmod as i64)));
                    seq.push(node(build::mov_ri(Reg::new(a1, OpSize::S32), hfunc as i64)));
                }
            }
            seq.push(call);
            seq.push(node(build::mov_rr(reg(Gpr::Rsp), reg(Gpr::Rbp))));
            seq.push(node(build::pop_r(Gpr::Rbp, arch)));
        } else {
            match strings {
                Some((m, f)) => {
                    for sym in [f, m] {
                        seq.push(Node::with_reloc(
                            build::push_imm32(0, arch),
                            NodeReloc::new(Field::Imm, sym, RelocKind::Absolute32, 0),
                        ));
                    }
                }
                None => {
                    seq.push(node(build::push_imm32(hfunc as i32 as i64, arch)));
                    seq.push(node(build::push_imm32(hmod as i32 as i64, arch)));
                }
            }
            seq.push(call);
            seq.push(node(build::alu_ri(Op::Add, Operand::Reg(reg(Gpr::Rsp)), 8)));
        }
        if target != Gpr::Rax {
            seq.push(node(build::mov_rr(reg(target), reg(Gpr::Rax))));
        }
        seq.extend(saved.iter().rev().map(|&g| node(build::pop_r(g, arch))));
        seq.push(node(build::popf(arch)));
        if sysv {
            seq.push(node(build::lea(reg(Gpr::Rsp), Mem::base(ptr, Gpr::Rsp, 128))));
        }
        match site {
            Use::Call => seq.push(node(build::call_indirect(Operand::Reg(reg(target)), arch))),
            Use::Jump => seq.push(node(build::jmp_indirect(Operand::Reg(reg(target)), arch))),
            Use::Load(_) => {}
        }
        seq
    }
}

/// `[rip + imp]` or `[imp]`: the import slot addressed on its own.
fn no_registers(m: &Mem) -> bool {
    m.base_reg().is_none() && m.index.is_none()
}

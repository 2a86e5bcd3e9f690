//! The composition stack.
//!
//! Each directive of a build script acts on the top of a stack of
//! artifacts. An artifact is a module plus the configuration collected
//! for its `make` (weaving, resolver routes, exports).
//!
//! ```text
//! Empty ──load──▶ Loaded ──merge──▶ Merged ──make──▶ Transformed ──link──▶ Linked
//! ```

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weft_obj::{normalize, Arch, Module, ObjectFormat, SectionKind, SymbolDef};
use weft_x86::refine_relocations;

use crate::dfr::{Injector, Route};
use crate::error::EngineError;
use crate::log::BuildLog;
use crate::output::{self, Export, OutputKind};
use crate::passes::{run_pass, Pass, PassContext};
use crate::script::Directive;
use crate::weave::{self, WeaveConfig};

/// Entry symbol used when `make` names none.
pub const DEFAULT_ENTRY: &str = "go";

/// Lifecycle of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Empty,
    Loaded,
    Merged,
    Transformed,
    Linked,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub module: Module,
    pub state: State,
    pub entry: String,
    pub weave: WeaveConfig,
    pub routes: Vec<Route>,
    pub exports: Vec<Export>,
}

impl Artifact {
    pub fn new(module: Module, state: State) -> Self {
        Self {
            module,
            state,
            entry: DEFAULT_ENTRY.to_string(),
            weave: WeaveConfig::default(),
            routes: Vec::new(),
            exports: Vec::new(),
        }
    }
}

pub struct Composer<'a> {
    inputs: &'a HashMap<String, Vec<u8>>,
    stack: Vec<Artifact>,
    rng: StdRng,
    /// Export tag values, shared by every artifact of the build.
    tags: BTreeMap<String, u32>,
    outputs: BTreeMap<String, Vec<u8>>,
    log: BuildLog,
    linked: bool,
}

impl<'a> Composer<'a> {
    pub fn new(inputs: &'a HashMap<String, Vec<u8>>, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        tracing::debug!(seed, "composer seeded");
        Self {
            inputs,
            stack: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            tags: BTreeMap::new(),
            outputs: BTreeMap::new(),
            log: BuildLog::new(),
            linked: false,
        }
    }

    /// State of the top artifact.
    pub fn state(&self) -> State {
        match self.stack.last() {
            Some(a) => a.state,
            None if self.linked => State::Linked,
            None => State::Empty,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn top(&self) -> Option<&Artifact> {
        self.stack.last()
    }

    pub fn tag(&self, name: &str) -> Option<u32> {
        self.tags.get(name).copied()
    }

    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Outputs written so far and the build log.
    pub fn finish(self) -> (BTreeMap<String, Vec<u8>>, BuildLog) {
        if !self.stack.is_empty() {
            tracing::debug!(left = self.stack.len(), "artifacts left on the stack were never linked");
        }
        (self.outputs, self.log)
    }

    pub fn apply(&mut self, directive: &Directive) -> Result<(), EngineError> {
        let op = directive.name();
        tracing::debug!(op, depth = self.stack.len(), "directive");
        match directive {
            Directive::Load { input, raw, arch } => {
                let bytes = self.input(input)?;
                let module = if *raw {
                    let arch = arch
                        .map(Arch::from)
                        .or_else(|| self.stack.last().map(|a| a.module.arch))
                        .unwrap_or(Arch::X64);
                    normalize::raw(input, bytes, arch)
                } else {
                    let mut module = normalize::load(input, bytes)?;
                    let refined = refine_relocations(&mut module);
                    tracing::trace!(refined, "rip-relative relocations");
                    module
                };
                self.log.applied(input, format!("load ({} section(s))", module.sections.len()));
                self.stack.push(Artifact::new(module, State::Loaded));
            }
            Directive::Merge => {
                self.require(op, 2)?;
                let top = self.pop(op, 2)?;
                let below = self.pop(op, 2)?;
                let name = below.module.name.clone();
                let what = format!("merge `{}`", top.module.name);
                let merged = below.module.merge(top.module)?;
                self.log.applied(&name, what);
                self.stack.push(Artifact {
                    module: merged,
                    state: State::Merged,
                    entry: below.entry,
                    weave: combine(below.weave, top.weave),
                    routes: [below.routes, top.routes].concat(),
                    exports: [below.exports, top.exports].concat(),
                });
            }
            Directive::Mergelib { input } => {
                let bytes = self.input(input)?;
                let members = if normalize::is_archive(bytes) {
                    normalize::load_archive(input, bytes)?
                } else {
                    vec![normalize::load(input, bytes)?]
                };
                let count = members.len();
                let top = self.top_mut(op)?;
                let mut module = top.module.clone();
                for mut member in members {
                    refine_relocations(&mut member);
                    module = module.merge(member)?;
                }
                top.module = module;
                top.state = State::Merged;
                let name = top.module.name.clone();
                self.log.applied(&name, format!("mergelib `{input}` ({count} member(s))"));
            }
            Directive::Make {
                passes,
                entry,
                ptr_accessor,
                bss_accessor,
            } => {
                // The stack keeps the untouched artifact if a pass fails.
                let mut artifact = self.configurable(op)?.clone();
                if let Some(entry) = entry {
                    artifact.entry = entry.clone();
                }
                self.make(&mut artifact, passes, ptr_accessor.as_deref(), bss_accessor.as_deref())?;
                // Weaving and routing have been carried out; exports stay for `link`.
                artifact.weave = WeaveConfig::default();
                artifact.routes.clear();
                artifact.state = State::Transformed;
                *self.top_mut(op)? = artifact;
            }
            Directive::Append { name } => {
                self.require(op, 2)?;
                let resource = self.pop(op, 2)?;
                let name = name.clone().unwrap_or_else(|| resource.module.name.clone());
                let bytes = self.resource_bytes(resource)?;
                let target = self.top_mut(op)?;
                let symbols = target.module.append_resource(&name, &bytes);
                let artifact = target.module.name.clone();
                self.log
                    .applied(&artifact, format!("append `{name}` ({} byte(s), {})", bytes.len(), symbols.start));
            }
            Directive::Link { output, kind } => {
                let state = self.top_mut(op)?.state;
                if state != State::Transformed {
                    return Err(EngineError::InvalidState {
                        directive: op.to_string(),
                        state,
                    });
                }
                let mut artifact = self.pop(op, 1)?;
                self.define_tags(&mut artifact.module);
                let bytes = output::generate(*kind, &artifact.module, &artifact.entry, &artifact.exports, &mut self.log)?;
                self.log.applied(
                    &artifact.module.name,
                    format!("link `{output}` as {kind} ({} byte(s))", bytes.len()),
                );
                self.outputs.insert(output.clone(), bytes);
                self.linked = true;
            }
            Directive::Dfr {
                resolver,
                keying,
                modules,
            } => {
                let top = self.configurable(op)?;
                top.routes.push(Route {
                    resolver: resolver.clone(),
                    keying: *keying,
                    modules: modules.clone(),
                });
            }
            Directive::Attach { target, hook } => {
                let top = self.configurable(op)?;
                top.weave.attachments.push((target.clone(), hook.clone()));
            }
            Directive::Protect { functions } => {
                let top = self.configurable(op)?;
                top.weave.protected.extend(functions.iter().cloned());
            }
            Directive::Preserve { target, functions } => {
                let top = self.configurable(op)?;
                top.weave.preserved.push((target.clone(), functions.clone()));
            }
            Directive::Optout { function, hooks } => {
                let top = self.configurable(op)?;
                top.weave.optouts.push((function.clone(), hooks.clone()));
            }
            Directive::Addhook { target, hook } => {
                let top = self.configurable(op)?;
                top.weave.registrations.push((target.clone(), hook.clone()));
            }
            Directive::Filterhooks => {
                let top = self.configurable(op)?;
                top.weave.filter_registrations = true;
            }
            Directive::Export { function, tag } => {
                self.configurable(op)?;
                let value = match self.tags.get(tag) {
                    Some(&v) => v,
                    None => {
                        let v = self.fresh_tag();
                        self.tags.insert(tag.clone(), v);
                        v
                    }
                };
                let top = self.configurable(op)?;
                top.exports.push(Export {
                    function: function.clone(),
                    tag: value,
                });
                tracing::debug!(%function, %tag, value, "export");
            }
        }
        Ok(())
    }

    fn input(&self, name: &str) -> Result<&'a [u8], EngineError> {
        self.inputs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| EngineError::MissingInput(name.to_string()))
    }

    fn require(&self, directive: &str, needed: usize) -> Result<(), EngineError> {
        if self.stack.len() < needed {
            return Err(EngineError::StackUnderflow {
                directive: directive.to_string(),
                needed,
            });
        }
        Ok(())
    }

    /// Pop the top artifact; `needed` is how many the directive consumes.
    fn pop(&mut self, directive: &str, needed: usize) -> Result<Artifact, EngineError> {
        self.stack.pop().ok_or_else(|| EngineError::StackUnderflow {
            directive: directive.to_string(),
            needed,
        })
    }

    fn top_mut(&mut self, directive: &str) -> Result<&mut Artifact, EngineError> {
        self.stack.last_mut().ok_or_else(|| EngineError::StackUnderflow {
            directive: directive.to_string(),
            needed: 1,
        })
    }

    /// The top artifact, if it has not been transformed yet.
    fn configurable(&mut self, directive: &str) -> Result<&mut Artifact, EngineError> {
        let top = self.top_mut(directive)?;
        match top.state {
            State::Loaded | State::Merged => Ok(top),
            state => Err(EngineError::InvalidState {
                directive: directive.to_string(),
                state,
            }),
        }
    }

    fn fresh_tag(&mut self) -> u32 {
        loop {
            let v: u32 = self.rng.gen();
            if v != 0 && !self.tags.values().any(|&t| t == v) {
                return v;
            }
        }
    }

    /// Define every referenced tag symbol as an absolute value.
    fn define_tags(&self, module: &mut Module) {
        for (name, &value) in &self.tags {
            let Some(id) = module.find_symbol(name) else { continue };
            let sym = module.symbols.get_mut(id);
            if !sym.is_defined() {
                sym.def = SymbolDef::Absolute(u64::from(value));
            }
        }
    }

    /// Bytes of an artifact appended as a resource: the contents of a raw
    /// blob, or the position-independent image of anything else.
    fn resource_bytes(&mut self, mut artifact: Artifact) -> Result<Vec<u8>, EngineError> {
        if artifact.module.format == ObjectFormat::Raw {
            return Ok(artifact
                .module
                .canonical_section(SectionKind::ReadOnly)
                .map(|id| artifact.module.section(id).data.clone())
                .unwrap_or_default());
        }
        self.define_tags(&mut artifact.module);
        output::generate(OutputKind::Pic, &artifact.module, &artifact.entry, &[], &mut self.log)
    }

    /// Weave, optimize, build the hook table, inject resolvers and run the
    /// remaining passes, in that order.
    #[tracing::instrument(skip_all, name = "Make", fields(artifact = %artifact.module.name))]
    fn make(
        &mut self,
        artifact: &mut Artifact,
        passes: &[Pass],
        ptr_accessor: Option<&str>,
        bss_accessor: Option<&str>,
    ) -> Result<(), EngineError> {
        let passes = Pass::ordered(passes);
        let name = artifact.module.name.clone();

        if !artifact.weave.attachments.is_empty() {
            let mut work = artifact.module.clone();
            weave::weave(&mut work, &artifact.weave, &mut self.log)?;
            artifact.module = work;
        }

        let mut roots: Vec<String> = artifact.exports.iter().map(|e| e.function.clone()).collect();
        roots.extend(artifact.weave.hooks().map(str::to_string));
        roots.extend(artifact.routes.iter().map(|r| r.resolver.clone()));
        roots.extend(ptr_accessor.into_iter().chain(bss_accessor).map(str::to_string));

        let optimize = passes.contains(&Pass::Optimize);
        if optimize {
            self.run(Pass::Optimize, artifact, &roots, ptr_accessor, bss_accessor)?;
        }
        if !artifact.weave.registrations.is_empty() {
            let mut work = artifact.module.clone();
            let table = weave::build_hook_table(&mut work, &artifact.weave, &mut self.log)?;
            artifact.module = work;
            if let (true, Some(table)) = (optimize && artifact.weave.filter_registrations, table) {
                // Hooks of filtered entries are dead now.
                let mut roots: Vec<String> = roots
                    .iter()
                    .filter(|r| !artifact.weave.registrations.iter().any(|(_, h)| h == *r))
                    .cloned()
                    .collect();
                roots.push(table);
                self.run(Pass::Optimize, artifact, &roots, ptr_accessor, bss_accessor)?;
            }
        }
        if !artifact.routes.is_empty() {
            let mut work = artifact.module.clone();
            let mut injector = Injector::new(&artifact.routes);
            injector.run(&mut work, &mut self.log)?;
            artifact.module = work;
        }
        for pass in passes.into_iter().filter(|&p| p != Pass::Optimize) {
            self.run(pass, artifact, &roots, ptr_accessor, bss_accessor)?;
        }
        self.log.applied(&name, "make");
        Ok(())
    }

    fn run(
        &mut self,
        pass: Pass,
        artifact: &mut Artifact,
        roots: &[String],
        ptr_accessor: Option<&str>,
        bss_accessor: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut cx = PassContext {
            entry: &artifact.entry,
            roots,
            ptr_accessor,
            bss_accessor,
            rng: &mut self.rng,
            log: &mut self.log,
        };
        run_pass(pass, &mut artifact.module, &mut cx)
    }
}

fn combine(mut below: WeaveConfig, top: WeaveConfig) -> WeaveConfig {
    below.attachments.extend(top.attachments);
    below.protected.extend(top.protected);
    below.preserved.extend(top.preserved);
    below.optouts.extend(top.optouts);
    below.registrations.extend(top.registrations);
    below.filter_registrations |= top.filter_registrations;
    below
}

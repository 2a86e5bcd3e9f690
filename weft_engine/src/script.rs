//! Declarative build scripts.
//!
//! A script is a JSON document:
//!
//! ```json
//! {
//!   "seed": 7,
//!   "directives": [
//!     { "op": "load", "input": "payload.x64.o" },
//!     { "op": "dfr", "resolver": "resolve", "keying": "ror13" },
//!     { "op": "make", "passes": ["+optimize", "+disco", "+gofirst"] },
//!     { "op": "load", "input": "config.bin", "raw": true },
//!     { "op": "append" },
//!     { "op": "link", "output": "payload.bin", "kind": "pic" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use weft_obj::Arch;

use crate::dfr::Keying;
use crate::error::EngineError;
use crate::output::OutputKind;
use crate::passes::Pass;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub directives: Vec<Directive>,
    /// Seed for every random choice of the build. Fresh entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Names of the inputs the script loads, in order of first use.
    pub fn inputs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for d in &self.directives {
            if let Directive::Load { input, .. } | Directive::Mergelib { input } = d {
                if !names.contains(&input.as_str()) {
                    names.push(input);
                }
            }
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchName {
    X86,
    X64,
}

impl From<ArchName> for Arch {
    fn from(a: ArchName) -> Arch {
        match a {
            ArchName::X86 => Arch::X86,
            ArchName::X64 => Arch::X64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Directive {
    /// Push an object, an archive (members merged) or a raw blob.
    Load {
        input: String,
        #[serde(default)]
        raw: bool,
        /// Architecture tag of a raw blob.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arch: Option<ArchName>,
    },
    /// Pop two artifacts and push their union.
    Merge,
    /// Merge every member of an archive into the top artifact.
    Mergelib { input: String },
    /// Run the weaver, the resolver injector and the requested passes.
    Make {
        #[serde(default)]
        passes: Vec<Pass>,
        /// Entry symbol, `go` by default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry: Option<String>,
        /// Current-address accessor used by `fixptrs`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ptr_accessor: Option<String>,
        /// Base-address accessor used by `fixbss`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bss_accessor: Option<String>,
    },
    /// Pop the top artifact and append its bytes as a resource of the one
    /// below it.
    Append {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Pop the top artifact and serialize it.
    Link { output: String, kind: OutputKind },
    /// Route imports of `modules` (every module when empty) to `resolver`.
    Dfr {
        resolver: String,
        #[serde(default)]
        keying: Keying,
        #[serde(default)]
        modules: Vec<String>,
    },
    /// Redirect calls of `target` to `hook`. Later attachments run after
    /// earlier ones.
    Attach { target: String, hook: String },
    /// Exempt functions from every redirection.
    Protect { functions: Vec<String> },
    /// Keep calls of `target` made by `functions` pointing at the target.
    Preserve {
        target: String,
        functions: Vec<String>,
    },
    /// Skip `hooks` when rewriting calls made by `function`.
    Optout { function: String, hooks: Vec<String> },
    /// Register `hook` for `target` in the hook table.
    Addhook { target: String, hook: String },
    /// Drop hook-table entries whose target is never called.
    Filterhooks,
    /// Export `function` under the random tag bound to `tag`.
    Export { function: String, tag: String },
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Directive::Load { .. } => "load",
            Directive::Merge => "merge",
            Directive::Mergelib { .. } => "mergelib",
            Directive::Make { .. } => "make",
            Directive::Append { .. } => "append",
            Directive::Link { .. } => "link",
            Directive::Dfr { .. } => "dfr",
            Directive::Attach { .. } => "attach",
            Directive::Protect { .. } => "protect",
            Directive::Preserve { .. } => "preserve",
            Directive::Optout { .. } => "optout",
            Directive::Addhook { .. } => "addhook",
            Directive::Filterhooks => "filterhooks",
            Directive::Export { .. } => "export",
        }
    }
}

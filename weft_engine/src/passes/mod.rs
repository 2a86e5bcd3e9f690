//! Transform passes.
//!
//! Every pass works on a private copy of the module and replaces the
//! original only when it succeeds, so a failing pass leaves the artifact
//! exactly as it was.

mod address;
pub mod disco;
pub mod fixbss;
pub mod fixptrs;
pub mod gofirst;
pub mod mutate;
pub mod optimize;

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use weft_obj::Module;

use crate::error::EngineError;
use crate::log::BuildLog;

/// The closed set of pass flags accepted by `make`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Pass {
    Optimize,
    Disco,
    Mutate,
    Gofirst,
    Fixptrs,
    Fixbss,
}

impl Pass {
    /// Execution order when several passes are requested together.
    pub const ORDER: [Pass; 6] = [
        Pass::Optimize,
        Pass::Fixptrs,
        Pass::Fixbss,
        Pass::Disco,
        Pass::Mutate,
        Pass::Gofirst,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pass::Optimize => "optimize",
            Pass::Disco => "disco",
            Pass::Mutate => "mutate",
            Pass::Gofirst => "gofirst",
            Pass::Fixptrs => "fixptrs",
            Pass::Fixbss => "fixbss",
        }
    }

    /// `requested` sorted into execution order, without duplicates.
    pub fn ordered(requested: &[Pass]) -> Vec<Pass> {
        Self::ORDER
            .into_iter()
            .filter(|p| requested.contains(p))
            .collect()
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix('+').unwrap_or(s);
        Self::ORDER
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| format!("unknown pass `{s}`"))
    }
}

impl TryFrom<String> for Pass {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Pass> for String {
    fn from(p: Pass) -> String {
        p.name().to_string()
    }
}

/// Everything a pass may consult besides the module itself.
pub struct PassContext<'a> {
    pub entry: &'a str,
    /// Symbols that must survive `optimize` besides the entry: exports,
    /// registered hooks, the hook table.
    pub roots: &'a [String],
    pub ptr_accessor: Option<&'a str>,
    pub bss_accessor: Option<&'a str>,
    pub rng: &'a mut StdRng,
    pub log: &'a mut BuildLog,
}

/// Run one pass atomically.
pub fn run_pass(pass: Pass, module: &mut Module, cx: &mut PassContext) -> Result<(), EngineError> {
    let mut work = module.clone();
    match pass {
        Pass::Optimize => optimize::run(&mut work, cx)?,
        Pass::Disco => disco::run(&mut work, cx)?,
        Pass::Mutate => mutate::run(&mut work, cx)?,
        Pass::Gofirst => gofirst::run(&mut work, cx)?,
        Pass::Fixptrs => fixptrs::run(&mut work, cx)?,
        Pass::Fixbss => fixbss::run(&mut work, cx)?,
    }
    *module = work;
    cx.log.applied(&module.name, format!("+{pass}"));
    Ok(())
}

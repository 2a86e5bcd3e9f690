//! weft_engine: composition, transform passes, resolver injection, aspect
//! weaving and output generation on top of `weft_obj` and `weft_x86`.

pub mod composer;
pub mod dfr;
pub mod error;
pub mod layout;
pub mod log;
pub mod output;
pub mod passes;
pub mod script;
pub mod weave;

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

pub use composer::{Composer, State};
pub use error::EngineError;
pub use log::BuildLog;
pub use output::{validate_output, OutputKind, OutputReport};
pub use passes::Pass;
pub use script::{Directive, Script};

/// Everything a successful build produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Output bytes by the name given to `link`.
    pub outputs: BTreeMap<String, Vec<u8>>,
    pub log: BuildLog,
}

/// Run `script` against the named input files. Any error aborts the build
/// with no partial output.
#[tracing::instrument(skip_all, name = "Build")]
pub fn build(script: &Script, inputs: &HashMap<String, Vec<u8>>) -> Result<BuildOutput, EngineError> {
    let mut composer = Composer::new(inputs, script.seed);
    for directive in &script.directives {
        composer.apply(directive)?;
    }
    let (outputs, log) = composer.finish();
    if outputs.is_empty() {
        tracing::warn!("build script never links an output");
    }
    Ok(BuildOutput { outputs, log })
}

/// Run independent builds in parallel. Each build owns its modules and its
/// random number generator.
pub fn build_many(jobs: &[(Script, HashMap<String, Vec<u8>>)]) -> Vec<Result<BuildOutput, EngineError>> {
    jobs.par_iter().map(|(script, inputs)| build(script, inputs)).collect()
}

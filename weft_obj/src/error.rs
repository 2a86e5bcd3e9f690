//! Errors raised while loading, merging and checking modules.

use thiserror::Error;

use crate::module::Arch;

#[derive(Debug, Error)]
pub enum ObjError {
    /// Section, symbol or relocation tables are inconsistent, or the input
    /// is not an object this crate understands.
    #[error("malformed input `{module}`: {reason}")]
    MalformedInput { module: String, reason: String },

    /// Two strong definitions of the same global symbol disagree.
    #[error("duplicate symbol `{symbol}` defined by both `{first}` and `{second}`")]
    DuplicateSymbol {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("cannot combine `{first}` ({first_arch}) with `{second}` ({second_arch})")]
    ArchMismatch {
        first: String,
        first_arch: Arch,
        second: String,
        second_arch: Arch,
    },
}

impl ObjError {
    pub(crate) fn malformed(module: &str, reason: impl Into<String>) -> Self {
        ObjError::MalformedInput {
            module: module.to_string(),
            reason: reason.into(),
        }
    }
}

//! Engine result codes.

use thiserror::Error;
use weft_obj::ObjError;
use weft_x86::EncodeError;

use crate::composer::State;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed input `{module}`: {reason}")]
    MalformedInput { module: String, reason: String },

    #[error("duplicate symbol `{symbol}` defined by both `{first}` and `{second}`")]
    DuplicateSymbol {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("`{directive}` needs {needed} artifact(s) on the stack")]
    StackUnderflow { directive: String, needed: usize },

    #[error("{pass}: cannot rewrite `{inst}` at {function}+{offset:#x}: {reason}")]
    UnsupportedAddressingForm {
        pass: &'static str,
        function: String,
        offset: u64,
        inst: String,
        reason: String,
    },

    #[error("no resolver handles module `{module}` (import `{symbol}`)")]
    NoResolverForModule { module: String, symbol: String },

    #[error("undefined symbol `{symbol}` ({context})")]
    UndefinedSymbol { symbol: String, context: String },

    #[error("`{symbol}` is referenced by an absolute relocation at {section}+{offset:#x}, which position-independent output cannot carry")]
    PositionDependent {
        symbol: String,
        section: String,
        offset: u64,
    },

    #[error("`{directive}` is not valid while the top artifact is {state:?}")]
    InvalidState { directive: String, state: State },

    #[error("`{directive}` needs the `{parameter}` parameter")]
    MissingParameter {
        directive: String,
        parameter: &'static str,
    },

    #[error("no input named `{0}`")]
    MissingInput(String),

    #[error("invalid build script: {0}")]
    Script(#[from] serde_json::Error),

    #[error("cannot encode in `{function}`: {source}")]
    Encode {
        function: String,
        #[source]
        source: EncodeError,
    },

    #[error("object writer failed: {0}")]
    Output(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl From<ObjError> for EngineError {
    fn from(e: ObjError) -> Self {
        let message = e.to_string();
        match e {
            ObjError::MalformedInput { module, reason } => EngineError::MalformedInput { module, reason },
            ObjError::DuplicateSymbol {
                symbol,
                first,
                second,
            } => EngineError::DuplicateSymbol {
                symbol,
                first,
                second,
            },
            ObjError::ArchMismatch { second, .. } => EngineError::MalformedInput {
                module: second,
                reason: message,
            },
        }
    }
}

impl EngineError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        EngineError::Invariant(message.into())
    }

    pub(crate) fn undefined(symbol: impl Into<String>, context: impl Into<String>) -> Self {
        EngineError::UndefinedSymbol {
            symbol: symbol.into(),
            context: context.into(),
        }
    }
}

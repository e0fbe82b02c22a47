//! Errors raised by the lowering passes
//!
//! Every variant is an internal-consistency violation: the input tree was
//! malformed and the pass stops instead of guessing.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    #[error("internal compiler error in {method}: anonymous function refers to generic parameter `{param}`, which the method does not declare")]
    ForeignGenericParameter { method: String, param: String },

    #[error("internal compiler error in {method}: `{variable}` is used inside an anonymous function but has no enclosing declaration")]
    UnboundVariable { method: String, variable: String },

    #[error("internal compiler error in {method}: no closure instance holds {what}")]
    MissingClosure { method: String, what: String },

    #[error("internal compiler error in {method}: yield statements are not allowed inside anonymous functions")]
    YieldInsideAnonymousFunction { method: String },

    #[error("internal compiler error in {method}: iterator must return a sequence or enumerator type, found `{found}`")]
    NotASequence { method: String, found: String },

    #[error("internal compiler error in {method}: anonymous function survived closure conversion")]
    UnexpectedAnonymousFunction { method: String },

    #[error("internal compiler error in {method}: method has no body to lower")]
    MissingBody { method: String },
}

impl LowerError {
    /// Qualified name of the method being lowered.
    pub fn method(&self) -> &str {
        match self {
            LowerError::ForeignGenericParameter { method, .. }
            | LowerError::UnboundVariable { method, .. }
            | LowerError::MissingClosure { method, .. }
            | LowerError::YieldInsideAnonymousFunction { method }
            | LowerError::NotASequence { method, .. }
            | LowerError::UnexpectedAnonymousFunction { method }
            | LowerError::MissingBody { method } => method,
        }
    }
}

pub type Result<T> = std::result::Result<T, LowerError>;

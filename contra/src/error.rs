use contra_ast::ContraError;
use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;

/// Anything a compile session can fail with.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Contra(#[from] ContraError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl CompileError {
    /// The language error, if this is one.
    pub fn as_contra(&self) -> Option<&ContraError> {
        match self {
            CompileError::Contra(e) => Some(e),
            CompileError::Config(_) => None,
        }
    }
}

#![allow(unused_assignments)]

use contra_ast::{ContraError, Span};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Clone, Debug, Error, Diagnostic)]
#[error("ir error: {message}")]
#[diagnostic(code(contra::ir))]
#[allow(unused_assignments)]
pub struct IrError {
    pub message: String,
    #[label]
    pub span: Span,
}

impl IrError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl From<IrError> for ContraError {
    fn from(e: IrError) -> Self {
        ContraError::implementation(e.message, e.span)
    }
}

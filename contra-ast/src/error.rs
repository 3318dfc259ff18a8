#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

use crate::Span;

/// Which of the three failure families an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Name,
    Type,
    Implementation,
}

#[derive(Clone, Debug, Error, Diagnostic)]
#[allow(unused_assignments)]
pub enum ContraError {
    #[error("name error: {message}")]
    #[diagnostic(code(contra::name_error))]
    Name {
        message: String,
        #[label]
        span: Span,
    },

    #[error("type error: {message}")]
    #[diagnostic(code(contra::type_error))]
    Type {
        message: String,
        #[label]
        span: Span,
    },

    #[error("implementation error: {message}")]
    #[diagnostic(
        code(contra::implementation_error),
        help("the analyzer should have rejected this construct; please report it")
    )]
    Implementation {
        message: String,
        #[label]
        span: Span,
    },
}

impl ContraError {
    pub fn name(message: impl Into<String>, span: Span) -> Self {
        Self::Name {
            message: message.into(),
            span,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::Type {
            message: message.into(),
            span,
        }
    }

    pub fn implementation(message: impl Into<String>, span: Span) -> Self {
        Self::Implementation {
            message: message.into(),
            span,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Name { .. } => ErrorKind::Name,
            Self::Type { .. } => ErrorKind::Type,
            Self::Implementation { .. } => ErrorKind::Implementation,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Name { message, .. }
            | Self::Type { message, .. }
            | Self::Implementation { message, .. } => message,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::Name { span, .. } | Self::Type { span, .. } | Self::Implementation { span, .. } => {
                *span
            }
        }
    }
}

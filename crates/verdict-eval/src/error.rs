//! Evaluation errors

use thiserror::Error;
use verdict_lang::Location;
use verdict_storage::StorageError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("evaluation cancelled")]
    Cancelled,

    /// Two rule bodies produced incompatible values for one document.
    #[error("conflict{}: {message}", at(.location))]
    Conflict {
        message: String,
        location: Option<Location>,
    },

    #[error("{builtin}{}: operand {position} {message}", at(.location))]
    Type {
        builtin: String,
        position: usize,
        message: String,
        location: Option<Location>,
    },

    /// Failure raised by a built-in's own logic.
    #[error("{name}{}: {message}", at(.location))]
    Builtin {
        name: String,
        location: Option<Location>,
        message: String,
    },

    #[error("unknown built-in function {name}{}", at(.location))]
    UnknownBuiltin {
        name: String,
        location: Option<Location>,
    },

    /// A configured ref (unknowns, inlining controls) that does not parse.
    #[error("invalid reference {0:?}")]
    InvalidRef(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

fn at(location: &Option<Location>) -> String {
    location.map(|l| format!(" at {l}")).unwrap_or_default()
}

impl EvalError {
    pub fn conflict(message: impl Into<String>, location: Option<Location>) -> Self {
        EvalError::Conflict {
            message: message.into(),
            location,
        }
    }

    /// Type error for use inside built-ins; the dispatcher fills in the
    /// call location.
    pub fn type_error(builtin: &str, position: usize, message: impl Into<String>) -> Self {
        EvalError::Type {
            builtin: builtin.to_string(),
            position,
            message: message.into(),
            location: None,
        }
    }

    /// Failure for use inside built-ins; the dispatcher fills in name and
    /// location.
    pub fn builtin(message: impl Into<String>) -> Self {
        EvalError::Builtin {
            name: String::new(),
            location: None,
            message: message.into(),
        }
    }

    /// Attribute an error returned by a built-in to its call site.
    pub(crate) fn attribute(self, name: &str, location: Option<Location>) -> Self {
        match self {
            EvalError::Cancelled => EvalError::Cancelled,
            EvalError::Type {
                builtin,
                position,
                message,
                location: loc,
            } => EvalError::Type {
                builtin: if builtin.is_empty() { name.to_string() } else { builtin },
                position,
                message,
                location: loc.or(location),
            },
            EvalError::Builtin { message, .. } => EvalError::Builtin {
                name: name.to_string(),
                location,
                message,
            },
            other => EvalError::Builtin {
                name: name.to_string(),
                location,
                message: other.to_string(),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EvalError::Cancelled)
    }
}

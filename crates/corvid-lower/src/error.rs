//! Lowering errors.

use thiserror::Error;

/// Result of a lowering step.
pub type LowerResult<T> = Result<T, LowerError>;

/// Errors that abort the lowering of a module.
#[derive(Debug, Error)]
pub enum LowerError {
    #[error("Internal lowering error in {pass}: {message}")]
    Internal { pass: &'static str, message: String },

    #[error("Precondition failed for `{decl}`: {message}")]
    Precondition { decl: String, message: String },

    #[error("Unsupported construct in `{decl}`: {construct}")]
    Unsupported { construct: String, decl: String },

    #[error("Failed to read lowering configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse lowering configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl LowerError {
    pub fn internal(pass: &'static str, message: impl Into<String>) -> Self {
        LowerError::Internal {
            pass,
            message: message.into(),
        }
    }

    pub fn precondition(decl: impl Into<String>, message: impl Into<String>) -> Self {
        LowerError::Precondition {
            decl: decl.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(construct: impl Into<String>, decl: impl Into<String>) -> Self {
        LowerError::Unsupported {
            construct: construct.into(),
            decl: decl.into(),
        }
    }
}

//! IR verification errors.

use thiserror::Error;

/// Result of IR queries that can fail.
pub type IrResult<T> = Result<T, IrError>;

/// A broken graph invariant found by [`verify_module`](crate::verify_module).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("{decl}: member declares parent {found} but is listed under {expected}")]
    ParentMismatch {
        decl: String,
        expected: String,
        found: String,
    },

    #[error("{decl}: return targets {target}, which does not enclose it")]
    ForeignReturn { decl: String, target: String },

    #[error("{decl}: unresolved state placeholder {state}")]
    UnresolvedState { decl: String, state: u32 },

    #[error("{decl}: {what} {id} is out of range")]
    DanglingReference {
        decl: String,
        what: &'static str,
        id: u32,
    },

    #[error("{decl}: expression id {id} occurs more than once")]
    DuplicateExprId { decl: String, id: u32 },
}

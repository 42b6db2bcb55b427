//! Preparation of local declarations for inlining.
//!
//! - `local_classes`: local classes and functions of inline lambdas move in
//!   front of the inline call
//! - `extraction`: local classes of inline functions that do not depend on
//!   the call site move to the enclosing file or class.
//!
//! Both convert captured values to explicit fields or parameters
//! (`captures`).

mod captures;
pub mod extraction;
pub mod local_classes;

pub use extraction::{
    collect_extractable_local_classes_into, copy_policy, CopyPolicy,
    LocalClassesExtractionFromInlineFunctionsLowering,
};
pub use local_classes::LocalClassesInInlineLambdasLowering;

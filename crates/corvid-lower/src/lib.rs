//! Corvid lowering core.
//!
//! Passes over the [`corvid_ir`] graph that run before code generation:
//! - [`inline`]: local classes and functions leave inline lambdas and inline
//!   function bodies
//! - [`coroutines`]: suspend functions become continuation-passing stubs,
//!   with a state machine when they suspend outside of tail position.
//!
//! [`pipeline`] wires them in their fixed order. Passes follow the
//! [`pass`] protocol and share a [`LoweringContext`] per module.

pub mod config;
pub mod context;
pub mod coroutines;
pub mod error;
pub mod inline;
pub mod pass;
pub mod pipeline;
pub mod report;
mod rewrite;

pub use config::LoweringConfig;
pub use context::LoweringContext;
pub use coroutines::{
    lower_suspend_function, ContinuationStubCache, LocalSuspendFunctionsLowering,
    LoweredSuspendFunction, LoweringStrategy, StateMachine, SuspendFunctionsLowering,
};
pub use error::{LowerError, LowerResult};
pub use inline::{
    copy_policy, CopyPolicy, LocalClassesExtractionFromInlineFunctionsLowering,
    LocalClassesInInlineLambdasLowering,
};
pub use pass::{BodyLoweringPass, DeclarationTransformer, LoweringPass, PassManager};
pub use pipeline::{default_pipeline, lower_module, lower_modules_parallel};
pub use report::{ExtractionRecord, ModuleReport, StateMachineSummary};

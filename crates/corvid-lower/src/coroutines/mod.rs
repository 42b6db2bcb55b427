//! Suspend function lowering.
//!
//! Suspend functions become regular functions taking a trailing continuation
//! (`stubs`). Bodies that suspend outside of tail position (`tail_call`) are
//! cut into a state machine (`classify`, `state_machine`) driven by a
//! generated continuation class (`continuation`) whose fields keep the values
//! that live across suspensions (`liveness`).

pub mod classify;
pub mod continuation;
pub mod liveness;
pub mod lowering;
pub mod state_machine;
pub mod stubs;
pub mod tail_call;

pub use classify::{classify_suspension_points, is_suspension_point, SuspendableNodes};
pub use continuation::{
    create_continuation_class, ContinuationClass, ContinuationSlots, ContinuationSynthesizer,
    LiveLocalsTransformer,
};
pub use liveness::{compute_liveness_at_suspension_points, LivenessInfo};
pub use lowering::{lower_suspend_function, LocalSuspendFunctionsLowering, SuspendFunctionsLowering};
pub use state_machine::{StateKind, StateMachine, StateMachineBuilder, SuspendState};
pub use stubs::{
    completion_param, get_or_create_function_with_continuation_stub, transform_suspend_function,
    ContinuationStubCache, LoweredSuspendFunction, LoweringStrategy,
};
pub use tail_call::{collect_tail_calls, generate_delegated_call, needs_unboxing_or_unit, rewrite_tail_calls};

//! Arena indices.
//!
//! Every node of the graph is addressed by a small `Copy` index into an arena
//! owned by [`IrModule`](crate::IrModule). Identity comparisons are index
//! comparisons.

use std::fmt;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(id: u32) -> Self {
                Self(id)
            }

            pub fn as_u32(&self) -> u32 {
                self.0
            }

            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// A declaration (function, class, field, local delegated property).
    DeclId,
    "d"
);
arena_id!(
    /// A value declaration (parameter, local variable, receiver).
    VarId,
    "v"
);
arena_id!(
    /// An expression node; unique within a module.
    ExprId,
    "e"
);
arena_id!(
    /// A source file of a module.
    FileId,
    "f"
);
arena_id!(
    /// A module; used to key side tables shared between modules.
    ModuleId,
    "m"
);

/// Loops are identified by the id of their own expression node, so `break`
/// and `continue` refer to the loop they leave.
pub type LoopId = ExprId;

impl ExprId {
    /// Id carried by nodes that only exist while a tree is being rebuilt.
    pub const PLACEHOLDER: ExprId = ExprId(u32::MAX);
}

//! Corvid IR - declaration and expression graph.
//!
//! The graph the lowering passes read and mutate:
//! - [`IrModule`]: arenas of declarations and value declarations, files, and
//!   the expression id counter
//! - [`Expr`]: expression trees with per-node ids and types
//! - [`IrBuilder`]: construction helpers
//! - [`PrettyPrint`] and [`verify_module`] for inspection.

pub mod builder;
pub mod decl;
pub mod error;
pub mod expr;
pub mod ids;
pub mod module;
pub mod pretty;
pub mod types;
pub mod verify;

pub use builder::IrBuilder;
pub use decl::{
    ClassDecl, DeclKind, DeclParent, Declaration, DelegatedPropertyDecl, FieldDecl, FunctionDecl,
    InlineMode, Origin, ParamInfo, TypeParam, ValueDecl, ValueKind,
};
pub use error::{IrError, IrResult};
pub use expr::{BinaryOp, Body, Catch, Const, Expr, ExprKind, LoopKind, SwitchCase, TypeOp};
pub use ids::{DeclId, ExprId, FileId, LoopId, ModuleId, VarId};
pub use module::{IrFile, IrModule};
pub use pretty::PrettyPrint;
pub use types::Type;
pub use verify::verify_module;

//! Expression trees.
//!
//! Function bodies are trees of [`Expr`] nodes. Every node carries a module
//! unique [`ExprId`] so analyses can key side tables by node identity, and the
//! static type of the value it produces.
//!
//! Nodes are plain tagged unions. Generic traversal goes through
//! [`Expr::visit_children`], [`Expr::visit_children_mut`] and
//! [`Expr::map_children`], which list children in evaluation order.

use crate::ids::{DeclId, ExprId, LoopId, VarId};
use crate::types::Type;

/// Constant literals.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Unit,
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

/// Binary operators on primitive operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Reference identity (`===`).
    IdentityEq,
    And,
    Or,
}

impl BinaryOp {
    /// Operator as printed by the pretty printer.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::IdentityEq => "===",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Operators that test or convert the type of their operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOp {
    InstanceOf,
    Cast,
    /// Cast inserted by a lowering; never fails at runtime.
    ImplicitCast,
}

/// Whether the condition is checked before or after the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    DoWhile,
}

/// A `catch` clause; the caught type is the type of `param`.
#[derive(Debug, Clone)]
pub struct Catch {
    /// Binds the caught exception inside `body`.
    pub param: VarId,
    /// Handler run when the exception matches.
    pub body: Expr,
}

/// One `label -> body` arm of a `when`.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// Integer constant, or a state placeholder while a state machine is built.
    pub label: Expr,
    /// Arm evaluated when the subject equals `label`.
    pub body: Expr,
}

/// Node payloads. Statements are expressions typed `Unit` or `Nothing`.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Const(Const),
    /// The runtime's "suspended" sentinel.
    Suspended,
    GetVar(VarId),
    SetVar {
        var: VarId,
        value: Box<Expr>,
    },
    /// Local variable declaration statement.
    VarDecl {
        var: VarId,
        init: Option<Box<Expr>>,
    },
    GetField {
        receiver: Box<Expr>,
        field: DeclId,
    },
    SetField {
        receiver: Box<Expr>,
        field: DeclId,
        value: Box<Expr>,
    },
    /// Call of a declared function. For member functions the first argument is
    /// the dispatch receiver.
    Call {
        callee: DeclId,
        args: Vec<Expr>,
    },
    /// Invocation of a function-typed value.
    Invoke {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Constructor call.
    New {
        class: DeclId,
        args: Vec<Expr>,
    },
    /// Statement sequence. Transparent blocks (composites) do not open a scope.
    Block {
        stmts: Vec<Expr>,
        transparent: bool,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    Switch {
        subject: Box<Expr>,
        cases: Vec<SwitchCase>,
        default: Option<Box<Expr>>,
    },
    Loop {
        kind: LoopKind,
        label: Option<String>,
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    Break {
        target: LoopId,
    },
    Continue {
        target: LoopId,
    },
    Return {
        target: DeclId,
        value: Box<Expr>,
    },
    Throw(Box<Expr>),
    Try {
        body: Box<Expr>,
        catches: Vec<Catch>,
        finally: Option<Box<Expr>>,
    },
    /// Function literal; the body lives in a separate function declaration.
    Lambda {
        function: DeclId,
    },
    /// Function reference. Adapted references own a synthetic invoke function
    /// whose body is part of the enclosing code.
    FunctionRef {
        function: DeclId,
        bound: Vec<Expr>,
        adapted: bool,
    },
    /// Local declaration statement (local class, local function, delegated
    /// local property).
    Declaration(DeclId),
    TypeOp {
        op: TypeOp,
        operand: Box<Expr>,
        target: Type,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Reference to a suspend state whose id is not assigned yet.
    StateRef(u32),
}

/// An expression node. Ids are unique within a module.
#[derive(Debug, Clone)]
pub struct Expr {
    /// Identity of the node; lowerings keep it when they rebuild a node in place.
    pub id: ExprId,
    /// Static type of the value.
    pub ty: Type,
    /// What the node computes.
    pub kind: ExprKind,
}

/// Function body.
#[derive(Debug, Clone, Default)]
pub struct Body {
    /// Top-level statements in evaluation order.
    pub stmts: Vec<Expr>,
}

impl Body {
    pub fn new(stmts: Vec<Expr>) -> Self {
        Self { stmts }
    }

    /// Visit every node, parents before children.
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        for stmt in &self.stmts {
            stmt.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        for stmt in &mut self.stmts {
            stmt.walk_mut(f);
        }
    }
}

impl Expr {
    pub fn new(id: ExprId, ty: Type, kind: ExprKind) -> Self {
        Self { id, ty, kind }
    }

    /// Temporary node used while a tree is taken apart and rebuilt.
    pub fn placeholder() -> Self {
        Self::new(ExprId::PLACEHOLDER, Type::Unit, ExprKind::Const(Const::Unit))
    }

    pub fn is_empty_composite(&self) -> bool {
        matches!(&self.kind, ExprKind::Block { stmts, transparent: true } if stmts.is_empty())
    }

    /// Control never falls through this node.
    pub fn is_jump(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Return { .. }
                | ExprKind::Throw(_)
                | ExprKind::Break { .. }
                | ExprKind::Continue { .. }
        )
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self.kind {
            ExprKind::GetVar(var) => Some(var),
            _ => None,
        }
    }

    /// Visit direct children in evaluation order.
    pub fn visit_children(&self, f: &mut dyn FnMut(&Expr)) {
        match &self.kind {
            ExprKind::Const(_)
            | ExprKind::Suspended
            | ExprKind::GetVar(_)
            | ExprKind::Break { .. }
            | ExprKind::Continue { .. }
            | ExprKind::Lambda { .. }
            | ExprKind::Declaration(_)
            | ExprKind::StateRef(_) => {}
            ExprKind::SetVar { value, .. } => f(value),
            ExprKind::VarDecl { init, .. } => {
                if let Some(init) = init {
                    f(init);
                }
            }
            ExprKind::GetField { receiver, .. } => f(receiver),
            ExprKind::SetField {
                receiver, value, ..
            } => {
                f(receiver);
                f(value);
            }
            ExprKind::Call { args, .. } | ExprKind::New { args, .. } => args.iter().for_each(f),
            ExprKind::Invoke { callee, args } => {
                f(callee);
                args.iter().for_each(f);
            }
            ExprKind::Block { stmts, .. } => stmts.iter().for_each(f),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                f(cond);
                f(then_branch);
                if let Some(e) = else_branch {
                    f(e);
                }
            }
            ExprKind::Switch {
                subject,
                cases,
                default,
            } => {
                f(subject);
                for case in cases {
                    f(&case.label);
                    f(&case.body);
                }
                if let Some(d) = default {
                    f(d);
                }
            }
            ExprKind::Loop {
                kind, cond, body, ..
            } => match kind {
                LoopKind::While => {
                    f(cond);
                    f(body);
                }
                LoopKind::DoWhile => {
                    f(body);
                    f(cond);
                }
            },
            ExprKind::Return { value, .. } => f(value),
            ExprKind::Throw(value) => f(value),
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                f(body);
                for catch in catches {
                    f(&catch.body);
                }
                if let Some(fin) = finally {
                    f(fin);
                }
            }
            ExprKind::FunctionRef { bound, .. } => bound.iter().for_each(f),
            ExprKind::TypeOp { operand, .. } => f(operand),
            ExprKind::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
        }
    }

    /// Mutable counterpart of [`Expr::visit_children`].
    pub fn visit_children_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match &mut self.kind {
            ExprKind::Const(_)
            | ExprKind::Suspended
            | ExprKind::GetVar(_)
            | ExprKind::Break { .. }
            | ExprKind::Continue { .. }
            | ExprKind::Lambda { .. }
            | ExprKind::Declaration(_)
            | ExprKind::StateRef(_) => {}
            ExprKind::SetVar { value, .. } => f(value),
            ExprKind::VarDecl { init, .. } => {
                if let Some(init) = init {
                    f(init);
                }
            }
            ExprKind::GetField { receiver, .. } => f(receiver),
            ExprKind::SetField {
                receiver, value, ..
            } => {
                f(receiver);
                f(value);
            }
            ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
                args.iter_mut().for_each(f)
            }
            ExprKind::Invoke { callee, args } => {
                f(callee);
                args.iter_mut().for_each(f);
            }
            ExprKind::Block { stmts, .. } => stmts.iter_mut().for_each(f),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                f(cond);
                f(then_branch);
                if let Some(e) = else_branch {
                    f(e);
                }
            }
            ExprKind::Switch {
                subject,
                cases,
                default,
            } => {
                f(subject);
                for case in cases {
                    f(&mut case.label);
                    f(&mut case.body);
                }
                if let Some(d) = default {
                    f(d);
                }
            }
            ExprKind::Loop {
                kind, cond, body, ..
            } => match kind {
                LoopKind::While => {
                    f(cond);
                    f(body);
                }
                LoopKind::DoWhile => {
                    f(body);
                    f(cond);
                }
            },
            ExprKind::Return { value, .. } => f(value),
            ExprKind::Throw(value) => f(value),
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                f(body);
                for catch in catches {
                    f(&mut catch.body);
                }
                if let Some(fin) = finally {
                    f(fin);
                }
            }
            ExprKind::FunctionRef { bound, .. } => bound.iter_mut().for_each(f),
            ExprKind::TypeOp { operand, .. } => f(operand),
            ExprKind::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
        }
    }

    /// Rebuild this node with every direct child replaced by `f(child)`.
    pub fn map_children(mut self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        self.visit_children_mut(&mut |child| {
            let taken = std::mem::replace(child, Expr::placeholder());
            *child = f(taken);
        });
        self
    }

    /// Pre-order walk over this node and all descendants. Lambda and local
    /// declaration bodies are not part of the tree and are not visited.
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        self.visit_children(&mut |child| child.walk(f));
    }

    /// Post-order mutable walk; children are rewritten before their parent.
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        self.visit_children_mut(&mut |child| child.walk_mut(f));
        f(self);
    }

    /// Post-order rebuild by value.
    pub fn transform(self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = self.map_children(&mut |child| child.transform(f));
        f(rebuilt)
    }

    /// True if any node of the tree satisfies `pred`.
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if !found && pred(e) {
                found = true;
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(id: u32, v: i64) -> Expr {
        Expr::new(ExprId(id), Type::Int, ExprKind::Const(Const::Int(v)))
    }

    fn add(id: u32, l: Expr, r: Expr) -> Expr {
        Expr::new(
            ExprId(id),
            Type::Int,
            ExprKind::Binary {
                op: BinaryOp::Add,
                left: Box::new(l),
                right: Box::new(r),
            },
        )
    }

    #[test]
    fn test_walk_is_preorder() {
        let e = add(0, int(1, 1), add(2, int(3, 2), int(4, 3)));
        let mut ids = Vec::new();
        e.walk(&mut |n| ids.push(n.id.0));
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_walk_mut_is_postorder() {
        let mut e = add(0, int(1, 1), int(2, 2));
        let mut ids = Vec::new();
        e.walk_mut(&mut |n| ids.push(n.id.0));
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn test_transform_rewrites_leaves() {
        let e = add(0, int(1, 1), int(2, 2));
        let doubled = e.transform(&mut |n| match n.kind {
            ExprKind::Const(Const::Int(v)) => int(n.id.0, v * 2),
            _ => n,
        });
        let mut values = Vec::new();
        doubled.walk(&mut |n| {
            if let ExprKind::Const(Const::Int(v)) = n.kind {
                values.push(v);
            }
        });
        assert_eq!(values, vec![2, 4]);
    }

    #[test]
    fn test_do_while_visits_body_first() {
        let e = Expr::new(
            ExprId(0),
            Type::Unit,
            ExprKind::Loop {
                kind: LoopKind::DoWhile,
                label: None,
                cond: Box::new(int(1, 0)),
                body: Box::new(int(2, 0)),
            },
        );
        let mut ids = Vec::new();
        e.visit_children(&mut |n| ids.push(n.id.0));
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_empty_composite() {
        let e = Expr::new(
            ExprId(0),
            Type::Unit,
            ExprKind::Block {
                stmts: vec![],
                transparent: true,
            },
        );
        assert!(e.is_empty_composite());
    }
}

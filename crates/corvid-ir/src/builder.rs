//! Expression construction helpers.
//!
//! Every node needs a fresh module-unique id and a type; `IrBuilder` takes
//! care of both so passes and tests can build trees tersely.

use crate::decl::{DeclParent, FunctionDecl, InlineMode, Origin, ParamInfo, ValueDecl, ValueKind};
use crate::expr::{BinaryOp, Body, Catch, Const, Expr, ExprKind, LoopKind, SwitchCase, TypeOp};
use crate::ids::{DeclId, ExprId, VarId};
use crate::module::IrModule;
use crate::types::Type;

/// Creates expressions with fresh ids and the declarations they refer to.
pub struct IrBuilder<'m> {
    module: &'m mut IrModule,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut IrModule) -> Self {
        Self { module }
    }

    pub fn module(&mut self) -> &mut IrModule {
        &mut *self.module
    }

    pub fn module_ref(&self) -> &IrModule {
        &*self.module
    }

    pub fn fresh_id(&mut self) -> ExprId {
        self.module.fresh_expr_id()
    }

    fn expr(&mut self, ty: Type, kind: ExprKind) -> Expr {
        let id = self.module.fresh_expr_id();
        Expr::new(id, ty, kind)
    }

    // ===== Declarations =====

    /// Add `function` to the members of `parent`.
    pub fn function(&mut self, parent: DeclParent, name: &str, function: FunctionDecl) -> DeclId {
        self.module.add_function(parent, name, function)
    }

    /// Function literal declared inside `parent`.
    pub fn lambda_function(&mut self, parent: DeclId, return_type: Type) -> DeclId {
        self.module.add_function_with_origin(
            DeclParent::Decl(parent),
            "<anonymous>",
            Origin::Lambda,
            FunctionDecl::new(return_type),
        )
    }

    /// Append a value parameter to `function`.
    pub fn param(&mut self, function: DeclId, name: &str, ty: Type) -> VarId {
        self.module.add_param(function, ValueDecl::param(name, ty))
    }

    /// Function-typed parameter with an explicit inlining mode.
    pub fn inline_param(&mut self, function: DeclId, name: &str, ty: Type, mode: InlineMode) -> VarId {
        self.module.add_param(
            function,
            ValueDecl {
                name: name.to_string(),
                ty,
                mutable: false,
                kind: ValueKind::Param(ParamInfo {
                    inline_mode: mode,
                    is_continuation: false,
                }),
            },
        )
    }

    pub fn dispatch_receiver(&mut self, function: DeclId, class: DeclId) -> VarId {
        let var = self.module.add_var(ValueDecl {
            name: "this".to_string(),
            ty: Type::Class(class),
            mutable: false,
            kind: ValueKind::Receiver,
        });
        if let Some(f) = self.module.function_mut(function) {
            f.dispatch_receiver = Some(var);
        }
        var
    }

    /// A fresh immutable local.
    pub fn local(&mut self, name: &str, ty: Type) -> VarId {
        self.module.add_var(ValueDecl::local(name, ty, false))
    }

    /// A fresh mutable local.
    pub fn local_var(&mut self, name: &str, ty: Type) -> VarId {
        self.module.add_var(ValueDecl::local(name, ty, true))
    }

    pub fn catch_param(&mut self, name: &str, ty: Type) -> VarId {
        self.module.add_var(ValueDecl {
            name: name.to_string(),
            ty,
            mutable: false,
            kind: ValueKind::CatchParam,
        })
    }

    /// Replace the body of `function` with `stmts`.
    pub fn set_body(&mut self, function: DeclId, stmts: Vec<Expr>) {
        self.module.set_body(function, Body::new(stmts));
    }

    // ===== Constants =====

    pub fn unit(&mut self) -> Expr {
        self.expr(Type::Unit, ExprKind::Const(Const::Unit))
    }

    pub fn null(&mut self) -> Expr {
        self.expr(Type::Nothing.nullable(), ExprKind::Const(Const::Null))
    }

    pub fn int(&mut self, value: i64) -> Expr {
        self.expr(Type::Int, ExprKind::Const(Const::Int(value)))
    }

    pub fn bool(&mut self, value: bool) -> Expr {
        self.expr(Type::Bool, ExprKind::Const(Const::Bool(value)))
    }

    pub fn string(&mut self, value: &str) -> Expr {
        self.expr(Type::String, ExprKind::Const(Const::String(value.to_string())))
    }

    pub fn suspended(&mut self) -> Expr {
        self.expr(Type::Any, ExprKind::Suspended)
    }

    pub fn state_ref(&mut self, state: u32) -> Expr {
        self.expr(Type::Int, ExprKind::StateRef(state))
    }

    // ===== Values =====

    pub fn get(&mut self, var: VarId) -> Expr {
        let ty = self.module.var(var).ty.clone();
        self.expr(ty, ExprKind::GetVar(var))
    }

    pub fn set(&mut self, var: VarId, value: Expr) -> Expr {
        self.expr(
            Type::Unit,
            ExprKind::SetVar {
                var,
                value: Box::new(value),
            },
        )
    }

    pub fn decl_var(&mut self, var: VarId, init: Option<Expr>) -> Expr {
        self.expr(
            Type::Unit,
            ExprKind::VarDecl {
                var,
                init: init.map(Box::new),
            },
        )
    }

    pub fn get_field(&mut self, receiver: Expr, field: DeclId) -> Expr {
        let ty = self
            .module
            .field(field)
            .map(|f| f.ty.clone())
            .unwrap_or(Type::Any);
        self.expr(
            ty,
            ExprKind::GetField {
                receiver: Box::new(receiver),
                field,
            },
        )
    }

    pub fn set_field(&mut self, receiver: Expr, field: DeclId, value: Expr) -> Expr {
        self.expr(
            Type::Unit,
            ExprKind::SetField {
                receiver: Box::new(receiver),
                field,
                value: Box::new(value),
            },
        )
    }

    // ===== Calls =====

    /// Direct call of `callee`, typed by its return type.
    pub fn call(&mut self, callee: DeclId, args: Vec<Expr>) -> Expr {
        let ty = self
            .module
            .function(callee)
            .map(|f| f.return_type.clone())
            .unwrap_or(Type::Any);
        self.expr(ty, ExprKind::Call { callee, args })
    }

    pub fn invoke(&mut self, callee: Expr, args: Vec<Expr>) -> Expr {
        let ty = callee.ty.return_type().cloned().unwrap_or(Type::Any);
        self.expr(
            ty,
            ExprKind::Invoke {
                callee: Box::new(callee),
                args,
            },
        )
    }

    pub fn new_object(&mut self, class: DeclId, args: Vec<Expr>) -> Expr {
        self.expr(Type::Class(class), ExprKind::New { class, args })
    }

    pub fn lambda(&mut self, function: DeclId) -> Expr {
        let ty = self.function_type(function);
        self.expr(ty, ExprKind::Lambda { function })
    }

    pub fn function_ref(&mut self, function: DeclId, bound: Vec<Expr>, adapted: bool) -> Expr {
        let ty = self.function_type(function);
        self.expr(
            ty,
            ExprKind::FunctionRef {
                function,
                bound,
                adapted,
            },
        )
    }

    fn function_type(&self, function: DeclId) -> Type {
        match self.module.function(function) {
            Some(f) => Type::Function {
                params: f.params.iter().map(|&p| self.module.var(p).ty.clone()).collect(),
                ret: Box::new(f.return_type.clone()),
                suspend: f.is_suspend,
            },
            None => Type::Any,
        }
    }

    pub fn declaration(&mut self, decl: DeclId) -> Expr {
        self.expr(Type::Unit, ExprKind::Declaration(decl))
    }

    // ===== Control flow =====

    pub fn block(&mut self, stmts: Vec<Expr>) -> Expr {
        let ty = stmts.last().map(|s| s.ty.clone()).unwrap_or(Type::Unit);
        self.expr(
            ty,
            ExprKind::Block {
                stmts,
                transparent: false,
            },
        )
    }

    /// Transparent block: does not open a scope.
    pub fn composite(&mut self, stmts: Vec<Expr>) -> Expr {
        let ty = stmts.last().map(|s| s.ty.clone()).unwrap_or(Type::Unit);
        self.expr(
            ty,
            ExprKind::Block {
                stmts,
                transparent: true,
            },
        )
    }

    pub fn typed_composite(&mut self, ty: Type, stmts: Vec<Expr>) -> Expr {
        self.expr(
            ty,
            ExprKind::Block {
                stmts,
                transparent: true,
            },
        )
    }

    pub fn if_then(&mut self, cond: Expr, then_branch: Expr) -> Expr {
        self.expr(
            Type::Unit,
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: None,
            },
        )
    }

    pub fn if_else(&mut self, cond: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
        let ty = if then_branch.ty.is_nothing() {
            else_branch.ty.clone()
        } else {
            then_branch.ty.clone()
        };
        self.expr(
            ty,
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Some(Box::new(else_branch)),
            },
        )
    }

    /// `when (subject) { label -> body .. else -> default }`. The result type
    /// is the type of the first case that can complete normally.
    pub fn when_expr(&mut self, subject: Expr, cases: Vec<(i64, Expr)>, default: Option<Expr>) -> Expr {
        let ty = cases
            .iter()
            .map(|(_, body)| &body.ty)
            .chain(default.as_ref().map(|d| &d.ty))
            .find(|ty| !ty.is_nothing())
            .cloned()
            .unwrap_or(Type::Nothing);
        let cases = cases
            .into_iter()
            .map(|(label, body)| SwitchCase {
                label: self.int(label),
                body,
            })
            .collect();
        self.expr(
            ty,
            ExprKind::Switch {
                subject: Box::new(subject),
                cases,
                default: default.map(Box::new),
            },
        )
    }

    /// Reserve the id of a loop so its body can `break`/`continue` to it.
    pub fn loop_id(&mut self) -> ExprId {
        self.module.fresh_expr_id()
    }

    /// `while (cond) body`. `id` comes from [`IrBuilder::loop_id`].
    pub fn while_loop(&mut self, id: ExprId, cond: Expr, body: Expr) -> Expr {
        Expr::new(
            id,
            Type::Unit,
            ExprKind::Loop {
                kind: LoopKind::While,
                label: None,
                cond: Box::new(cond),
                body: Box::new(body),
            },
        )
    }

    /// `do body while (cond)`. `id` comes from [`IrBuilder::loop_id`].
    pub fn do_while_loop(&mut self, id: ExprId, body: Expr, cond: Expr) -> Expr {
        Expr::new(
            id,
            Type::Unit,
            ExprKind::Loop {
                kind: LoopKind::DoWhile,
                label: None,
                cond: Box::new(cond),
                body: Box::new(body),
            },
        )
    }

    pub fn labeled_loop(&mut self, id: ExprId, label: &str, cond: Expr, body: Expr) -> Expr {
        Expr::new(
            id,
            Type::Unit,
            ExprKind::Loop {
                kind: LoopKind::While,
                label: Some(label.to_string()),
                cond: Box::new(cond),
                body: Box::new(body),
            },
        )
    }

    pub fn brk(&mut self, target: ExprId) -> Expr {
        self.expr(Type::Nothing, ExprKind::Break { target })
    }

    pub fn cont(&mut self, target: ExprId) -> Expr {
        self.expr(Type::Nothing, ExprKind::Continue { target })
    }

    pub fn ret(&mut self, target: DeclId, value: Expr) -> Expr {
        self.expr(
            Type::Nothing,
            ExprKind::Return {
                target,
                value: Box::new(value),
            },
        )
    }

    pub fn ret_unit(&mut self, target: DeclId) -> Expr {
        let unit = self.unit();
        self.ret(target, unit)
    }

    pub fn throw(&mut self, value: Expr) -> Expr {
        self.expr(Type::Nothing, ExprKind::Throw(Box::new(value)))
    }

    /// `try { body } catch ..` without a finally block.
    pub fn try_catch(&mut self, body: Expr, catches: Vec<Catch>) -> Expr {
        let ty = body.ty.clone();
        self.expr(
            ty,
            ExprKind::Try {
                body: Box::new(body),
                catches,
                finally: None,
            },
        )
    }

    pub fn try_finally(&mut self, body: Expr, catches: Vec<Catch>, finally: Expr) -> Expr {
        let ty = body.ty.clone();
        self.expr(
            ty,
            ExprKind::Try {
                body: Box::new(body),
                catches,
                finally: Some(Box::new(finally)),
            },
        )
    }

    // ===== Operators =====

    pub fn binary(&mut self, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        let ty = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => left.ty.clone(),
            _ => Type::Bool,
        };
        self.expr(
            ty,
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    pub fn identity_eq(&mut self, left: Expr, right: Expr) -> Expr {
        self.binary(BinaryOp::IdentityEq, left, right)
    }

    pub fn instance_of(&mut self, operand: Expr, target: Type) -> Expr {
        self.expr(
            Type::Bool,
            ExprKind::TypeOp {
                op: TypeOp::InstanceOf,
                operand: Box::new(operand),
                target,
            },
        )
    }

    pub fn cast(&mut self, operand: Expr, target: Type) -> Expr {
        self.expr(
            target.clone(),
            ExprKind::TypeOp {
                op: TypeOp::Cast,
                operand: Box::new(operand),
                target,
            },
        )
    }

    pub fn implicit_cast(&mut self, operand: Expr, target: Type) -> Expr {
        self.expr(
            target.clone(),
            ExprKind::TypeOp {
                op: TypeOp::ImplicitCast,
                operand: Box::new(operand),
                target,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut m = IrModule::new("m");
        let mut b = IrBuilder::new(&mut m);
        let a = b.int(1);
        let c = b.int(2);
        let sum = b.binary(BinaryOp::Add, a, c);
        let mut ids = Vec::new();
        sum.walk(&mut |e| ids.push(e.id));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_call_takes_callee_return_type() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let f = b.function(DeclParent::File(file), "f", FunctionDecl::new(Type::String));
        let call = b.call(f, vec![]);
        assert_eq!(call.ty, Type::String);
    }

    #[test]
    fn test_lambda_type_is_function_type() {
        let mut m = IrModule::new("m");
        let file = m.add_file("a.kt");
        let mut b = IrBuilder::new(&mut m);
        let outer = b.function(DeclParent::File(file), "outer", FunctionDecl::new(Type::Unit));
        let lambda = b.lambda_function(outer, Type::Int);
        b.param(lambda, "it", Type::Int);
        let e = b.lambda(lambda);
        assert_eq!(e.ty, Type::function(vec![Type::Int], Type::Int));
        assert!(b.module_ref().decl(lambda).is_lambda());
    }

    #[test]
    fn test_when_takes_type_of_completing_case() {
        let mut m = IrModule::new("m");
        let mut b = IrBuilder::new(&mut m);
        let subject = b.int(0);
        let boom = b.null();
        let fails = b.throw(boom);
        let two = b.int(2);
        let when = b.when_expr(subject, vec![(0, fails), (1, two)], None);
        assert_eq!(when.ty, Type::Int);
        let ExprKind::Switch { cases, default, .. } = &when.kind else {
            panic!("expected a switch");
        };
        assert!(matches!(cases[1].label.kind, ExprKind::Const(Const::Int(1))));
        assert!(default.is_none());
    }
}

//! Suspend tail calls.
//!
//! When every suspension point of a function is returned directly, nothing
//! of the caller survives the suspension: the stub can hand its own
//! `$completion` to the callee and return whatever the callee returns.

use crate::context::LoweringContext;
use crate::coroutines::classify::SuspendableNodes;
use crate::coroutines::stubs::{completion_param, get_or_create_function_with_continuation_stub};
use crate::error::{LowerError, LowerResult};
use corvid_ir::{Const, DeclId, Expr, ExprId, ExprKind, IrModule, Type, ValueDecl};
use rustc_hash::FxHashSet;

/// Suspension points of `stmts` in tail position, or `None` when at least
/// one point is not a tail call. `function` is the stub owning the body.
pub fn collect_tail_calls(
    module: &IrModule,
    stmts: &[Expr],
    nodes: &SuspendableNodes,
    function: DeclId,
) -> Option<FxHashSet<ExprId>> {
    // The stub returns `Any`; the declared type lives on `$completion`
    let returns_unit = completion_param(module, function)
        .map(|c| matches!(&module.var(c).ty, Type::Continuation(of) if of.is_unit()))
        .unwrap_or(false);
    let mut scan = TailScan {
        nodes,
        function,
        returns_unit,
        tails: FxHashSet::default(),
    };
    scan.stmts(stmts, false);
    let all_tail = nodes
        .suspension_points()
        .iter()
        .all(|p| scan.tails.contains(p));
    all_tail.then_some(scan.tails)
}

struct TailScan<'a> {
    nodes: &'a SuspendableNodes,
    function: DeclId,
    returns_unit: bool,
    tails: FxHashSet<ExprId>,
}

impl TailScan<'_> {
    /// A call that suspends but whose arguments do not.
    fn is_simple_point(&self, e: &Expr) -> bool {
        if !self.nodes.is_suspension_point(e.id) {
            return false;
        }
        let mut nested = false;
        e.visit_children(&mut |c| nested |= self.nodes.is_suspendable(c.id));
        !nested
    }

    fn is_unit_return(&self, e: &Expr) -> bool {
        matches!(&e.kind, ExprKind::Return { target, value }
            if *target == self.function && matches!(value.kind, ExprKind::Const(Const::Unit)))
    }

    fn stmts(&mut self, stmts: &[Expr], in_try: bool) {
        for (i, stmt) in stmts.iter().enumerate() {
            if !in_try {
                match &stmt.kind {
                    ExprKind::Return { target, value }
                        if *target == self.function && self.is_simple_point(value) =>
                    {
                        self.tails.insert(value.id);
                    }
                    _ if self.returns_unit
                        && self.is_simple_point(stmt)
                        && stmts.get(i + 1).is_some_and(|next| self.is_unit_return(next)) =>
                    {
                        self.tails.insert(stmt.id);
                    }
                    _ => {}
                }
            }
            self.node(stmt, in_try);
        }
    }

    fn node(&mut self, e: &Expr, in_try: bool) {
        match &e.kind {
            ExprKind::Block { stmts, .. } => self.stmts(stmts, in_try),
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                self.branch(body, true);
                for catch in catches {
                    self.branch(&catch.body, true);
                }
                if let Some(finally) = finally {
                    self.branch(finally, true);
                }
            }
            ExprKind::Lambda { .. } | ExprKind::Declaration(_) => {}
            _ => e.visit_children(&mut |c| self.branch(c, in_try)),
        }
    }

    fn branch(&mut self, e: &Expr, in_try: bool) {
        match &e.kind {
            ExprKind::Block { .. } => self.node(e, in_try),
            _ => self.stmts(std::slice::from_ref(e), in_try),
        }
    }
}

/// Rewrite the tail calls of `stmts` to forward the `$completion` of `stub`.
pub fn rewrite_tail_calls(
    cx: &mut LoweringContext<'_>,
    stmts: &mut Vec<Expr>,
    stub: DeclId,
    tails: &FxHashSet<ExprId>,
) -> LowerResult<()> {
    let completion = completion_param(cx.module, stub).ok_or_else(|| {
        LowerError::precondition(cx.module.render_decl(stub), "stub has no completion parameter")
    })?;
    let expected = match &cx.module.var(completion).ty {
        Type::Continuation(of) => (**of).clone(),
        other => other.clone(),
    };
    let mut rewriter = TailRewriter {
        stub,
        completion,
        expected,
        tails,
    };
    rewriter.stmts(cx, stmts)
}

struct TailRewriter<'a> {
    stub: DeclId,
    completion: corvid_ir::VarId,
    /// Declared return type of the original function.
    expected: Type,
    tails: &'a FxHashSet<ExprId>,
}

impl TailRewriter<'_> {
    fn stmts(&mut self, cx: &mut LoweringContext<'_>, stmts: &mut Vec<Expr>) -> LowerResult<()> {
        let mut i = 0;
        while i < stmts.len() {
            if self.tails.contains(&stmts[i].id) {
                // `call(); return Unit` becomes `return call()`
                let call = std::mem::replace(&mut stmts[i], Expr::placeholder());
                let delegated = self.delegate(cx, call, &Type::Unit)?;
                stmts[i] = cx.builder().ret(self.stub, delegated);
                if stmts.get(i + 1).is_some_and(|next| matches!(next.kind, ExprKind::Return { .. })) {
                    stmts.remove(i + 1);
                }
            } else {
                self.node(cx, &mut stmts[i])?;
            }
            i += 1;
        }
        Ok(())
    }

    fn node(&mut self, cx: &mut LoweringContext<'_>, e: &mut Expr) -> LowerResult<()> {
        match &mut e.kind {
            ExprKind::Block { stmts, .. } => self.stmts(cx, stmts),
            ExprKind::Return { value, .. } if self.tails.contains(&value.id) => {
                let call = std::mem::replace(&mut **value, Expr::placeholder());
                let expected = self.expected.clone();
                **value = self.delegate(cx, call, &expected)?;
                Ok(())
            }
            ExprKind::Lambda { .. } | ExprKind::Declaration(_) => Ok(()),
            _ => {
                let mut result = Ok(());
                e.visit_children_mut(&mut |c| {
                    if result.is_ok() {
                        result = self.node(cx, c);
                    }
                });
                result
            }
        }
    }

    /// Retarget `call` to its stub, pass `$completion` on, and wrap the result.
    fn delegate(&mut self, cx: &mut LoweringContext<'_>, call: Expr, expected: &Type) -> LowerResult<Expr> {
        let Expr { id, ty: from, kind } = call;
        let completion = cx.builder().get(self.completion);
        let kind = match kind {
            ExprKind::Call { callee, mut args } => {
                let stub = get_or_create_function_with_continuation_stub(cx, callee)?;
                args.push(completion);
                ExprKind::Call { callee: stub, args }
            }
            ExprKind::Invoke { callee, mut args } => {
                args.push(completion);
                ExprKind::Invoke { callee, args }
            }
            _ => {
                return Err(LowerError::internal(
                    "tail call delegation",
                    format!("tail call {id} is not a call"),
                ))
            }
        };
        let call = Expr::new(id, Type::nullable_any(), kind);
        Ok(generate_delegated_call(cx, expected, &from, call, self.stub))
    }
}

/// Conversions a delegated result needs before it can be returned as
/// `expected`.
pub fn needs_unboxing_or_unit(from: &Type, expected: &Type) -> bool {
    (from.is_unit() && !expected.is_unit())
        || (expected.is_unit() && !from.is_unit())
        || (expected.is_primitive() && from != expected)
}

/// Wrap a call returning the suspended sentinel or a value of type `from`:
///
/// ```text
/// val tmp = call
/// if (tmp === SUSPENDED) return tmp
/// tmp as expected        // or Unit
/// ```
///
/// The sentinel check comes before the conversion. Calls needing no
/// conversion are returned unchanged.
pub fn generate_delegated_call(
    cx: &mut LoweringContext<'_>,
    expected: &Type,
    from: &Type,
    call: Expr,
    return_target: DeclId,
) -> Expr {
    if !needs_unboxing_or_unit(from, expected) {
        return call;
    }
    let tmp = cx
        .module
        .add_var(ValueDecl::local("tmp", Type::nullable_any(), false));
    let mut b = cx.builder();
    let decl = b.decl_var(tmp, Some(call));
    let read = b.get(tmp);
    let sentinel = b.suspended();
    let suspended = b.identity_eq(read, sentinel);
    let read = b.get(tmp);
    let leave = b.ret(return_target, read);
    let check = b.if_then(suspended, leave);
    let value = if expected.is_unit() {
        b.unit()
    } else {
        let read = b.get(tmp);
        b.implicit_cast(read, expected.clone())
    };
    b.typed_composite(expected.clone(), vec![decl, check, value])
}
